//! Configuration schema definitions.
//!
//! This module defines the structure of the egress-proxy configuration file.
//! Every field is optional in a file so that layers can be merged; the
//! accessors on [`Config`] apply the built-in defaults.
//!
//! ```toml
//! [listen]
//! http = "0.0.0.0:38000"
//! tls = "127.0.0.1:38443"
//!
//! [acl]
//! allowed_hosts = ['^internal\.example\.com$']
//!
//! [ca]
//! cert = "/etc/egress-proxy/ca.pem"
//! key = "/etc/egress-proxy/ca.key"
//! country = "NZ"
//! province = "Wellington"
//! locality = "Wellington"
//! organization = "Example"
//! organizational_unit = "Egress"
//!
//! [limits]
//! handshake_timeout_secs = 5
//! upstream_timeout_secs = 60
//!
//! [telemetry]
//! syslog = false
//! log_level = "info"
//! ```

use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use super::error::ConfigError;
use crate::ca::SubjectTemplate;
use crate::proxy::ConnectionLimits;

/// Default front proxy listen address.
pub const DEFAULT_HTTP_LISTEN_ADDR: &str = "0.0.0.0:38000";

/// Default tunnel terminator listen address.
pub const DEFAULT_TLS_LISTEN_ADDR: &str = "127.0.0.1:38443";

/// Default tunnel handshake/read deadline in seconds.
pub const DEFAULT_HANDSHAKE_TIMEOUT_SECS: u64 = 5;

/// Default bound on outbound calls in seconds.
pub const DEFAULT_UPSTREAM_TIMEOUT_SECS: u64 = 60;

/// Top-level configuration structure.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Listener addresses.
    #[serde(default)]
    pub listen: ListenConfig,

    /// Allow-list patterns.
    #[serde(default)]
    pub acl: AclConfig,

    /// Root CA material and leaf subject.
    #[serde(default)]
    pub ca: CaConfig,

    /// Deadlines and concurrency.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Logging settings.
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

impl Config {
    /// Merge another config into this one.
    ///
    /// Lists (ACL patterns) are merged (appended).
    /// Scalars (addresses, timeouts, CA fields) are overridden when set.
    pub fn merge(&mut self, other: Config) {
        self.listen.merge(other.listen);
        self.acl.merge(other.acl);
        self.ca.merge(other.ca);
        self.limits.merge(other.limits);
        self.telemetry.merge(other.telemetry);
    }

    /// Front proxy listen address.
    pub fn http_listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        parse_listen_addr(
            "listen.http",
            self.listen.http.as_deref().unwrap_or(DEFAULT_HTTP_LISTEN_ADDR),
        )
    }

    /// Tunnel terminator listen address.
    pub fn tls_listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        parse_listen_addr(
            "listen.tls",
            self.listen.tls.as_deref().unwrap_or(DEFAULT_TLS_LISTEN_ADDR),
        )
    }

    /// Deadlines and concurrency cap with defaults applied.
    pub fn connection_limits(&self) -> Result<ConnectionLimits, ConfigError> {
        let handshake = self
            .limits
            .handshake_timeout_secs
            .unwrap_or(DEFAULT_HANDSHAKE_TIMEOUT_SECS);
        let upstream = self
            .limits
            .upstream_timeout_secs
            .unwrap_or(DEFAULT_UPSTREAM_TIMEOUT_SECS);

        if handshake == 0 {
            return Err(ConfigError::InvalidValue {
                field: "limits.handshake_timeout_secs".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }
        if upstream == 0 {
            return Err(ConfigError::InvalidValue {
                field: "limits.upstream_timeout_secs".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }
        if self.limits.max_connections == Some(0) {
            return Err(ConfigError::InvalidValue {
                field: "limits.max_connections".to_string(),
                message: "must be greater than zero when set".to_string(),
            });
        }

        Ok(ConnectionLimits {
            handshake_timeout: Duration::from_secs(handshake),
            upstream_timeout: Duration::from_secs(upstream),
            max_connections: self.limits.max_connections,
        })
    }

    /// Leaf certificate subject fields.
    ///
    /// Missing fields come back empty; the CA rejects them.
    pub fn subject_template(&self) -> SubjectTemplate {
        let field = |v: &Option<String>| v.clone().unwrap_or_default();
        SubjectTemplate {
            country: field(&self.ca.country),
            province: field(&self.ca.province),
            locality: field(&self.ca.locality),
            organization: field(&self.ca.organization),
            organizational_unit: field(&self.ca.organizational_unit),
        }
    }

    /// Root certificate PEM, read from disk if configured as a path.
    pub fn ca_cert_pem(&self) -> Result<String, ConfigError> {
        resolve_pem("ca.cert", self.ca.cert.as_deref())
    }

    /// Root private key PEM, read from disk if configured as a path.
    pub fn ca_key_pem(&self) -> Result<String, ConfigError> {
        resolve_pem("ca.key", self.ca.key.as_deref())
    }
}

/// Listener addresses.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ListenConfig {
    /// Front proxy address (`host:port` or `:port`).
    #[serde(default)]
    pub http: Option<String>,

    /// Tunnel terminator address (`host:port` or `:port`).
    #[serde(default)]
    pub tls: Option<String>,
}

impl ListenConfig {
    fn merge(&mut self, other: ListenConfig) {
        if other.http.is_some() {
            self.http = other.http;
        }
        if other.tls.is_some() {
            self.tls = other.tls;
        }
    }
}

/// Allow-list patterns.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AclConfig {
    /// Regular expressions matched against the destination hostname.
    #[serde(default)]
    pub allowed_hosts: Vec<String>,

    /// Regular expressions matched against the full destination URL.
    #[serde(default)]
    pub allowed_urls: Vec<String>,
}

impl AclConfig {
    fn merge(&mut self, other: AclConfig) {
        self.allowed_hosts.extend(other.allowed_hosts);
        self.allowed_urls.extend(other.allowed_urls);
    }
}

/// Root CA material and leaf subject fields.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct CaConfig {
    /// Root certificate: inline PEM or a path to a PEM file.
    #[serde(default)]
    pub cert: Option<String>,

    /// Root Ed25519 private key: inline PEM or a path to a PEM file.
    #[serde(default)]
    pub key: Option<String>,

    /// Subject country (C).
    #[serde(default)]
    pub country: Option<String>,

    /// Subject state or province (ST).
    #[serde(default)]
    pub province: Option<String>,

    /// Subject locality (L).
    #[serde(default)]
    pub locality: Option<String>,

    /// Subject organization (O).
    #[serde(default)]
    pub organization: Option<String>,

    /// Subject organizational unit (OU).
    #[serde(default)]
    pub organizational_unit: Option<String>,
}

impl CaConfig {
    fn merge(&mut self, other: CaConfig) {
        let fields = [
            (&mut self.cert, other.cert),
            (&mut self.key, other.key),
            (&mut self.country, other.country),
            (&mut self.province, other.province),
            (&mut self.locality, other.locality),
            (&mut self.organization, other.organization),
            (&mut self.organizational_unit, other.organizational_unit),
        ];
        for (slot, value) in fields {
            if value.is_some() {
                *slot = value;
            }
        }
    }
}

/// Deadlines and concurrency settings.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct LimitsConfig {
    /// Tunnel deadline covering handshake and request read.
    #[serde(default)]
    pub handshake_timeout_secs: Option<u64>,

    /// Bound on each outbound call including the response relay.
    #[serde(default)]
    pub upstream_timeout_secs: Option<u64>,

    /// Concurrent connections per listener. Unbounded when absent.
    #[serde(default)]
    pub max_connections: Option<usize>,
}

impl LimitsConfig {
    fn merge(&mut self, other: LimitsConfig) {
        if other.handshake_timeout_secs.is_some() {
            self.handshake_timeout_secs = other.handshake_timeout_secs;
        }
        if other.upstream_timeout_secs.is_some() {
            self.upstream_timeout_secs = other.upstream_timeout_secs;
        }
        if other.max_connections.is_some() {
            self.max_connections = other.max_connections;
        }
    }
}

/// Logging settings.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TelemetryConfig {
    /// Send audit events to syslog instead of the tracing output.
    #[serde(default)]
    pub syslog: Option<bool>,

    /// Log level: trace, debug, info, warn, error
    #[serde(default)]
    pub log_level: Option<String>,
}

impl TelemetryConfig {
    fn merge(&mut self, other: TelemetryConfig) {
        if other.syslog.is_some() {
            self.syslog = other.syslog;
        }
        if other.log_level.is_some() {
            self.log_level = other.log_level;
        }
    }
}

/// Parse a listen address, accepting the `:PORT` shorthand for all interfaces.
pub fn parse_listen_addr(field: &str, value: &str) -> Result<SocketAddr, ConfigError> {
    let value = value.trim();

    if let Some(port) = value.strip_prefix(':') {
        let port = port.parse::<u16>().map_err(|_| ConfigError::InvalidValue {
            field: field.to_string(),
            message: format!("invalid port in '{}'", value),
        })?;
        return Ok(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)));
    }

    value.parse().map_err(|_| ConfigError::InvalidValue {
        field: field.to_string(),
        message: format!("'{}' is not a socket address", value),
    })
}

/// Split a newline-separated pattern list.
///
/// Trailing `\r` is stripped and blank lines are skipped.
pub fn split_patterns(text: &str) -> Vec<String> {
    text.split('\n')
        .map(|line| line.trim_end_matches('\r'))
        .filter(|line| !line.trim().is_empty())
        .map(str::to_string)
        .collect()
}

/// Resolve a PEM value that is either inline text or a file path.
fn resolve_pem(field: &str, value: Option<&str>) -> Result<String, ConfigError> {
    let value = value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ConfigError::MissingValue(field.to_string()))?;

    if value.starts_with("-----BEGIN") {
        return Ok(value.to_string());
    }

    let path = PathBuf::from(value);
    std::fs::read_to_string(&path).map_err(|source| ConfigError::ReadError { path, source })
}
