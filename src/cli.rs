//! Command-line interface definitions for egress-proxy.
//!
//! Uses clap's derive API for type-safe argument parsing. Every setting can
//! also come from the environment variable named next to it, which is how the
//! proxy is usually deployed.

use clap::Parser;
use std::path::PathBuf;

/// Egress proxy with allow-list enforcement and on-demand TLS interception.
///
/// Internal clients send their HTTP and HTTPS traffic here. Destinations are
/// checked against host or URL regular expressions; HTTPS tunnels are
/// decrypted with short-lived certificates signed by a locally trusted CA so
/// the request inside can be checked and re-issued.
#[derive(Parser, Debug, Default)]
#[command(name = "egress-proxy")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Front proxy listen address (`host:port` or `:port`).
    #[arg(long, env = "HTTP_LISTEN_ADDR", value_name = "ADDR")]
    pub http_listen_addr: Option<String>,

    /// Tunnel terminator listen address (`host:port` or `:port`).
    #[arg(long, env = "TLS_LISTEN_ADDR", value_name = "ADDR")]
    pub tls_listen_addr: Option<String>,

    /// Newline-separated regular expressions matched against hostnames.
    ///
    /// When set, `--allowed-urls` is ignored.
    #[arg(long, env = "ALLOWED_HOSTS", value_name = "PATTERNS")]
    pub allowed_hosts: Option<String>,

    /// Newline-separated regular expressions matched against full URLs.
    #[arg(long, env = "ALLOWED_URLS", value_name = "PATTERNS")]
    pub allowed_urls: Option<String>,

    /// Root CA certificate: inline PEM or path to a PEM file.
    #[arg(long, env = "CA_CERT", value_name = "PEM|PATH", hide_env_values = true)]
    pub ca_cert: Option<String>,

    /// Root CA Ed25519 private key: inline PEM or path to a PEM file.
    #[arg(long, env = "CA_KEY", value_name = "PEM|PATH", hide_env_values = true)]
    pub ca_key: Option<String>,

    /// Country (C) for issued certificates.
    #[arg(long, env = "CA_COUNTRY", value_name = "C")]
    pub ca_country: Option<String>,

    /// State or province (ST) for issued certificates.
    #[arg(long, env = "CA_PROVINCE", value_name = "ST")]
    pub ca_province: Option<String>,

    /// Locality (L) for issued certificates.
    #[arg(long, env = "CA_LOCALITY", value_name = "L")]
    pub ca_locality: Option<String>,

    /// Organization (O) for issued certificates.
    #[arg(long = "ca-organization", env = "CA_O", value_name = "O")]
    pub ca_organization: Option<String>,

    /// Organizational unit (OU) for issued certificates.
    #[arg(long = "ca-organizational-unit", env = "CA_OU", value_name = "OU")]
    pub ca_organizational_unit: Option<String>,

    /// Deadline in seconds for the tunnel handshake plus request read.
    #[arg(long, value_name = "SECS")]
    pub handshake_timeout: Option<u64>,

    /// Bound in seconds on every outbound call.
    #[arg(long, value_name = "SECS")]
    pub upstream_timeout: Option<u64>,

    /// Maximum concurrent connections per listener (unbounded if unset).
    #[arg(long, value_name = "N")]
    pub max_connections: Option<usize>,

    /// Path to additional config file.
    ///
    /// Merged on top of the system config, below CLI flags and environment.
    #[arg(short = 'c', long = "config", value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Send audit events to the local syslog daemon.
    #[arg(long = "syslog")]
    pub syslog: bool,

    /// Increase log verbosity.
    ///
    /// Can be specified multiple times:
    /// -v    = info level
    /// -vv   = debug level
    /// -vvv  = trace level
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_flags() {
        let cli = Cli::try_parse_from([
            "egress-proxy",
            "--http-listen-addr",
            ":9000",
            "--allowed-hosts",
            "^a\\.com$",
            "--ca-organization",
            "Example",
            "--max-connections",
            "64",
            "-vv",
            "--syslog",
        ])
        .unwrap();

        assert_eq!(cli.http_listen_addr.as_deref(), Some(":9000"));
        assert_eq!(cli.allowed_hosts.as_deref(), Some("^a\\.com$"));
        assert_eq!(cli.ca_organization.as_deref(), Some("Example"));
        assert_eq!(cli.max_connections, Some(64));
        assert_eq!(cli.verbose, 2);
        assert!(cli.syslog);
    }

    #[test]
    fn test_config_flag() {
        let cli = Cli::try_parse_from(["egress-proxy", "-c", "/tmp/proxy.toml"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/proxy.toml")));
    }

    #[test]
    fn test_cli_definition_is_valid() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
