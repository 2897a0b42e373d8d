//! Proxy startup and lifecycle management.
//!
//! This module validates the merged configuration, builds the shared
//! immutable state (allow-list, CA), binds both listeners and supervises
//! them until shutdown.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use anyhow::{Context, Result};
use rustls::ClientConfig;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_rustls::TlsConnector;
use tracing::{debug, error, info};

use crate::ca::{CaError, CertificateAuthority};
use crate::config::{Config, ConfigError};
use crate::proxy::{
    native_client_config, AclEngine, AclError, ConnectionLimits, FrontProxy, FrontProxyConfig,
    ProxyError, ProxyResult, TunnelConfig, TunnelStats, TunnelTerminator,
};
use crate::telemetry::{AuditEvent, AuditLogger, TelemetryError};

/// Errors that abort startup before anything serves traffic.
#[derive(Debug, Error)]
pub enum StartupError {
    /// Configuration could not be read or is invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// An allow-list pattern does not compile.
    #[error(transparent)]
    Acl(#[from] AclError),

    /// CA material or subject fields are unusable.
    #[error("Certificate authority: {0}")]
    Ca(#[from] CaError),

    /// A listener could not be bound.
    #[error("Failed to bind {listener} listener on {addr}: {source}")]
    Bind {
        /// Which listener failed.
        listener: &'static str,
        /// Requested address.
        addr: SocketAddr,
        /// Underlying error.
        source: ProxyError,
    },

    /// The outbound TLS client could not be built.
    #[error("Failed to build upstream TLS client: {0}")]
    UpstreamTls(ProxyError),

    /// The audit sink could not be opened.
    #[error(transparent)]
    Telemetry(#[from] TelemetryError),
}

/// Validated, immutable state shared by both listeners.
#[derive(Debug, Clone)]
pub struct ProxyContext {
    /// Compiled allow-list.
    pub acl: Arc<AclEngine>,
    /// Leaf certificate issuer.
    pub ca: Arc<CertificateAuthority>,
    /// Front proxy listen address.
    pub http_addr: SocketAddr,
    /// Tunnel terminator listen address.
    pub tls_addr: SocketAddr,
    /// Deadlines and concurrency cap.
    pub limits: ConnectionLimits,
    /// Audit sink.
    pub audit: Arc<AuditLogger>,
}

impl ProxyContext {
    /// Validate the configuration and build the shared state.
    ///
    /// Every startup check runs here: addresses, limits, regexes, CA
    /// material and subject fields. Nothing is bound.
    pub fn initialize(config: &Config, audit: Arc<AuditLogger>) -> Result<Self, StartupError> {
        let http_addr = config.http_listen_addr()?;
        let tls_addr = config.tls_listen_addr()?;
        let limits = config.connection_limits()?;

        let acl = AclEngine::load(&config.acl.allowed_hosts, &config.acl.allowed_urls)?;
        if acl.is_empty() {
            info!("Allow-list is empty; every destination will be denied");
        }

        let ca = CertificateAuthority::from_pem(
            &config.ca_cert_pem()?,
            &config.ca_key_pem()?,
            config.subject_template(),
        )?;

        debug!(
            "Initialized context: {} host rules, {} url rules, limits {:?}",
            acl.host_rule_count(),
            acl.url_rule_count(),
            limits
        );

        Ok(Self {
            acl: Arc::new(acl),
            ca: Arc::new(ca),
            http_addr,
            tls_addr,
            limits,
            audit,
        })
    }
}

/// Both listeners, bound and serving.
pub struct RunningProxy {
    front_addr: SocketAddr,
    tunnel_addr: SocketAddr,
    tunnel_stats: Arc<TunnelStats>,
    shutdown_tx: watch::Sender<bool>,
    front: JoinHandle<ProxyResult<()>>,
    tunnel: JoinHandle<ProxyResult<()>>,
    audit: Arc<AuditLogger>,
    started: Instant,
}

impl RunningProxy {
    /// Bound address of the front proxy.
    pub fn front_addr(&self) -> SocketAddr {
        self.front_addr
    }

    /// Bound address of the tunnel terminator.
    pub fn tunnel_addr(&self) -> SocketAddr {
        self.tunnel_addr
    }

    /// Tunnel terminator counters.
    pub fn tunnel_stats(&self) -> Arc<TunnelStats> {
        self.tunnel_stats.clone()
    }

    /// Stop both accept loops and wait for them to return.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);

        for (name, handle) in [("front proxy", self.front), ("tunnel terminator", self.tunnel)] {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("{} exited with error: {}", name, e),
                Err(e) => error!("{} task failed: {}", name, e),
            }
        }

        self.audit.log(AuditEvent::ProxyStop {
            uptime_sec: self.started.elapsed().as_secs(),
        });
    }
}

/// Bind both listeners and start serving.
///
/// The tunnel terminator is bound first so the front proxy can be pointed
/// at its actual address (an ephemeral port or wildcard IP resolves to a
/// dialable one). `upstream_tls` verifies every origin either listener
/// connects to over TLS.
pub async fn start(
    context: ProxyContext,
    upstream_tls: Arc<ClientConfig>,
) -> Result<RunningProxy, StartupError> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let tunnel = TunnelTerminator::bind(
        TunnelConfig {
            listen_addr: context.tls_addr,
            ca: context.ca.clone(),
            acl: context.acl.clone(),
            connector: TlsConnector::from(upstream_tls.clone()),
            audit: context.audit.clone(),
            limits: context.limits,
        },
        shutdown_rx.clone(),
    )
    .await
    .map_err(|source| StartupError::Bind {
        listener: "tunnel",
        addr: context.tls_addr,
        source,
    })?;

    let tunnel_addr = tunnel.local_addr().map_err(|source| StartupError::Bind {
        listener: "tunnel",
        addr: context.tls_addr,
        source,
    })?;

    let front = FrontProxy::bind(
        FrontProxyConfig {
            listen_addr: context.http_addr,
            tunnel_addr: dialable(tunnel_addr),
            acl: context.acl.clone(),
            audit: context.audit.clone(),
            limits: context.limits,
            upstream_tls,
        },
        shutdown_rx,
    )
    .await
    .map_err(|source| StartupError::Bind {
        listener: "front",
        addr: context.http_addr,
        source,
    })?;

    let front_addr = front.local_addr().map_err(|source| StartupError::Bind {
        listener: "front",
        addr: context.http_addr,
        source,
    })?;

    let tunnel_stats = tunnel.stats();

    context.audit.log(AuditEvent::ProxyStart {
        front_addr: front_addr.to_string(),
        tunnel_addr: tunnel_addr.to_string(),
        host_rules: context.acl.host_rule_count(),
        url_rules: context.acl.url_rule_count(),
        pid: std::process::id(),
    });

    Ok(RunningProxy {
        front_addr,
        tunnel_addr,
        tunnel_stats,
        shutdown_tx,
        front: tokio::spawn(front.run()),
        tunnel: tokio::spawn(tunnel.run()),
        audit: context.audit,
        started: Instant::now(),
    })
}

/// Run the proxy until Ctrl-C.
pub async fn run(context: ProxyContext) -> Result<()> {
    let upstream_tls = native_client_config()
        .map_err(StartupError::UpstreamTls)
        .context("Failed to load system trust roots")?;

    let proxy = start(context, upstream_tls)
        .await
        .context("Failed to start listeners")?;

    info!(
        "Proxy running: front {} / tunnel {}",
        proxy.front_addr(),
        proxy.tunnel_addr()
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;

    info!("Shutdown signal received");
    let stats = proxy.tunnel_stats().snapshot();
    proxy.shutdown().await;
    info!("Tunnel totals: {:?}", stats);

    Ok(())
}

/// Replace a wildcard IP with loopback so the address can be connected to.
fn dialable(addr: SocketAddr) -> SocketAddr {
    match addr.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => {
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), addr.port())
        }
        IpAddr::V6(ip) if ip.is_unspecified() => {
            SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), addr.port())
        }
        _ => addr,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ca::test_support;
    use crate::proxy::client_config_with_roots;
    use rustls::RootCertStore;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    fn valid_config() -> Config {
        let (cert_pem, key_pem) = test_support::root_pem();
        let subject = test_support::subject();

        let mut config = Config::default();
        config.listen.http = Some("127.0.0.1:0".to_string());
        config.listen.tls = Some("127.0.0.1:0".to_string());
        config.acl.allowed_hosts = vec![r"^allowed\.test$".to_string()];
        config.ca.cert = Some(cert_pem);
        config.ca.key = Some(key_pem);
        config.ca.country = Some(subject.country);
        config.ca.province = Some(subject.province);
        config.ca.locality = Some(subject.locality);
        config.ca.organization = Some(subject.organization);
        config.ca.organizational_unit = Some(subject.organizational_unit);
        config
    }

    #[test]
    fn test_initialize_valid() {
        let context =
            ProxyContext::initialize(&valid_config(), Arc::new(AuditLogger::new_null())).unwrap();
        assert_eq!(context.acl.host_rule_count(), 1);
        assert_eq!(context.http_addr.ip(), IpAddr::V4(Ipv4Addr::LOCALHOST));
    }

    #[test]
    fn test_initialize_rejects_empty_subject_field() {
        let mut config = valid_config();
        config.ca.organizational_unit = Some(String::new());

        let err = ProxyContext::initialize(&config, Arc::new(AuditLogger::new_null())).unwrap_err();
        assert!(matches!(err, StartupError::Ca(CaError::EmptySubjectField(_))));
    }

    #[test]
    fn test_initialize_rejects_bad_regex() {
        let mut config = valid_config();
        config.acl.allowed_urls = vec!["(unclosed".to_string()];

        let err = ProxyContext::initialize(&config, Arc::new(AuditLogger::new_null())).unwrap_err();
        assert!(matches!(err, StartupError::Acl(_)));
    }

    #[test]
    fn test_initialize_requires_ca_material() {
        let mut config = valid_config();
        config.ca.key = None;

        let err = ProxyContext::initialize(&config, Arc::new(AuditLogger::new_null())).unwrap_err();
        assert!(matches!(err, StartupError::Config(ConfigError::MissingValue(_))));
    }

    #[test]
    fn test_dialable() {
        assert_eq!(
            dialable("0.0.0.0:38443".parse().unwrap()),
            "127.0.0.1:38443".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(
            dialable("[::]:1".parse().unwrap()),
            "[::1]:1".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(
            dialable("10.0.0.1:5".parse().unwrap()),
            "10.0.0.1:5".parse::<SocketAddr>().unwrap()
        );
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let context =
            ProxyContext::initialize(&valid_config(), Arc::new(AuditLogger::new_null())).unwrap();
        let proxy = start(context, client_config_with_roots(RootCertStore::empty()))
            .await
            .unwrap();

        assert_ne!(proxy.front_addr().port(), 0);
        assert_ne!(proxy.tunnel_addr().port(), 0);

        // Denied CONNECT proves the front proxy is serving
        let mut stream = TcpStream::connect(proxy.front_addr()).await.unwrap();
        stream
            .write_all(b"CONNECT denied.test:443 HTTP/1.1\r\nHost: denied.test:443\r\n\r\n")
            .await
            .unwrap();
        let mut buf = vec![0u8; 1024];
        let n = stream.read(&mut buf).await.unwrap();
        assert!(String::from_utf8_lossy(&buf[..n]).starts_with("HTTP/1.1 403"));

        tokio::time::timeout(std::time::Duration::from_secs(5), proxy.shutdown())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_bind_conflict_is_startup_error() {
        let taken = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut config = valid_config();
        config.listen.http = Some(taken.local_addr().unwrap().to_string());

        let context =
            ProxyContext::initialize(&config, Arc::new(AuditLogger::new_null())).unwrap();
        let err = start(context, client_config_with_roots(RootCertStore::empty()))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, StartupError::Bind { listener: "front", .. }));
    }
}
