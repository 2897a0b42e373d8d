//! TLS configuration for the tunnel terminator.
//!
//! This module provides:
//! - SNI-driven certificate issuance during the handshake
//! - TLS acceptor for tunnel connections (proxy as server)
//! - TLS connector for outbound connections (proxy as client)
//!
//! # Issuance
//!
//! Every handshake asks the [`CertificateAuthority`] for a brand new leaf.
//! Nothing is cached: two handshakes for the same name get two different
//! keys and serials. A ClientHello without SNI gets no certificate and the
//! handshake fails.
//!
//! # Critical ALPN Note
//!
//! The tunnel reads exactly one HTTP/1.x request and relays the upstream
//! response as raw bytes, neither of which works with H2 framing. The
//! acceptor therefore negotiates no ALPN protocol at all: a client offering
//! only `h2` still completes the handshake and falls back to HTTP/1.1. The
//! outbound connector offers only `http/1.1`.
//!
//! # Example
//!
//! ```ignore
//! use egress_proxy::proxy::tls::{create_tls_acceptor, native_client_config, IssuingCertResolver};
//!
//! let resolver = Arc::new(IssuingCertResolver::new(ca, stats, audit));
//! let acceptor = create_tls_acceptor(resolver);
//! let connector = TlsConnector::from(native_client_config()?);
//! ```

use super::error::{ProxyError, ProxyResult};
use super::tunnel::TunnelStats;
use crate::ca::{CertificateAuthority, IssuedCertificate};
use crate::telemetry::{AuditEvent, AuditLogger};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use rustls_pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, trace, warn};

/// ALPN protocol offered to upstream servers.
const ALPN_HTTP11: &[u8] = b"http/1.1";

/// Certificate resolver that mints a leaf for every handshake.
///
/// This implements rustls's `ResolvesServerCert` trait. The call happens
/// synchronously inside the handshake, so the handshake waits for signing.
pub struct IssuingCertResolver {
    ca: Arc<CertificateAuthority>,
    stats: Arc<TunnelStats>,
    audit: Arc<AuditLogger>,
}

impl IssuingCertResolver {
    /// Create a resolver backed by `ca`.
    pub fn new(
        ca: Arc<CertificateAuthority>,
        stats: Arc<TunnelStats>,
        audit: Arc<AuditLogger>,
    ) -> Self {
        Self { ca, stats, audit }
    }

    /// Issue a leaf for `server_name` and convert it for rustls.
    pub fn issue(&self, server_name: &str) -> ProxyResult<Arc<CertifiedKey>> {
        let issued = self.ca.issue(server_name)?;
        let key = certified_key(&issued)?;

        self.stats.record_certificate_issued();
        self.audit.log(AuditEvent::CertificateIssued {
            dns_name: issued.dns_name,
            serial: issued.serial,
        });

        Ok(key)
    }
}

impl ResolvesServerCert for IssuingCertResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let Some(server_name) = client_hello.server_name() else {
            warn!("Rejecting handshake without SNI");
            return None;
        };

        trace!("Resolving certificate for: {}", server_name);

        match self.issue(server_name) {
            Ok(key) => Some(key),
            // Bad names from a client only cost that client its handshake
            Err(ProxyError::CertIssuance(e)) if !e.is_startup() => {
                warn!("Cannot issue certificate for {}: {}", server_name, e);
                None
            }
            Err(e) => {
                error!("Failed to issue certificate for {}: {}", server_name, e);
                None
            }
        }
    }
}

// Required for Arc<IssuingCertResolver> to implement ResolvesServerCert
impl std::fmt::Debug for IssuingCertResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssuingCertResolver")
            .field("ca", &self.ca)
            .field("issued", &self.stats.snapshot().certificates_issued)
            .finish()
    }
}

/// Convert an issued leaf into a rustls certified key.
pub fn certified_key(issued: &IssuedCertificate) -> ProxyResult<Arc<CertifiedKey>> {
    let cert_chain: Vec<CertificateDer<'static>> =
        rustls_pemfile::certs(&mut issued.cert_pem.as_bytes())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| ProxyError::Tls(format!("Failed to parse certificate PEM: {}", e)))?;

    if cert_chain.is_empty() {
        return Err(ProxyError::Tls("No certificates found in PEM".into()));
    }

    let private_key: PrivateKeyDer<'static> =
        rustls_pemfile::private_key(&mut issued.key_pem.as_bytes())
            .map_err(|e| ProxyError::Tls(format!("Failed to parse private key PEM: {}", e)))?
            .ok_or_else(|| ProxyError::Tls("No private key found in PEM".into()))?;

    let signing_key = rustls::crypto::aws_lc_rs::sign::any_supported_type(&private_key)
        .map_err(|e| ProxyError::Tls(format!("Failed to create signing key: {}", e)))?;

    Ok(Arc::new(CertifiedKey::new(cert_chain, signing_key)))
}

/// Create a TLS acceptor for tunnel connections.
///
/// The proxy acts as the server, presenting a leaf minted by `resolver`.
/// No ALPN protocols are configured, so whatever the client offers the
/// handshake proceeds without one.
pub fn create_tls_acceptor(resolver: Arc<IssuingCertResolver>) -> TlsAcceptor {
    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_cert_resolver(resolver);

    TlsAcceptor::from(Arc::new(config))
}

/// Client configuration for outbound connections.
///
/// Upstream certificates are verified against the system root CAs. The same
/// configuration backs the tunnel's connector and the front proxy's client.
pub fn native_client_config() -> ProxyResult<Arc<ClientConfig>> {
    let mut root_store = RootCertStore::empty();
    let native_certs = rustls_native_certs::load_native_certs();

    // Log any errors but continue with successfully loaded certs
    for err in native_certs.errors {
        debug!("Warning loading native cert: {}", err);
    }

    for cert in native_certs.certs {
        if let Err(e) = root_store.add(cert) {
            debug!("Warning adding cert to store: {}", e);
        }
    }

    if root_store.is_empty() {
        return Err(ProxyError::Tls("No system root certificates found".into()));
    }

    debug!("Loaded {} root certificates", root_store.len());

    Ok(client_config_with_roots(root_store))
}

/// Client configuration trusting exactly `root_store`, offering `http/1.1`.
pub fn client_config_with_roots(root_store: RootCertStore) -> Arc<ClientConfig> {
    let mut config = ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();

    config.alpn_protocols = vec![ALPN_HTTP11.to_vec()];

    Arc::new(config)
}

/// Build a root store from PEM-encoded certificates.
pub fn root_store_from_pem(pem: &str) -> ProxyResult<RootCertStore> {
    let mut root_store = RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut pem.as_bytes()) {
        let cert =
            cert.map_err(|e| ProxyError::Tls(format!("Failed to parse certificate PEM: {}", e)))?;
        root_store.add(cert)?;
    }
    if root_store.is_empty() {
        return Err(ProxyError::Tls("No certificates found in PEM".into()));
    }
    Ok(root_store)
}

/// Convert a domain string to a ServerName for TLS connection.
pub fn domain_to_server_name(domain: &str) -> ProxyResult<ServerName<'static>> {
    ServerName::try_from(domain.to_string())
        .map_err(|_| ProxyError::Tls(format!("Invalid server name: {}", domain)))
}
