//! Egress proxy: allow-list enforcement and TLS interception.
//!
//! This module provides the two listeners and the pieces they share:
//! - ACL engine gating every destination (`acl`)
//! - SNI-driven leaf issuance and TLS configuration (`tls`)
//! - One-shot HTTP/1.x request reader and rewrite (`request`)
//! - Tunnel terminator decrypting CONNECT tunnels (`tunnel`)
//! - Front proxy handling plain and CONNECT requests (`connect`, `server`)
//!
//! # Architecture
//!
//! ```text
//!  client ──► FrontProxy ──ACL──► plain request ──────────────► origin (http)
//!                 │
//!                 └─ CONNECT ──ACL──► raw bytes ──► TunnelTerminator
//!                                                      │  TLS (leaf per SNI)
//!                                                      │  read one request
//!                                                      └─ACL──► origin (https, Host header)
//! ```
//!
//! # Example
//!
//! ```ignore
//! use egress_proxy::proxy::{FrontProxy, FrontProxyConfig, TunnelConfig, TunnelTerminator};
//!
//! let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
//! let tunnel = TunnelTerminator::bind(tunnel_config, shutdown_rx.clone()).await?;
//! let front = FrontProxy::bind(front_config, shutdown_rx).await?;
//! tokio::try_join!(tunnel.run(), front.run())?;
//! ```

pub mod acl;
pub mod connect;
pub mod error;
pub mod request;
pub mod server;
pub mod tls;
pub mod tunnel;

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

// Re-export main types for convenient access
pub use acl::{AclDecision, AclEngine, RuleKind};
pub use error::{AclError, ProxyError, ProxyResult};
pub use request::ProxyRequest;
pub use server::{FrontProxy, FrontProxyConfig};
pub use tls::{
    client_config_with_roots, create_tls_acceptor, native_client_config, root_store_from_pem,
    IssuingCertResolver,
};
pub use tunnel::{TunnelConfig, TunnelStats, TunnelStatsSnapshot, TunnelTerminator};

/// Time and concurrency bounds applied by both listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionLimits {
    /// Deadline covering the tunnel handshake and request read.
    pub handshake_timeout: Duration,
    /// Bound on every outbound call, including the response relay.
    pub upstream_timeout: Duration,
    /// Maximum concurrent connections per listener (`None` = unbounded).
    pub max_connections: Option<usize>,
}

impl Default for ConnectionLimits {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(5),
            upstream_timeout: Duration::from_secs(60),
            max_connections: None,
        }
    }
}

/// Optional cap on concurrently handled connections.
#[derive(Debug, Clone)]
pub(crate) struct ConnectionLimiter(Option<Arc<Semaphore>>);

impl ConnectionLimiter {
    pub(crate) fn new(max_connections: Option<usize>) -> Self {
        Self(max_connections.map(|n| Arc::new(Semaphore::new(n.max(1)))))
    }

    /// Wait for a free slot. Always succeeds immediately when unbounded.
    pub(crate) async fn acquire(&self) -> Option<OwnedSemaphorePermit> {
        match &self.0 {
            Some(semaphore) => semaphore.clone().acquire_owned().await.ok(),
            None => None,
        }
    }
}

/// Whether an error is routine peer behavior rather than a proxy fault.
pub(crate) fn is_disconnect(err: &ProxyError) -> bool {
    let text = err.to_string().to_lowercase();
    text.contains("connection reset") || text.contains("broken pipe")
}
