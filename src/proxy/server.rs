//! Front proxy server implementation.
//!
//! This module provides the plaintext forward-proxy listener that:
//! - Accepts standard proxy-style HTTP/1.1 connections
//! - Handles plain absolute-URI requests by forwarding them directly
//! - Handles HTTP CONNECT by piping the tunnel into the tunnel terminator
//!
//! # Architecture
//!
//! The proxy uses hyper's HTTP/1.1 server with upgrade support for CONNECT.
//! Each connection is handled in a separate Tokio task with its own tracing
//! span and connection id.
//!
//! # Example
//!
//! ```ignore
//! use egress_proxy::proxy::{FrontProxy, FrontProxyConfig};
//!
//! let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
//! let server = FrontProxy::bind(config, shutdown_rx).await?;
//! server.run().await?;
//!
//! // To shutdown:
//! shutdown_tx.send(true)?;
//! ```

use super::acl::AclEngine;
use super::connect::{handle_connect, handle_http, FrontContext, ProxyBody};
use super::error::{ProxyError, ProxyResult};
use super::{is_disconnect, ConnectionLimiter, ConnectionLimits};
use crate::telemetry::AuditLogger;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response};
use hyper_util::rt::TokioIo;
use rustls::ClientConfig;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Configuration for the front proxy.
#[derive(Clone)]
pub struct FrontProxyConfig {
    /// Address to listen on.
    pub listen_addr: SocketAddr,
    /// Address of the tunnel terminator CONNECT tunnels are piped into.
    pub tunnel_addr: SocketAddr,
    /// Allow-list.
    pub acl: Arc<AclEngine>,
    /// Audit logger.
    pub audit: Arc<AuditLogger>,
    /// Outbound timeouts and concurrency cap.
    pub limits: ConnectionLimits,
    /// TLS client settings for `https://` origins.
    pub upstream_tls: Arc<ClientConfig>,
}

/// The forward-proxy listener.
pub struct FrontProxy {
    listener: TcpListener,
    context: Arc<FrontContext>,
    limiter: ConnectionLimiter,
    /// Shutdown signal receiver.
    shutdown_rx: watch::Receiver<bool>,
}

impl FrontProxy {
    /// Bind the listener.
    pub async fn bind(
        config: FrontProxyConfig,
        shutdown_rx: watch::Receiver<bool>,
    ) -> ProxyResult<Self> {
        let listener = TcpListener::bind(config.listen_addr).await?;
        let context = Arc::new(FrontContext::new(
            config.acl,
            config.audit,
            config.tunnel_addr,
            config.limits,
            &config.upstream_tls,
        ));

        Ok(Self {
            listener,
            context,
            limiter: ConnectionLimiter::new(config.limits.max_connections),
            shutdown_rx,
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> ProxyResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Run the proxy server.
    ///
    /// Returns when the shutdown signal is received. Connections already
    /// being served are left to finish.
    pub async fn run(self) -> ProxyResult<()> {
        info!(
            "Front proxy listening on {} (tunnels to {})",
            self.local_addr()?,
            self.context.tunnel_addr
        );

        let mut shutdown_rx = self.shutdown_rx.clone();
        loop {
            let permit = tokio::select! {
                permit = self.limiter.acquire() => permit,
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                    continue;
                }
            };

            tokio::select! {
                accept_result = self.listener.accept() => {
                    match accept_result {
                        Ok((stream, peer)) => {
                            debug!("Accepted connection from {}", peer);
                            let context = self.context.clone();
                            let conn_id = Uuid::new_v4().to_string();
                            let span = info_span!("conn", component = "front", id = %conn_id, %peer);

                            tokio::spawn(
                                async move {
                                    let _permit = permit;
                                    if let Err(e) = handle_connection(stream, peer, conn_id, context).await {
                                        if is_disconnect(&e) {
                                            debug!("Connection ended: {}", e);
                                        } else {
                                            warn!("Connection error: {}", e);
                                        }
                                    }
                                }
                                .instrument(span),
                            );
                        }
                        Err(e) => {
                            warn!("Failed to accept connection: {}", e);
                        }
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Front proxy shutting down");
        Ok(())
    }
}

/// Handle a single client connection.
async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    conn_id: String,
    context: Arc<FrontContext>,
) -> Result<(), ProxyError> {
    let io = TokioIo::new(stream);
    let conn_id = Arc::new(conn_id);

    // Create the service that handles each request
    let service = service_fn(move |req: Request<Incoming>| {
        let context = context.clone();
        let conn_id = conn_id.clone();

        async move { proxy_request(req, peer, context, &conn_id).await }
    });

    // Serve HTTP/1.1 with support for upgrades (needed for CONNECT)
    http1::Builder::new()
        .preserve_header_case(true)
        .title_case_headers(true)
        .serve_connection(io, service)
        .with_upgrades()
        .await
        .map_err(ProxyError::from)
}

/// Process a single proxy request.
async fn proxy_request(
    req: Request<Incoming>,
    peer: SocketAddr,
    context: Arc<FrontContext>,
    conn_id: &str,
) -> Result<Response<ProxyBody>, ProxyError> {
    if req.method() == Method::CONNECT {
        // HTTPS tunneling via CONNECT
        handle_connect(req, context, conn_id).await
    } else {
        // Plain HTTP proxying
        handle_http(req, peer, context, conn_id).await
    }
}
