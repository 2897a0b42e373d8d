//! TLS tunnel terminator.
//!
//! The terminator listens (normally on loopback) for the raw bytes of
//! CONNECT tunnels piped in by the front proxy. Each accepted connection is
//! handled by its own task and moves through these states:
//!
//! ```text
//! Accepted -> Handshaking -> RequestRead -> Forwarding -> Closed
//! ```
//!
//! Any error jumps straight to `Closed`. There is no retry and no keep-alive:
//! one connection carries exactly one request and one response.
//!
//! # Deadline
//!
//! A single deadline is taken right after accept. It covers the TLS
//! handshake (including leaf issuance) and reading the request, and is never
//! refreshed between the two. A connection that misses it is dropped before
//! any outbound call is made. The outbound call and response relay have
//! their own bound (`upstream_timeout`).
//!
//! # Rewrite
//!
//! The outbound destination comes from the decrypted request's `Host`
//! header, checked against the ACL as `https://<Host><path>`. The response is
//! copied back to the client byte for byte.

use super::acl::{AclDecision, AclEngine};
use super::error::{ProxyError, ProxyResult};
use super::request::{read_request, ProxyRequest};
use super::tls::{create_tls_acceptor, domain_to_server_name, IssuingCertResolver};
use super::{is_disconnect, ConnectionLimiter, ConnectionLimits};
use crate::ca::CertificateAuthority;
use crate::telemetry::{AuditEvent, AuditLogger, Stage};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::{timeout, timeout_at, Instant};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Size of the relay buffer.
const RELAY_BUFFER_BYTES: usize = 16 * 1024;

/// Counters describing what the terminator has done so far.
#[derive(Debug, Default)]
pub struct TunnelStats {
    accepted: AtomicU64,
    certificates_issued: AtomicU64,
    deadline_exceeded: AtomicU64,
    denied: AtomicU64,
    forwarded: AtomicU64,
    failed: AtomicU64,
}

/// Point-in-time copy of [`TunnelStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TunnelStatsSnapshot {
    /// Connections accepted.
    pub accepted: u64,
    /// Leaf certificates issued.
    pub certificates_issued: u64,
    /// Connections dropped at the handshake/read deadline.
    pub deadline_exceeded: u64,
    /// Requests refused by the ACL.
    pub denied: u64,
    /// Requests forwarded and relayed.
    pub forwarded: u64,
    /// Connections closed by any other error.
    pub failed: u64,
}

impl TunnelStats {
    pub(crate) fn record_accepted(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_certificate_issued(&self) {
        self.certificates_issued.fetch_add(1, Ordering::Relaxed);
    }

    fn record_outcome(&self, result: &ProxyResult<Outcome>) {
        let counter = match result {
            Ok(Outcome::Forwarded) => &self.forwarded,
            Ok(Outcome::Denied) => &self.denied,
            Err(ProxyError::Timeout(_)) => &self.deadline_exceeded,
            Err(_) => &self.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Take a snapshot of all counters.
    pub fn snapshot(&self) -> TunnelStatsSnapshot {
        TunnelStatsSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            certificates_issued: self.certificates_issued.load(Ordering::Relaxed),
            deadline_exceeded: self.deadline_exceeded.load(Ordering::Relaxed),
            denied: self.denied.load(Ordering::Relaxed),
            forwarded: self.forwarded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

/// How a connection ended when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Forwarded,
    Denied,
}

/// Configuration for the tunnel terminator.
#[derive(Clone)]
pub struct TunnelConfig {
    /// Address to listen on.
    pub listen_addr: SocketAddr,
    /// CA used to mint leaf certificates.
    pub ca: Arc<CertificateAuthority>,
    /// Allow-list applied to decrypted requests.
    pub acl: Arc<AclEngine>,
    /// TLS client for outbound calls.
    pub connector: TlsConnector,
    /// Audit logger.
    pub audit: Arc<AuditLogger>,
    /// Deadlines and concurrency cap.
    pub limits: ConnectionLimits,
}

/// State shared read-only by every connection task.
struct TunnelContext {
    acceptor: TlsAcceptor,
    connector: TlsConnector,
    acl: Arc<AclEngine>,
    audit: Arc<AuditLogger>,
    stats: Arc<TunnelStats>,
    limits: ConnectionLimits,
}

/// The TLS-terminating listener.
pub struct TunnelTerminator {
    listener: TcpListener,
    context: Arc<TunnelContext>,
    limiter: ConnectionLimiter,
    shutdown_rx: watch::Receiver<bool>,
}

impl TunnelTerminator {
    /// Bind the listener.
    pub async fn bind(config: TunnelConfig, shutdown_rx: watch::Receiver<bool>) -> ProxyResult<Self> {
        let listener = TcpListener::bind(config.listen_addr).await?;

        let stats = Arc::new(TunnelStats::default());
        let resolver = Arc::new(IssuingCertResolver::new(
            config.ca,
            stats.clone(),
            config.audit.clone(),
        ));

        let context = Arc::new(TunnelContext {
            acceptor: create_tls_acceptor(resolver),
            connector: config.connector,
            acl: config.acl,
            audit: config.audit,
            stats,
            limits: config.limits,
        });

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

    /// Shared handle to the counters.
    pub fn stats(&self) -> Arc<TunnelStats> {
        self.context.stats.clone()
    }

    /// Run the accept loop until the shutdown signal is received.
    ///
    /// Connections already being handled keep running after this returns.
    pub async fn run(self) -> ProxyResult<()> {
        info!("Tunnel terminator listening on {}", self.local_addr()?);

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
                            self.context.stats.record_accepted();
                            let context = self.context.clone();
                            let conn_id = Uuid::new_v4().to_string();
                            let span = info_span!("conn", component = "tunnel", id = %conn_id, %peer);

                            tokio::spawn(
                                async move {
                                    let _permit = permit;
                                    handle_connection(stream, conn_id, context).await;
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

        info!("Tunnel terminator shutting down");
        Ok(())
    }
}

async fn handle_connection(stream: TcpStream, conn_id: String, context: Arc<TunnelContext>) {
    let deadline = Instant::now() + context.limits.handshake_timeout;
    let result = terminate(stream, deadline, &conn_id, &context).await;
    context.stats.record_outcome(&result);

    match result {
        Ok(outcome) => debug!("Tunnel closed: {:?}", outcome),
        Err(e @ ProxyError::Timeout(_)) => info!("Tunnel dropped: {}", e),
        Err(e) if is_disconnect(&e) => debug!("Tunnel ended: {}", e),
        Err(e) => warn!("Tunnel error: {}", e),
    }
}

/// Drive one connection from accept to close.
async fn terminate(
    stream: TcpStream,
    deadline: Instant,
    conn_id: &str,
    context: &TunnelContext,
) -> ProxyResult<Outcome> {
    let mut tls = timeout_at(deadline, context.acceptor.accept(stream))
        .await
        .map_err(|_| ProxyError::Timeout("handshake"))?
        .map_err(|e| ProxyError::Tls(format!("Client TLS handshake failed: {}", e)))?;

    let sni = tls.get_ref().1.server_name().unwrap_or_default().to_string();
    debug!("TLS established for {}", sni);

    let request = timeout_at(deadline, read_request(&mut tls))
        .await
        .map_err(|_| ProxyError::Timeout("request read"))??;

    let hostname = request.hostname();
    let url = request.outbound_url();
    debug!("{} {} (sni {})", request.method, url, sni);

    match context.acl.check(&hostname, &url) {
        AclDecision::Allow { pattern, .. } => {
            context.audit.log_for_connection(
                AuditEvent::AccessAllowed {
                    target: url.clone(),
                    matched: pattern,
                    stage: Stage::Tunnel,
                },
                conn_id,
            );
        }
        AclDecision::Deny => {
            info!("Blocking tunneled request to {}", url);
            context.audit.log_for_connection(
                AuditEvent::AccessBlocked {
                    target: url.clone(),
                    stage: Stage::Tunnel,
                },
                conn_id,
            );
            write_forbidden(&mut tls, &url).await?;
            return Ok(Outcome::Denied);
        }
    }

    let bytes = timeout(
        context.limits.upstream_timeout,
        forward(&request, &mut tls, &context.connector),
    )
    .await
    .map_err(|_| ProxyError::UpstreamTimeout(url.clone()))??;

    context.audit.log_for_connection(
        AuditEvent::RequestForwarded {
            url: url.clone(),
            bytes,
        },
        conn_id,
    );

    tls.shutdown().await?;
    Ok(Outcome::Forwarded)
}

/// Re-issue `request` toward its `Host` and relay the response into `client`.
///
/// Returns the number of response bytes relayed.
async fn forward<W>(
    request: &ProxyRequest,
    client: &mut W,
    connector: &TlsConnector,
) -> ProxyResult<u64>
where
    W: AsyncWrite + Unpin,
{
    let (host, port) = request.upstream()?;
    let addr = format!("{}:{}", host, port);

    let tcp = TcpStream::connect((host.as_str(), port))
        .await
        .map_err(|e| ProxyError::UpstreamConnect {
            addr: addr.clone(),
            message: e.to_string(),
        })?;

    let server_name = domain_to_server_name(&host)?;
    let mut upstream =
        connector
            .connect(server_name, tcp)
            .await
            .map_err(|e| ProxyError::UpstreamConnect {
                addr: addr.clone(),
                message: format!("TLS handshake failed: {}", e),
            })?;

    debug!("Connected to upstream {}", addr);

    upstream.write_all(&request.encode_outbound()).await?;
    upstream.flush().await?;

    relay_response(&mut upstream, client).await
}

/// Copy upstream bytes to the client until the upstream closes.
async fn relay_response<R, W>(upstream: &mut R, client: &mut W) -> ProxyResult<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER_BYTES];
    let mut total: u64 = 0;

    loop {
        let n = match upstream.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            // Many servers close without close_notify once the response is out
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof && total > 0 => {
                debug!("Upstream closed without close_notify");
                break;
            }
            Err(e) => return Err(e.into()),
        };
        client.write_all(&buf[..n]).await?;
        total += n as u64;
    }

    client.flush().await?;
    Ok(total)
}

async fn write_forbidden<W>(client: &mut W, url: &str) -> ProxyResult<()>
where
    W: AsyncWrite + Unpin,
{
    let body = format!("Request to {} blocked by egress policy\n", url);
    let response = format!(
        "HTTP/1.1 403 Forbidden\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    );
    client.write_all(response.as_bytes()).await?;
    client.shutdown().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ca::test_support::authority;
    use crate::proxy::tls::{client_config_with_roots, root_store_from_pem};
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use std::time::Duration;
    use tokio::io::ReadBuf;
    use tokio_rustls::client::TlsStream;

    struct Harness {
        addr: SocketAddr,
        stats: Arc<TunnelStats>,
        client: TlsConnector,
        _shutdown: watch::Sender<bool>,
    }

    async fn start(acl: AclEngine, handshake_timeout: Duration) -> Harness {
        let ca = Arc::new(authority());
        let roots = root_store_from_pem(ca.root_cert_pem()).unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let config = TunnelConfig {
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            ca,
            acl: Arc::new(acl),
            connector: TlsConnector::from(client_config_with_roots(roots.clone())),
            audit: Arc::new(AuditLogger::new_null()),
            limits: ConnectionLimits {
                handshake_timeout,
                upstream_timeout: Duration::from_secs(5),
                max_connections: None,
            },
        };

        let terminator = TunnelTerminator::bind(config, shutdown_rx).await.unwrap();
        let addr = terminator.local_addr().unwrap();
        let stats = terminator.stats();
        tokio::spawn(terminator.run());

        Harness {
            addr,
            stats,
            client: TlsConnector::from(client_config_with_roots(roots)),
            _shutdown: shutdown_tx,
        }
    }

    impl Harness {
        async fn connect(&self, sni: &str) -> TlsStream<TcpStream> {
            let tcp = TcpStream::connect(self.addr).await.unwrap();
            self.client
                .connect(domain_to_server_name(sni).unwrap(), tcp)
                .await
                .unwrap()
        }

        async fn wait_for(&self, check: impl Fn(TunnelStatsSnapshot) -> bool) -> TunnelStatsSnapshot {
            for _ in 0..200 {
                let snapshot = self.stats.snapshot();
                if check(snapshot) {
                    return snapshot;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            self.stats.snapshot()
        }
    }

    async fn read_to_end_lossy<R: AsyncRead + Unpin>(stream: &mut R) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => out.extend_from_slice(&buf[..n]),
            }
        }
        out
    }

    #[tokio::test]
    async fn test_stalled_request_hits_deadline_without_outbound_call() {
        let acl = AclEngine::load(&[r"^evil\.test$".to_string()], &[]).unwrap();
        let harness = start(acl, Duration::from_millis(300)).await;

        let started = std::time::Instant::now();
        let mut tls = harness.connect("evil.test").await;

        // Send nothing: the server must give up on its own
        let leftover = tokio::time::timeout(Duration::from_secs(3), read_to_end_lossy(&mut tls))
            .await
            .expect("connection should be closed at the deadline");
        assert!(leftover.is_empty());
        assert!(started.elapsed() < Duration::from_secs(2));

        let stats = harness.wait_for(|s| s.deadline_exceeded == 1).await;
        assert_eq!(stats.deadline_exceeded, 1);
        assert_eq!(stats.certificates_issued, 1);
        assert_eq!(stats.forwarded, 0);
        assert_eq!(stats.denied, 0);
    }

    #[tokio::test]
    async fn test_stalled_handshake_hits_deadline() {
        let acl = AclEngine::load(&[], &[]).unwrap();
        let harness = start(acl, Duration::from_millis(200)).await;

        let mut tcp = TcpStream::connect(harness.addr).await.unwrap();
        let closed = tokio::time::timeout(Duration::from_secs(3), read_to_end_lossy(&mut tcp)).await;
        assert!(closed.is_ok());

        let stats = harness.wait_for(|s| s.deadline_exceeded == 1).await;
        assert_eq!(stats.deadline_exceeded, 1);
        assert_eq!(stats.certificates_issued, 0);
    }

    #[tokio::test]
    async fn test_each_tunnel_gets_a_fresh_certificate() {
        let acl = AclEngine::load(&[r"^same\.example\.com$".to_string()], &[]).unwrap();
        let harness = start(acl, Duration::from_secs(5)).await;

        let first = harness.connect("same.example.com").await;
        let second = harness.connect("same.example.com").await;

        let first_cert = first.get_ref().1.peer_certificates().unwrap()[0].clone();
        let second_cert = second.get_ref().1.peer_certificates().unwrap()[0].clone();
        assert_ne!(first_cert, second_cert);

        let stats = harness.wait_for(|s| s.certificates_issued == 2).await;
        assert_eq!(stats.certificates_issued, 2);
        assert_eq!(stats.accepted, 2);
    }

    #[tokio::test]
    async fn test_handshake_without_sni_is_rejected() {
        let acl = AclEngine::load(&[".*".to_string()], &[]).unwrap();
        let harness = start(acl, Duration::from_secs(5)).await;

        // IP address server names are not sent as SNI
        let tcp = TcpStream::connect(harness.addr).await.unwrap();
        let result = harness
            .client
            .connect(domain_to_server_name("127.0.0.1").unwrap(), tcp)
            .await;
        assert!(result.is_err());

        let stats = harness.wait_for(|s| s.failed == 1).await;
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.certificates_issued, 0);
    }

    #[tokio::test]
    async fn test_denied_request_gets_403_inside_tls() {
        let acl =
            AclEngine::load(&[], &[r"^https://good\.example\.com/path$".to_string()]).unwrap();
        let harness = start(acl, Duration::from_secs(5)).await;

        let mut tls = harness.connect("good.example.com").await;
        tls.write_all(b"GET /other HTTP/1.1\r\nHost: good.example.com\r\n\r\n")
            .await
            .unwrap();

        let response = read_to_end_lossy(&mut tls).await;
        let text = String::from_utf8(response).unwrap();
        assert!(text.starts_with("HTTP/1.1 403 Forbidden\r\n"));
        assert!(text.contains("https://good.example.com/other"));

        let stats = harness.wait_for(|s| s.denied == 1).await;
        assert_eq!(stats.denied, 1);
        assert_eq!(stats.forwarded, 0);
    }

    #[tokio::test]
    async fn test_malformed_request_closes_without_response() {
        let acl = AclEngine::load(&[".*".to_string()], &[]).unwrap();
        let harness = start(acl, Duration::from_secs(5)).await;

        let mut tls = harness.connect("example.com").await;
        tls.write_all(b"GET / HTTP/1.1\r\nNo-Host: here\r\n\r\n")
            .await
            .unwrap();

        let response = read_to_end_lossy(&mut tls).await;
        assert!(response.is_empty());

        let stats = harness.wait_for(|s| s.failed == 1).await;
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.forwarded, 0);
    }

    #[tokio::test]
    async fn test_relay_is_byte_identical() {
        let upstream_bytes =
            b"HTTP/1.1 200 OK\r\nX-Odd-Case: VaLuE\r\nContent-Length: 5\r\n\r\nhello".to_vec();
        let mut upstream = upstream_bytes.as_slice();
        let mut client = Vec::new();

        let n = relay_response(&mut upstream, &mut client).await.unwrap();
        assert_eq!(n, upstream_bytes.len() as u64);
        assert_eq!(client, upstream_bytes);
    }

    /// Yields its data, then fails the way a TLS stream does on a missing close_notify.
    struct TruncatedTls {
        data: Option<Vec<u8>>,
    }

    impl AsyncRead for TruncatedTls {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<std::io::Result<()>> {
            match self.data.take() {
                Some(data) => {
                    buf.put_slice(&data);
                    Poll::Ready(Ok(()))
                }
                None => Poll::Ready(Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "peer closed connection without sending TLS close_notify",
                ))),
            }
        }
    }

    #[tokio::test]
    async fn test_relay_tolerates_missing_close_notify_after_data() {
        let mut upstream = TruncatedTls {
            data: Some(b"HTTP/1.1 204 No Content\r\n\r\n".to_vec()),
        };
        let mut client = Vec::new();
        let n = relay_response(&mut upstream, &mut client).await.unwrap();
        assert_eq!(n, 27);

        let mut empty = TruncatedTls { data: None };
        assert!(relay_response(&mut empty, &mut Vec::new()).await.is_err());
    }

    #[test]
    fn test_record_outcome_buckets() {
        let stats = TunnelStats::default();
        stats.record_outcome(&Ok(Outcome::Forwarded));
        stats.record_outcome(&Ok(Outcome::Denied));
        stats.record_outcome(&Err(ProxyError::Timeout("handshake")));
        stats.record_outcome(&Err(ProxyError::MissingHost));

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.forwarded, 1);
        assert_eq!(snapshot.denied, 1);
        assert_eq!(snapshot.deadline_exceeded, 1);
        assert_eq!(snapshot.failed, 1);
    }
}
