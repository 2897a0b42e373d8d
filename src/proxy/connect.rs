//! Front proxy request handling.
//!
//! Two kinds of request arrive on the front listener:
//!
//! 1. Plain absolute-URI requests (`GET http://host/path HTTP/1.1`, or an
//!    `https://` URI): checked against the ACL, then forwarded directly and
//!    the response streamed back. Headers and body share one deadline
//! 2. `CONNECT host:port`: admitted by the ACL, then the raw tunnel bytes are
//!    piped into the tunnel terminator, which decrypts and re-checks the
//!    request it carries
//!
//! Refusals answer `403 Forbidden`. Requests that are not absolute-form get
//! `400`, unreachable upstreams `502`, and slow upstreams `504`. A body that
//! stalls past the deadline aborts the client connection.
//!
//! # Example
//!
//! ```ignore
//! use egress_proxy::proxy::connect::{handle_connect, handle_http, FrontContext};
//!
//! let response = if req.method() == Method::CONNECT {
//!     handle_connect(req, context, &conn_id).await?
//! } else {
//!     handle_http(req, peer, context, &conn_id).await?
//! };
//! ```

use super::acl::{AclDecision, AclEngine};
use super::error::ProxyError;
use super::request::parse_host_port;
use super::ConnectionLimits;
use crate::telemetry::{AuditEvent, AuditLogger, Stage};
use bytes::Bytes;
use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use hyper::body::{Body, Frame, Incoming, SizeHint};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Request, Response, StatusCode};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use rustls::ClientConfig;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::net::TcpStream;
use tokio::time::{sleep_until, timeout, timeout_at, Instant, Sleep};
use tracing::{debug, info, warn, Instrument};

/// Response body type used by the front proxy.
pub type ProxyBody = BoxBody<Bytes, ProxyError>;

/// Headers addressed to the proxy itself, never forwarded.
const PROXY_HEADERS: [&str; 2] = ["proxy-connection", "proxy-authorization"];

/// State shared by every front proxy connection.
pub struct FrontContext {
    /// Allow-list.
    pub acl: Arc<AclEngine>,
    /// Audit logger.
    pub audit: Arc<AuditLogger>,
    /// Where CONNECT tunnels are piped.
    pub tunnel_addr: SocketAddr,
    /// Outbound timeouts.
    pub limits: ConnectionLimits,
    /// HTTP(S) client for plain requests. Keeps no idle connections.
    client: Client<HttpsConnector<HttpConnector>, Incoming>,
}

impl FrontContext {
    /// Create the shared context.
    ///
    /// `upstream_tls` verifies origins of `https://` requests; its ALPN
    /// list is replaced by the connector's own.
    pub fn new(
        acl: Arc<AclEngine>,
        audit: Arc<AuditLogger>,
        tunnel_addr: SocketAddr,
        limits: ConnectionLimits,
        upstream_tls: &ClientConfig,
    ) -> Self {
        let mut tls_config = upstream_tls.clone();
        tls_config.alpn_protocols.clear();

        let connector = HttpsConnectorBuilder::new()
            .with_tls_config(tls_config)
            .https_or_http()
            .enable_http1()
            .build();

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(0)
            .build(connector);

        Self {
            acl,
            audit,
            tunnel_addr,
            limits,
            client,
        }
    }
}

/// Handle HTTP CONNECT request.
///
/// On allow, the connection to the tunnel terminator is opened before the
/// client is told `200`, so an unreachable terminator answers `502` instead
/// of a tunnel that immediately dies.
pub async fn handle_connect(
    req: Request<Incoming>,
    context: Arc<FrontContext>,
    conn_id: &str,
) -> Result<Response<ProxyBody>, ProxyError> {
    let Some(authority) = req.uri().authority().map(|a| a.to_string()) else {
        return Ok(status_response(
            StatusCode::BAD_REQUEST,
            "CONNECT request must name host:port",
        ));
    };

    let host = match parse_host_port(&authority, 443) {
        Ok((host, _port)) => host,
        Err(e) => return Ok(status_response(StatusCode::BAD_REQUEST, &e.to_string())),
    };

    debug!("CONNECT request to {}", authority);

    match context.acl.may_tunnel(&host) {
        AclDecision::Allow { pattern, .. } => {
            context.audit.log_for_connection(
                AuditEvent::AccessAllowed {
                    target: host.clone(),
                    matched: pattern,
                    stage: Stage::Connect,
                },
                conn_id,
            );
        }
        AclDecision::Deny => {
            info!("Blocking CONNECT to {}", authority);
            context.audit.log_for_connection(
                AuditEvent::AccessBlocked {
                    target: host.clone(),
                    stage: Stage::Connect,
                },
                conn_id,
            );
            return Ok(forbidden_response(&format!(
                "Connection to {} blocked by egress policy",
                host
            )));
        }
    }

    let terminator = match timeout(
        context.limits.upstream_timeout,
        TcpStream::connect(context.tunnel_addr),
    )
    .await
    {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            warn!("Tunnel terminator unreachable at {}: {}", context.tunnel_addr, e);
            return Ok(status_response(
                StatusCode::BAD_GATEWAY,
                "Tunnel terminator unavailable",
            ));
        }
        Err(_) => {
            warn!("Timed out connecting to tunnel terminator at {}", context.tunnel_addr);
            return Ok(status_response(
                StatusCode::GATEWAY_TIMEOUT,
                "Tunnel terminator timed out",
            ));
        }
    };

    tokio::spawn(
        async move {
            match hyper::upgrade::on(req).await {
                Ok(upgraded) => {
                    if let Err(e) = pipe_tunnel(upgraded, terminator).await {
                        debug!("Tunnel pipe ended for {}: {}", authority, e);
                    }
                }
                Err(e) => {
                    warn!("HTTP upgrade failed for {}: {}", authority, e);
                }
            }
        }
        .in_current_span(),
    );

    // Return 200 Connection Established to initiate the upgrade
    Ok(Response::new(empty_body()))
}

/// Relay bytes both ways until either side closes.
async fn pipe_tunnel(
    upgraded: hyper::upgrade::Upgraded,
    mut terminator: TcpStream,
) -> Result<(), ProxyError> {
    let mut client = TokioIo::new(upgraded);
    let (to_terminator, to_client) =
        tokio::io::copy_bidirectional(&mut client, &mut terminator).await?;
    debug!(
        "Tunnel pipe closed ({} bytes up, {} bytes down)",
        to_terminator, to_client
    );
    Ok(())
}

/// Handle plain HTTP proxy request (non-CONNECT).
pub async fn handle_http(
    mut req: Request<Incoming>,
    peer: SocketAddr,
    context: Arc<FrontContext>,
    conn_id: &str,
) -> Result<Response<ProxyBody>, ProxyError> {
    let uri = req.uri().clone();
    let Some(host) = uri.host().map(|h| h.trim_matches(['[', ']']).to_string()) else {
        return Ok(status_response(
            StatusCode::BAD_REQUEST,
            "Proxy requests must use an absolute URI",
        ));
    };

    if !matches!(uri.scheme_str(), Some("http") | Some("https")) {
        return Ok(status_response(
            StatusCode::BAD_REQUEST,
            "Only http:// and https:// URIs can be proxied",
        ));
    }

    let url = uri.to_string();
    debug!("HTTP proxy request to {}", url);

    match context.acl.check(&host, &url) {
        AclDecision::Allow { pattern, .. } => {
            context.audit.log_for_connection(
                AuditEvent::AccessAllowed {
                    target: url.clone(),
                    matched: pattern,
                    stage: Stage::Forward,
                },
                conn_id,
            );
        }
        AclDecision::Deny => {
            info!("Blocking HTTP request to {}", url);
            context.audit.log_for_connection(
                AuditEvent::AccessBlocked {
                    target: url.clone(),
                    stage: Stage::Forward,
                },
                conn_id,
            );
            return Ok(forbidden_response(&format!(
                "HTTP request to {} blocked by egress policy",
                url
            )));
        }
    }

    prepare_forwarded_headers(&mut req, peer);

    let deadline = Instant::now() + context.limits.upstream_timeout;
    let response = match timeout_at(deadline, context.client.request(req)).await {
        Ok(Ok(response)) => response,
        Ok(Err(e)) => {
            warn!("Upstream request to {} failed: {}", url, e);
            return Ok(status_response(
                StatusCode::BAD_GATEWAY,
                &format!("Upstream request to {} failed", url),
            ));
        }
        Err(_) => {
            warn!("Upstream request to {} timed out", url);
            return Ok(status_response(
                StatusCode::GATEWAY_TIMEOUT,
                &format!("Upstream request to {} timed out", url),
            ));
        }
    };

    context.audit.log_for_connection(
        AuditEvent::RequestForwarded {
            url: url.clone(),
            bytes: response
                .headers()
                .get(hyper::header::CONTENT_LENGTH)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
        },
        conn_id,
    );

    Ok(response.map(|body| DeadlineBody::new(body, deadline, url).boxed()))
}

/// Upstream response body that fails once the outbound deadline passes.
///
/// Erroring the body makes hyper abort the client connection, so a stalled
/// origin cannot hold it open past `upstream_timeout`.
struct DeadlineBody {
    inner: Incoming,
    deadline: Pin<Box<Sleep>>,
    url: String,
}

impl DeadlineBody {
    fn new(inner: Incoming, deadline: Instant, url: String) -> Self {
        Self {
            inner,
            deadline: Box::pin(sleep_until(deadline)),
            url,
        }
    }
}

impl Body for DeadlineBody {
    type Data = Bytes;
    type Error = ProxyError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();

        if let Poll::Ready(frame) = Pin::new(&mut this.inner).poll_frame(cx) {
            return Poll::Ready(frame.map(|result| result.map_err(ProxyError::from)));
        }

        match this.deadline.as_mut().poll(cx) {
            Poll::Ready(()) => {
                warn!("Response body from {} exceeded the upstream timeout", this.url);
                Poll::Ready(Some(Err(ProxyError::UpstreamTimeout(this.url.clone()))))
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

/// Drop proxy-only headers and record the client in `X-Forwarded-For`.
fn prepare_forwarded_headers<B>(req: &mut Request<B>, peer: SocketAddr) {
    let headers = req.headers_mut();
    for name in PROXY_HEADERS {
        headers.remove(name);
    }

    let client_ip = peer.ip().to_string();
    let forwarded_for = match headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
    {
        Some(existing) => format!("{}, {}", existing, client_ip),
        None => client_ip,
    };
    if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
        headers.insert("x-forwarded-for", value);
    }
}

/// Create an empty response body.
fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed()
}

/// Create a response body with content.
fn full_body(content: String) -> ProxyBody {
    Full::new(Bytes::from(content))
        .map_err(|never| match never {})
        .boxed()
}

/// Create a plain-text response with the given status.
fn status_response(status: StatusCode, message: &str) -> Response<ProxyBody> {
    let mut response = Response::new(full_body(format!("{}\n", message)));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    response
}

/// Create a 403 Forbidden response.
fn forbidden_response(message: &str) -> Response<ProxyBody> {
    status_response(StatusCode::FORBIDDEN, message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forbidden_response() {
        let response = forbidden_response("test message");
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(
            response.headers().get(CONTENT_TYPE).unwrap(),
            "text/plain"
        );
    }

    #[test]
    fn test_status_response() {
        let response = status_response(StatusCode::BAD_GATEWAY, "nope");
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn test_prepare_forwarded_headers_strips_proxy_headers() {
        let mut req = Request::builder()
            .uri("http://example.com/")
            .header("Proxy-Connection", "keep-alive")
            .header("Proxy-Authorization", "Basic Zm9vOmJhcg==")
            .header("Accept", "*/*")
            .body(())
            .unwrap();

        prepare_forwarded_headers(&mut req, "10.1.2.3:5555".parse().unwrap());

        assert!(req.headers().get("proxy-connection").is_none());
        assert!(req.headers().get("proxy-authorization").is_none());
        assert_eq!(req.headers().get("accept").unwrap(), "*/*");
        assert_eq!(req.headers().get("x-forwarded-for").unwrap(), "10.1.2.3");
    }

    #[test]
    fn test_prepare_forwarded_headers_appends() {
        let mut req = Request::builder()
            .uri("http://example.com/")
            .header("X-Forwarded-For", "192.0.2.1")
            .body(())
            .unwrap();

        prepare_forwarded_headers(&mut req, "[::1]:5555".parse().unwrap());

        assert_eq!(
            req.headers().get("x-forwarded-for").unwrap(),
            "192.0.2.1, ::1"
        );
    }
}
