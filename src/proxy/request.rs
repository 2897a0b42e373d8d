//! One-shot HTTP/1.x request reader and outbound rewrite.
//!
//! The tunnel terminator reads exactly one request from the decrypted
//! stream. The request is kept close to its wire form so it can be replayed
//! toward the real destination with only the request line and connection
//! headers changed.
//!
//! # Limits
//!
//! - Request head: 64 KiB, at most 100 headers
//! - Body: 16 MiB, framed by `Content-Length` or `Transfer-Encoding: chunked`
//!
//! Chunked bodies are forwarded as raw chunk bytes, never re-encoded.
//!
//! # Rewrite
//!
//! The outbound destination is always `https://<Host header>`. The request
//! line keeps only the path and query of the original target, so an
//! absolute-form target naming some other authority has no effect on where
//! the request goes.

use super::error::{ProxyError, ProxyResult};
use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Maximum size of the request line plus headers.
pub const MAX_HEAD_BYTES: usize = 64 * 1024;

/// Maximum number of request headers.
pub const MAX_HEADERS: usize = 100;

/// Maximum size of a request body.
pub const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

/// Default port for the outbound HTTPS call.
pub const DEFAULT_HTTPS_PORT: u16 = 443;

/// Headers replaced by `Connection: close` on the outbound request.
const CONNECTION_HEADERS: [&str; 3] = ["connection", "proxy-connection", "keep-alive"];

/// A request decoded from a tunnel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyRequest {
    /// Request method (`GET`, `POST`, ...).
    pub method: String,
    /// Request-line target exactly as the client sent it.
    pub target: String,
    /// Headers in wire order, names as sent.
    pub headers: Vec<(String, Vec<u8>)>,
    /// Value of the Host header.
    pub host: String,
    /// Raw body bytes (chunk framing included for chunked bodies).
    pub body: Vec<u8>,
}

impl ProxyRequest {
    /// Hostname from the Host header, without port or IPv6 brackets.
    pub fn hostname(&self) -> String {
        parse_host_port(&self.host, DEFAULT_HTTPS_PORT)
            .map(|(host, _)| host)
            .unwrap_or_else(|_| self.host.clone())
    }

    /// Host and port the outbound call connects to.
    pub fn upstream(&self) -> ProxyResult<(String, u16)> {
        parse_host_port(&self.host, DEFAULT_HTTPS_PORT)
    }

    /// Path and query of the request-line target.
    ///
    /// Any scheme and authority in the target are discarded.
    pub fn path_and_query(&self) -> String {
        let target = self.target.as_str();

        if target.starts_with('/') || target == "*" {
            return target.to_string();
        }

        let after_authority = match target.find("://") {
            Some(idx) => &target[idx + 3..],
            None => return "/".to_string(),
        };

        match after_authority.find(['/', '?']) {
            Some(idx) if after_authority[idx..].starts_with('/') => {
                after_authority[idx..].to_string()
            }
            Some(idx) => format!("/{}", &after_authority[idx..]),
            None => "/".to_string(),
        }
    }

    /// Absolute URL of the outbound request.
    pub fn outbound_url(&self) -> String {
        let path = self.path_and_query();
        if path == "*" {
            format!("https://{}", self.host)
        } else {
            format!("https://{}{}", self.host, path)
        }
    }

    /// Serialize the rewritten request for the outbound connection.
    pub fn encode_outbound(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.body.len() + 512);
        out.extend_from_slice(
            format!("{} {} HTTP/1.1\r\n", self.method, self.path_and_query()).as_bytes(),
        );

        for (name, value) in &self.headers {
            let lower = name.to_ascii_lowercase();
            if CONNECTION_HEADERS.contains(&lower.as_str()) {
                continue;
            }
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value);
            out.extend_from_slice(b"\r\n");
        }

        out.extend_from_slice(b"Connection: close\r\n\r\n");
        out.extend_from_slice(&self.body);
        out
    }
}

/// How the request body is delimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyFraming {
    None,
    Length(usize),
    Chunked,
}

/// Read exactly one request from `reader`.
///
/// Bytes after the end of the request are ignored.
///
/// # Errors
///
/// Returns [`ProxyError::MalformedRequest`] for framing errors, oversized
/// input, or a peer that closes mid-request, and [`ProxyError::MissingHost`]
/// if no Host header is present.
pub async fn read_request<R>(reader: &mut R) -> ProxyResult<ProxyRequest>
where
    R: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(8 * 1024);

    let (head_len, mut request) = loop {
        if let Some(parsed) = parse_head(&buf)? {
            break parsed;
        }
        if buf.len() >= MAX_HEAD_BYTES {
            return Err(ProxyError::MalformedRequest(format!(
                "request head exceeds {} bytes",
                MAX_HEAD_BYTES
            )));
        }
        if reader.read_buf(&mut buf).await? == 0 {
            return Err(ProxyError::MalformedRequest(
                "connection closed before request head was complete".into(),
            ));
        }
    };

    let framing = body_framing(&request.headers)?;
    let _ = buf.split_to(head_len);

    let body_len = match framing {
        BodyFraming::None => 0,
        BodyFraming::Length(len) => {
            if len > MAX_BODY_BYTES {
                return Err(body_too_large());
            }
            while buf.len() < len {
                read_more(reader, &mut buf).await?;
            }
            len
        }
        BodyFraming::Chunked => loop {
            if let Some(len) = chunked_body_len(&buf)? {
                break len;
            }
            if buf.len() > MAX_BODY_BYTES {
                return Err(body_too_large());
            }
            read_more(reader, &mut buf).await?;
        },
    };

    request.body = buf[..body_len].to_vec();
    Ok(request)
}

async fn read_more<R>(reader: &mut R, buf: &mut BytesMut) -> ProxyResult<()>
where
    R: AsyncRead + Unpin,
{
    if reader.read_buf(buf).await? == 0 {
        return Err(ProxyError::MalformedRequest(
            "connection closed before request body was complete".into(),
        ));
    }
    Ok(())
}

fn body_too_large() -> ProxyError {
    ProxyError::MalformedRequest(format!("request body exceeds {} bytes", MAX_BODY_BYTES))
}

/// Try to parse the request head; `None` means more bytes are needed.
fn parse_head(buf: &[u8]) -> ProxyResult<Option<(usize, ProxyRequest)>> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);

    let head_len = match req.parse(buf) {
        Ok(httparse::Status::Complete(len)) => len,
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(e) => return Err(ProxyError::MalformedRequest(e.to_string())),
    };

    let method = req.method.unwrap_or_default().to_string();
    let target = req.path.unwrap_or_default().to_string();
    let headers: Vec<(String, Vec<u8>)> = req
        .headers
        .iter()
        .map(|h| (h.name.to_string(), h.value.to_vec()))
        .collect();

    let host = headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case("host"))
        .map(|(_, v)| String::from_utf8_lossy(v).trim().to_string())
        .filter(|h| !h.is_empty())
        .ok_or(ProxyError::MissingHost)?;

    Ok(Some((
        head_len,
        ProxyRequest {
            method,
            target,
            headers,
            host,
            body: Vec::new(),
        },
    )))
}

fn body_framing(headers: &[(String, Vec<u8>)]) -> ProxyResult<BodyFraming> {
    let mut content_length: Option<usize> = None;
    let mut chunked = false;

    for (name, value) in headers {
        if name.eq_ignore_ascii_case("content-length") {
            let text = std::str::from_utf8(value)
                .map_err(|_| ProxyError::MalformedRequest("non-ASCII Content-Length".into()))?;
            let len = text.trim().parse::<usize>().map_err(|_| {
                ProxyError::MalformedRequest(format!("invalid Content-Length '{}'", text.trim()))
            })?;
            if content_length.is_some_and(|prev| prev != len) {
                return Err(ProxyError::MalformedRequest(
                    "conflicting Content-Length headers".into(),
                ));
            }
            content_length = Some(len);
        } else if name.eq_ignore_ascii_case("transfer-encoding") {
            let text = String::from_utf8_lossy(value);
            let last = text.rsplit(',').next().unwrap_or_default().trim();
            if !last.eq_ignore_ascii_case("chunked") {
                return Err(ProxyError::MalformedRequest(format!(
                    "unsupported Transfer-Encoding '{}'",
                    text.trim()
                )));
            }
            chunked = true;
        }
    }

    match (content_length, chunked) {
        (Some(_), true) => Err(ProxyError::MalformedRequest(
            "both Content-Length and Transfer-Encoding present".into(),
        )),
        (_, true) => Ok(BodyFraming::Chunked),
        (Some(0), false) | (None, false) => Ok(BodyFraming::None),
        (Some(len), false) => Ok(BodyFraming::Length(len)),
    }
}

/// Length of a complete chunked body at the start of `buf`, trailers included.
///
/// Returns `None` while the body is still incomplete.
fn chunked_body_len(buf: &[u8]) -> ProxyResult<Option<usize>> {
    let mut pos = 0usize;

    loop {
        let (consumed, size) = match httparse::parse_chunk_size(&buf[pos..]) {
            Ok(httparse::Status::Complete(parsed)) => parsed,
            Ok(httparse::Status::Partial) => return Ok(None),
            Err(_) => return Err(ProxyError::MalformedRequest("invalid chunk size".into())),
        };
        pos += consumed;

        if size == 0 {
            // Trailer section ends with an empty line
            loop {
                let rest = &buf[pos..];
                let Some(eol) = rest.windows(2).position(|w| w == b"\r\n") else {
                    return Ok(None);
                };
                pos += eol + 2;
                if eol == 0 {
                    return Ok(Some(pos));
                }
            }
        }

        let size = usize::try_from(size)
            .ok()
            .filter(|s| *s <= MAX_BODY_BYTES)
            .ok_or_else(body_too_large)?;

        if buf.len() < pos + size + 2 {
            return Ok(None);
        }
        if &buf[pos + size..pos + size + 2] != b"\r\n" {
            return Err(ProxyError::MalformedRequest(
                "chunk not terminated by CRLF".into(),
            ));
        }
        pos += size + 2;
    }
}

/// Parse a `host[:port]` authority.
///
/// Examples:
/// - `api.example.com:8443` -> ("api.example.com", 8443)
/// - `api.example.com` -> ("api.example.com", `default_port`)
/// - `[::1]:443` -> ("::1", 443)
pub fn parse_host_port(authority: &str, default_port: u16) -> ProxyResult<(String, u16)> {
    let authority = authority.trim();

    if let Some(rest) = authority.strip_prefix('[') {
        let (host, tail) = rest.split_once(']').ok_or_else(|| {
            ProxyError::MalformedRequest(format!("Unterminated IPv6 literal: {}", authority))
        })?;
        let port = match tail.strip_prefix(':') {
            Some(port_str) => parse_port(port_str)?,
            None if tail.is_empty() => default_port,
            None => {
                return Err(ProxyError::MalformedRequest(format!(
                    "Invalid authority: {}",
                    authority
                )))
            }
        };
        return Ok((host.to_string(), port));
    }

    match authority.rsplit_once(':') {
        Some((host, port_str)) => Ok((host.to_string(), parse_port(port_str)?)),
        None => Ok((authority.to_string(), default_port)),
    }
}

fn parse_port(port_str: &str) -> ProxyResult<u16> {
    port_str
        .parse::<u16>()
        .map_err(|_| ProxyError::MalformedRequest(format!("Invalid port: {}", port_str)))
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn read(raw: &[u8]) -> ProxyResult<ProxyRequest> {
        let mut reader = raw;
        read_request(&mut reader).await
    }

    #[tokio::test]
    async fn test_read_simple_get() {
        let req = read(b"GET /index.html?q=1 HTTP/1.1\r\nHost: example.com\r\nAccept: */*\r\n\r\n")
            .await
            .unwrap();

        assert_eq!(req.method, "GET");
        assert_eq!(req.target, "/index.html?q=1");
        assert_eq!(req.host, "example.com");
        assert!(req
            .headers
            .iter()
            .any(|(name, value)| name == "Accept" && value == b"*/*"));
        assert!(req.body.is_empty());
        assert_eq!(req.outbound_url(), "https://example.com/index.html?q=1");
    }

    #[tokio::test]
    async fn test_read_content_length_body_ignores_trailing_bytes() {
        let req = read(
            b"POST /submit HTTP/1.1\r\nHost: example.com\r\nContent-Length: 5\r\n\r\nhelloEXTRA",
        )
        .await
        .unwrap();
        assert_eq!(req.body, b"hello");
    }

    #[tokio::test]
    async fn test_read_chunked_body_kept_raw() {
        let body = b"5\r\nhello\r\n6;ext=1\r\n world\r\n0\r\nX-Trailer: yes\r\n\r\n";
        let mut raw = b"POST /up HTTP/1.1\r\nHost: example.com\r\nTransfer-Encoding: chunked\r\n\r\n"
            .to_vec();
        raw.extend_from_slice(body);
        raw.extend_from_slice(b"GARBAGE");

        let req = read(&raw).await.unwrap();
        assert_eq!(req.body, body.to_vec());
    }

    #[tokio::test]
    async fn test_missing_host_rejected() {
        let err = read(b"GET / HTTP/1.1\r\nAccept: */*\r\n\r\n").await.unwrap_err();
        assert!(matches!(err, ProxyError::MissingHost));

        let err = read(b"GET / HTTP/1.1\r\nHost:  \r\n\r\n").await.unwrap_err();
        assert!(matches!(err, ProxyError::MissingHost));
    }

    #[tokio::test]
    async fn test_conflicting_framing_rejected() {
        let err = read(
            b"POST / HTTP/1.1\r\nHost: a\r\nContent-Length: 3\r\nTransfer-Encoding: chunked\r\n\r\n",
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ProxyError::MalformedRequest(_)));
    }

    #[tokio::test]
    async fn test_truncated_body_rejected() {
        let err = read(b"POST / HTTP/1.1\r\nHost: a\r\nContent-Length: 10\r\n\r\nabc")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("body"));
    }

    #[tokio::test]
    async fn test_garbage_rejected() {
        let err = read(b"\x16\x03\x01\x02\x00garbage\r\n\r\n").await.unwrap_err();
        assert!(matches!(err, ProxyError::MalformedRequest(_)));

        let err = read(b"").await.unwrap_err();
        assert!(matches!(err, ProxyError::MalformedRequest(_)));
    }

    #[tokio::test]
    async fn test_oversized_head_rejected() {
        let mut raw = b"GET / HTTP/1.1\r\nHost: a\r\nX-Big: ".to_vec();
        raw.extend(std::iter::repeat(b'a').take(MAX_HEAD_BYTES));
        let err = read(&raw).await.unwrap_err();
        assert!(err.to_string().contains("exceeds"));
    }

    fn request(target: &str, host: &str) -> ProxyRequest {
        ProxyRequest {
            method: "GET".to_string(),
            target: target.to_string(),
            headers: vec![("Host".to_string(), host.as_bytes().to_vec())],
            host: host.to_string(),
            body: Vec::new(),
        }
    }

    #[test]
    fn test_outbound_destination_comes_from_host_header() {
        let req = request("http://attacker.test/steal?x=1", "good.example.com");
        assert_eq!(req.path_and_query(), "/steal?x=1");
        assert_eq!(req.outbound_url(), "https://good.example.com/steal?x=1");

        let req = request("https://attacker.test", "good.example.com");
        assert_eq!(req.outbound_url(), "https://good.example.com/");

        let req = request("https://attacker.test?q", "good.example.com");
        assert_eq!(req.path_and_query(), "/?q");
    }

    #[test]
    fn test_hostname_and_upstream() {
        let req = request("/", "good.example.com:8443");
        assert_eq!(req.hostname(), "good.example.com");
        assert_eq!(req.upstream().unwrap(), ("good.example.com".to_string(), 8443));

        let req = request("/", "good.example.com");
        assert_eq!(req.upstream().unwrap().1, 443);
    }

    #[test]
    fn test_encode_outbound_rewrites_connection_headers() {
        let req = ProxyRequest {
            method: "POST".to_string(),
            target: "https://elsewhere.test/api".to_string(),
            headers: vec![
                ("Host".to_string(), b"good.example.com".to_vec()),
                ("Connection".to_string(), b"keep-alive".to_vec()),
                ("Keep-Alive".to_string(), b"timeout=5".to_vec()),
                ("Proxy-Connection".to_string(), b"keep-alive".to_vec()),
                ("Content-Length".to_string(), b"2".to_vec()),
            ],
            host: "good.example.com".to_string(),
            body: b"hi".to_vec(),
        };

        let encoded = String::from_utf8(req.encode_outbound()).unwrap();
        assert_eq!(
            encoded,
            "POST /api HTTP/1.1\r\nHost: good.example.com\r\nContent-Length: 2\r\nConnection: close\r\n\r\nhi"
        );
    }

    #[test]
    fn test_parse_host_port_variants() {
        assert_eq!(
            parse_host_port("api.example.com:443", 80).unwrap(),
            ("api.example.com".to_string(), 443)
        );
        assert_eq!(
            parse_host_port("api.example.com", 80).unwrap(),
            ("api.example.com".to_string(), 80)
        );
        assert_eq!(parse_host_port("[::1]:8443", 80).unwrap(), ("::1".to_string(), 8443));
        assert_eq!(parse_host_port("[::1]", 443).unwrap(), ("::1".to_string(), 443));
        assert!(parse_host_port("api.example.com:invalid", 443).is_err());
        assert!(parse_host_port("[::1", 443).is_err());
    }
}
