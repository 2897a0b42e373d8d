//! Error types for proxy operations.
//!
//! This module defines structured error types for both listeners:
//! - ACL errors (pattern compilation at startup)
//! - Connection errors (I/O, TLS, deadlines)
//! - Request errors (malformed framing, missing Host)
//! - Upstream errors (connect failures, outbound timeouts)
//!
//! Every `ProxyError` is scoped to the connection that produced it.

use crate::ca::CaError;
use thiserror::Error;

/// Errors raised while compiling ACL rules.
#[derive(Debug, Error)]
pub enum AclError {
    /// A pattern is not a valid regular expression.
    #[error("Invalid {kind} pattern '{pattern}': {source}")]
    InvalidPattern {
        /// Rule set the pattern belongs to (`host` or `url`).
        kind: &'static str,
        /// The offending pattern text.
        pattern: String,
        /// Compilation error from the regex engine.
        #[source]
        source: regex::Error,
    },
}

/// Unified error type for per-connection proxy failures.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// I/O error (socket operations).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Hyper HTTP error.
    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    /// TLS error during handshake or configuration.
    #[error("TLS error: {0}")]
    Tls(String),

    /// The tunnel deadline elapsed before the request was read.
    #[error("Deadline exceeded during {0}")]
    Timeout(&'static str),

    /// The decrypted request could not be parsed.
    #[error("Malformed request: {0}")]
    MalformedRequest(String),

    /// The decrypted request carried no Host header.
    #[error("Request has no Host header")]
    MissingHost,

    /// Failed to connect to upstream server.
    #[error("Failed to connect to upstream '{addr}': {message}")]
    UpstreamConnect {
        /// The address we tried to connect to.
        addr: String,
        /// Error message.
        message: String,
    },

    /// The outbound call did not complete in time.
    #[error("Upstream '{0}' timed out")]
    UpstreamTimeout(String),

    /// A leaf certificate could not be issued for this connection.
    #[error("Certificate issuance failed: {0}")]
    CertIssuance(#[from] CaError),
}

/// Result type for proxy operations.
pub type ProxyResult<T> = Result<T, ProxyError>;

impl From<rustls::Error> for ProxyError {
    fn from(err: rustls::Error) -> Self {
        ProxyError::Tls(err.to_string())
    }
}
