//! Audit event types for structured logging.
//!
//! These events record every security-relevant decision the proxy makes:
//! which destinations were allowed or blocked, which leaf certificates were
//! minted, and which requests were forwarded.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Audit events for security logging.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuditEvent {
    /// Both listeners are bound and accepting.
    ProxyStart {
        /// Front proxy listen address.
        front_addr: String,
        /// Tunnel terminator listen address.
        tunnel_addr: String,
        /// Number of compiled host rules.
        host_rules: usize,
        /// Number of compiled url rules.
        url_rules: usize,
        /// Process ID.
        pid: u32,
    },

    /// The proxy stopped accepting connections.
    ProxyStop {
        /// Time since start in seconds.
        uptime_sec: u64,
    },

    /// A destination passed the allow-list.
    AccessAllowed {
        /// Hostname or URL that was checked.
        target: String,
        /// Pattern that matched.
        matched: String,
        /// Where the check happened.
        stage: Stage,
    },

    /// A destination was refused by the allow-list.
    AccessBlocked {
        /// Hostname or URL that was checked.
        target: String,
        /// Where the check happened.
        stage: Stage,
    },

    /// A leaf certificate was minted for a handshake.
    CertificateIssued {
        /// DNS name on the certificate.
        dns_name: String,
        /// Serial number.
        serial: u64,
    },

    /// A request was re-issued toward its real destination.
    RequestForwarded {
        /// Outbound URL.
        url: String,
        /// Response bytes relayed back to the client.
        bytes: u64,
    },
}

/// Point in the request path where an ACL check ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Plain absolute-URI request on the front proxy.
    Forward,
    /// CONNECT request on the front proxy.
    Connect,
    /// Decrypted request inside the tunnel terminator.
    Tunnel,
}

/// Wrapper for serializing events with timestamp.
#[derive(Debug, Clone, Serialize)]
pub struct TimestampedEvent<'a> {
    /// ISO8601 timestamp.
    #[serde(rename = "ts")]
    pub timestamp: DateTime<Utc>,

    /// Connection the event belongs to, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conn: Option<&'a str>,

    /// The actual event (flattened into this struct).
    #[serde(flatten)]
    pub event: &'a AuditEvent,
}

impl AuditEvent {
    /// Wrap this event with a timestamp for serialization.
    pub fn with_timestamp(&self) -> TimestampedEvent<'_> {
        TimestampedEvent {
            timestamp: Utc::now(),
            conn: None,
            event: self,
        }
    }
}

impl<'a> TimestampedEvent<'a> {
    /// Attach a connection id.
    pub fn for_connection(mut self, conn: &'a str) -> Self {
        self.conn = Some(conn);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_proxy_start_serialization() {
        let event = AuditEvent::ProxyStart {
            front_addr: "0.0.0.0:38000".to_string(),
            tunnel_addr: "127.0.0.1:38443".to_string(),
            host_rules: 2,
            url_rules: 0,
            pid: 12345,
        };

        let json = serde_json::to_string(&event.with_timestamp()).unwrap();

        assert!(json.contains("\"event\":\"proxy_start\""));
        assert!(json.contains("\"front_addr\":\"0.0.0.0:38000\""));
        assert!(json.contains("\"host_rules\":2"));
        assert!(json.contains("\"pid\":12345"));
        assert!(json.contains("\"ts\""));
        assert!(!json.contains("\"conn\""));
    }

    #[test]
    fn test_access_allowed_serialization() {
        let event = AuditEvent::AccessAllowed {
            target: "internal.example.com".to_string(),
            matched: r"^internal\.example\.com$".to_string(),
            stage: Stage::Connect,
        };

        let json = serde_json::to_string(&event.with_timestamp()).unwrap();

        assert!(json.contains("\"event\":\"access_allowed\""));
        assert!(json.contains("\"target\":\"internal.example.com\""));
        assert!(json.contains("\"stage\":\"connect\""));
    }

    #[test]
    fn test_access_blocked_with_connection() {
        let event = AuditEvent::AccessBlocked {
            target: "https://good.example.com/other".to_string(),
            stage: Stage::Tunnel,
        };

        let json = serde_json::to_string(&event.with_timestamp().for_connection("abc-123")).unwrap();

        assert!(json.contains("\"event\":\"access_blocked\""));
        assert!(json.contains("\"stage\":\"tunnel\""));
        assert!(json.contains("\"conn\":\"abc-123\""));
    }

    #[test]
    fn test_certificate_issued_serialization() {
        let event = AuditEvent::CertificateIssued {
            dns_name: "example.com".to_string(),
            serial: 42,
        };

        let json = serde_json::to_string(&event.with_timestamp()).unwrap();

        assert!(json.contains("\"event\":\"certificate_issued\""));
        assert!(json.contains("\"serial\":42"));
    }

    #[test]
    fn test_request_forwarded_serialization() {
        let event = AuditEvent::RequestForwarded {
            url: "https://example.com/".to_string(),
            bytes: 179,
        };

        let json = serde_json::to_string(&event.with_timestamp()).unwrap();

        assert!(json.contains("\"event\":\"request_forwarded\""));
        assert!(json.contains("\"bytes\":179"));
    }

    #[test]
    fn test_proxy_stop_serialization() {
        let json =
            serde_json::to_string(&AuditEvent::ProxyStop { uptime_sec: 7 }.with_timestamp())
                .unwrap();
        assert!(json.contains("\"event\":\"proxy_stop\""));
        assert!(json.contains("\"uptime_sec\":7"));
    }
}
