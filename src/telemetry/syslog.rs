//! Audit logger and its sinks.
//!
//! Audit events are serialized to JSON and written to one sink:
//! - `tracing` under the `audit` target (default)
//! - the local syslog daemon tagged `EGRESS_PROXY`
//! - nowhere (null logger, for tests)

use std::sync::Mutex;

use syslog::{Facility, Formatter3164};
use tracing::{debug, error, info};

use super::error::TelemetryError;
use super::events::{AuditEvent, TimestampedEvent};

/// Syslog tag for all audit events.
pub const SYSLOG_TAG: &str = "EGRESS_PROXY";

/// Tracing target used by the tracing sink.
pub const AUDIT_TARGET: &str = "audit";

type SyslogWriter = syslog::Logger<syslog::LoggerBackend, Formatter3164>;

enum Sink {
    Tracing,
    Syslog(Mutex<SyslogWriter>),
    Null,
}

/// Audit logger that writes structured JSON events.
///
/// Shared by `Arc` between both listeners and every connection task.
pub struct AuditLogger {
    sink: Sink,
}

impl AuditLogger {
    /// Create an audit logger that emits events through `tracing`.
    pub fn tracing() -> Self {
        Self {
            sink: Sink::Tracing,
        }
    }

    /// Create an audit logger connected to syslog.
    ///
    /// Uses Unix socket connection to local syslog daemon.
    pub fn syslog() -> Result<Self, TelemetryError> {
        let formatter = Formatter3164 {
            facility: Facility::LOG_DAEMON,
            hostname: None,
            process: SYSLOG_TAG.to_string(),
            pid: std::process::id(),
        };

        let writer = syslog::unix(formatter)
            .map_err(|e| TelemetryError::SyslogConnection(e.to_string()))?;

        debug!("Connected to syslog with tag '{}'", SYSLOG_TAG);
        Ok(Self {
            sink: Sink::Syslog(Mutex::new(writer)),
        })
    }

    /// Create a null audit logger that discards all events.
    ///
    /// Useful for testing when syslog is not available.
    pub fn new_null() -> Self {
        Self { sink: Sink::Null }
    }

    /// Log an audit event.
    pub fn log(&self, event: AuditEvent) {
        if self.is_null() {
            return;
        }
        self.write(event.with_timestamp());
    }

    /// Log an audit event tagged with a connection id.
    pub fn log_for_connection(&self, event: AuditEvent, conn: &str) {
        if self.is_null() {
            return;
        }
        self.write(event.with_timestamp().for_connection(conn));
    }

    fn write(&self, timestamped: TimestampedEvent<'_>) {
        let json = match serde_json::to_string(&timestamped) {
            Ok(json) => json,
            Err(e) => {
                error!("Failed to serialize audit event: {}", e);
                return;
            }
        };

        match &self.sink {
            Sink::Tracing => info!(target: AUDIT_TARGET, "{}", json),
            Sink::Syslog(writer) => match writer.lock() {
                Ok(mut writer) => {
                    if let Err(e) = writer.info(&json) {
                        error!("Failed to write to syslog: {}", e);
                    }
                }
                Err(e) => {
                    error!("Failed to acquire syslog writer lock: {}", e);
                }
            },
            Sink::Null => {}
        }
    }

    /// Check if this is a null logger.
    pub fn is_null(&self) -> bool {
        matches!(self.sink, Sink::Null)
    }
}

impl std::fmt::Debug for AuditLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let sink = match self.sink {
            Sink::Tracing => "tracing",
            Sink::Syslog(_) => "syslog",
            Sink::Null => "null",
        };
        f.debug_struct("AuditLogger").field("sink", &sink).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_syslog_tag() {
        assert_eq!(SYSLOG_TAG, "EGRESS_PROXY");
    }

    #[test]
    fn test_null_logger_discards() {
        let logger = AuditLogger::new_null();
        assert!(logger.is_null());
        logger.log(AuditEvent::ProxyStop { uptime_sec: 1 });
    }

    #[test]
    fn test_tracing_logger_logs() {
        let logger = AuditLogger::tracing();
        assert!(!logger.is_null());
        logger.log_for_connection(
            AuditEvent::CertificateIssued {
                dns_name: "example.com".to_string(),
                serial: 1,
            },
            "conn-1",
        );
        assert_eq!(format!("{:?}", logger), "AuditLogger { sink: \"tracing\" }");
    }

    // Integration test - requires syslog daemon
    #[test]
    #[ignore = "Requires running syslog daemon"]
    fn test_syslog_logger_creation() {
        let logger = AuditLogger::syslog().unwrap();
        logger.log(AuditEvent::ProxyStop { uptime_sec: 0 });
    }
}
