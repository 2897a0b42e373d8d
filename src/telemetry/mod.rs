//! Telemetry and audit logging for egress-proxy.
//!
//! # Architecture
//!
//! - **Audit logging**: security decisions as JSON events, sent to the
//!   `audit` tracing target or to syslog with the `EGRESS_PROXY` tag
//! - **Debug logging** (tracing): diagnostic logs go to stderr via `tracing`
//!
//! The audit logger is created once at startup and handed to each component
//! by `Arc`. There is no global logger.
//!
//! # Usage
//!
//! ```ignore
//! use egress_proxy::telemetry::{AuditEvent, AuditLogger};
//!
//! let audit = Arc::new(AuditLogger::tracing());
//! audit.log(AuditEvent::ProxyStop { uptime_sec: 42 });
//! ```
//!
//! # Event Format
//!
//! ```json
//! {"ts":"2026-01-07T14:32:01Z","conn":"6f1c...","event":"certificate_issued","dns_name":"example.com","serial":4242}
//! ```

mod error;
mod events;
mod syslog;

pub use error::TelemetryError;
pub use events::{AuditEvent, Stage, TimestampedEvent};
pub use syslog::{AuditLogger, AUDIT_TARGET, SYSLOG_TAG};
