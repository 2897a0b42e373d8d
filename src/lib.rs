//! egress-proxy: allow-list egress proxy with on-demand TLS interception
//!
//! Internal clients use this crate's binary as their HTTP(S) proxy. Every
//! destination is checked against an allow-list of host or URL regular
//! expressions. HTTPS tunnels are terminated locally with a leaf certificate
//! minted for the requested server name and signed by an operator-supplied
//! Ed25519 root, so the decrypted request can be checked and re-issued.
//!
//! # Security Model
//!
//! The security model is **fail-closed**: an empty allow-list denies
//! everything, misconfiguration aborts startup, and any per-connection
//! failure closes the connection.
//!
//! # Architecture
//!
//! - **CA**: Ed25519 root loading and one-hour leaf issuance
//! - **Proxy**: ACL engine, front proxy and tunnel terminator
//! - **Config**: Hierarchical TOML configuration with CLI/environment overrides
//! - **Telemetry**: Structured audit events via tracing or syslog
//! - **Orchestrator**: Startup validation and listener supervision

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod ca;
pub mod cli;
pub mod config;
pub mod orchestrator;
pub mod proxy;
pub mod telemetry;
