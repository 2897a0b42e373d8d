//! Configuration system for egress-proxy.
//!
//! This module provides TOML configuration loading with hierarchy merging.
//!
//! # Configuration Hierarchy
//!
//! Configuration is loaded from multiple sources and merged in order:
//!
//! 1. Embedded defaults
//! 2. System config: `/etc/egress-proxy/config.toml` (optional)
//! 3. Additional config file (via `--config` flag, must exist)
//! 4. CLI flags / environment variables (highest priority)
//!
//! # Merge Behavior
//!
//! - **Lists** (`allowed_hosts`, `allowed_urls`) are **merged** (appended)
//! - **Scalars** (addresses, timeouts, CA fields) are **overridden**
//!
//! # Environment
//!
//! `HTTP_LISTEN_ADDR`, `TLS_LISTEN_ADDR`, `ALLOWED_HOSTS`, `ALLOWED_URLS`,
//! `CA_CERT`, `CA_KEY`, `CA_COUNTRY`, `CA_PROVINCE`, `CA_LOCALITY`, `CA_O`
//! and `CA_OU` feed the highest-priority layer. Pattern lists are
//! newline-separated; if `ALLOWED_HOSTS` is set, `ALLOWED_URLS` is ignored.

mod error;
mod loader;
mod schema;

pub use error::ConfigError;
pub use loader::{ConfigLoader, SYSTEM_CONFIG_PATH};
pub use schema::{
    parse_listen_addr, split_patterns, AclConfig, CaConfig, Config, LimitsConfig, ListenConfig,
    TelemetryConfig, DEFAULT_HANDSHAKE_TIMEOUT_SECS, DEFAULT_HTTP_LISTEN_ADDR,
    DEFAULT_TLS_LISTEN_ADDR, DEFAULT_UPSTREAM_TIMEOUT_SECS,
};
