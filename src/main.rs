//! egress-proxy: allow-list egress proxy with on-demand TLS interception
//!
//! This is the main entry point for the egress-proxy binary. It handles CLI
//! argument parsing, configuration loading, telemetry initialization, and
//! hands the validated context to the orchestrator.
//!
//! # Output
//!
//! - **Diagnostic logging**: tracing to stderr, level from `-v`, the config
//!   file or `RUST_LOG`
//! - **Audit logging**: JSON events through tracing (target `audit`) or, with
//!   `--syslog`, to the local syslog daemon

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use egress_proxy::{
    cli::Cli,
    config::ConfigLoader,
    orchestrator::{self, ProxyContext},
    telemetry::AuditLogger,
};
use tracing::debug;

fn main() -> Result<()> {
    // Parse CLI arguments first (before any other initialization)
    let cli = Cli::parse();

    // Load configuration with hierarchy merging
    let config = ConfigLoader::new()
        .load(&cli)
        .context("Failed to load configuration")?;

    init_tracing(cli.verbose, config.telemetry.log_level.as_deref())?;

    debug!("Parsed CLI arguments: {:?}", cli);

    let audit = if config.telemetry.syslog.unwrap_or(false) {
        AuditLogger::syslog().context("Failed to initialize syslog audit logging")?
    } else {
        AuditLogger::tracing()
    };

    // Validate everything before binding anything
    let context = ProxyContext::initialize(&config, Arc::new(audit))
        .context("Invalid proxy configuration")?;

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to create tokio runtime")?;

    rt.block_on(orchestrator::run(context))
}

/// Initialize the tracing subscriber for diagnostic logging.
///
/// # Verbosity Levels
/// - 0 (default): `RUST_LOG`, else the configured level, else info
/// - 1 (-v): Info level
/// - 2 (-vv): Debug level
/// - 3+ (-vvv): Trace level
fn init_tracing(verbose: u8, configured: Option<&str>) -> Result<()> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = match verbose {
        0 => EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(configured.unwrap_or("info"))),
        1 => EnvFilter::new("info"),
        2 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .try_init()
        .context("Failed to initialize tracing subscriber")?;

    Ok(())
}
