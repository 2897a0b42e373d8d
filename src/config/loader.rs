//! Configuration loading with hierarchy merging.
//!
//! Configuration is loaded from multiple sources and merged in order:
//!
//! 1. Embedded defaults (compiled into binary)
//! 2. System config: `/etc/egress-proxy/config.toml`
//! 3. Additional config file (via `--config` flag)
//! 4. CLI flags and environment variables (highest priority)
//!
//! Lists (ACL patterns) are **merged** (appended).
//! Scalars (addresses, timeouts, CA fields) are **overridden**.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use super::error::ConfigError;
use super::schema::{
    split_patterns, AclConfig, CaConfig, Config, LimitsConfig, ListenConfig, TelemetryConfig,
};
use crate::cli::Cli;

/// System-wide configuration path.
pub const SYSTEM_CONFIG_PATH: &str = "/etc/egress-proxy/config.toml";

/// Configuration loader with support for hierarchy merging.
pub struct ConfigLoader {
    /// Path to system-wide configuration.
    system_path: PathBuf,
}

impl ConfigLoader {
    /// Create a new ConfigLoader with default paths.
    #[must_use]
    pub fn new() -> Self {
        Self {
            system_path: PathBuf::from(SYSTEM_CONFIG_PATH),
        }
    }

    /// Create a ConfigLoader with a custom system path (for testing).
    #[must_use]
    pub fn with_paths(system_path: PathBuf) -> Self {
        Self { system_path }
    }

    /// Load and merge configuration from all sources.
    ///
    /// A missing system config is skipped. A missing `--config` file and
    /// invalid TOML anywhere are errors.
    pub fn load(&self, cli: &Cli) -> Result<Config, ConfigError> {
        // Start with embedded defaults
        let mut config = Config::default();

        // Load and merge system config
        if let Some(system_config) = self.load_file(&self.system_path)? {
            config.merge(system_config);
            debug!("Loaded system config from {:?}", self.system_path);
        } else {
            debug!("No system config found at {:?}", self.system_path);
        }

        // Load and merge additional config file from CLI
        if let Some(ref cli_config_path) = cli.config {
            match self.load_file(cli_config_path)? {
                Some(cli_config) => {
                    config.merge(cli_config);
                    debug!("Loaded additional config from {:?}", cli_config_path);
                }
                None => {
                    // Unlike the system config, a missing CLI-specified config is an error
                    return Err(ConfigError::ReadError {
                        path: cli_config_path.clone(),
                        source: std::io::Error::new(
                            std::io::ErrorKind::NotFound,
                            "Specified config file not found",
                        ),
                    });
                }
            }
        }

        // Apply CLI flags and environment (highest priority)
        config.merge(Self::cli_overlay(cli));

        Ok(config)
    }

    /// Build the config layer contributed by CLI flags and environment.
    fn cli_overlay(cli: &Cli) -> Config {
        // Only one pattern source is loaded: hosts win over urls
        let acl = match (&cli.allowed_hosts, &cli.allowed_urls) {
            (Some(hosts), _) => {
                if cli.allowed_urls.is_some() {
                    debug!("ALLOWED_HOSTS is set; ignoring ALLOWED_URLS");
                }
                AclConfig {
                    allowed_hosts: split_patterns(hosts),
                    allowed_urls: Vec::new(),
                }
            }
            (None, Some(urls)) => AclConfig {
                allowed_hosts: Vec::new(),
                allowed_urls: split_patterns(urls),
            },
            (None, None) => AclConfig::default(),
        };

        Config {
            listen: ListenConfig {
                http: cli.http_listen_addr.clone(),
                tls: cli.tls_listen_addr.clone(),
            },
            acl,
            ca: CaConfig {
                cert: cli.ca_cert.clone(),
                key: cli.ca_key.clone(),
                country: cli.ca_country.clone(),
                province: cli.ca_province.clone(),
                locality: cli.ca_locality.clone(),
                organization: cli.ca_organization.clone(),
                organizational_unit: cli.ca_organizational_unit.clone(),
            },
            limits: LimitsConfig {
                handshake_timeout_secs: cli.handshake_timeout,
                upstream_timeout_secs: cli.upstream_timeout,
                max_connections: cli.max_connections,
            },
            telemetry: TelemetryConfig {
                syslog: cli.syslog.then_some(true),
                log_level: None,
            },
        }
    }

    /// Load a config file, returning None if it doesn't exist.
    fn load_file(&self, path: &Path) -> Result<Option<Config>, ConfigError> {
        match fs::read_to_string(path) {
            Ok(contents) => {
                let config: Config =
                    toml::from_str(&contents).map_err(|e| ConfigError::ParseError {
                        path: path.to_path_buf(),
                        source: e,
                    })?;
                Ok(Some(config))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ConfigError::ReadError {
                path: path.to_path_buf(),
                source: e,
            }),
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}
