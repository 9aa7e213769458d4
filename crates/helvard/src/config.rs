//! Configuration file parsing and structures.
//!
//! helvard uses TOML for declarative configuration. Each integration type has
//! a table under `[integrations]` keyed by entry id, so several routers can be
//! configured side by side.

#[cfg(feature = "integration_helvar")]
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::filter::Targets;

#[cfg(feature = "integration_helvar")]
use crate::integrations::helvar::HelvarConfig;

/// Top-level configuration structure
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub api: Option<ApiConfig>,

    #[serde(default)]
    pub integrations: IntegrationsConfig,
}

#[derive(Debug, Default, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => LevelFilter::TRACE,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Error => LevelFilter::ERROR,
        }
    }
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default)]
    pub level: LogLevel,

    /// Per-target levels, e.g. `"helvard::integrations::helvar" = "debug"`
    #[serde(default)]
    pub overrides: HashMap<String, LogLevel>,
}

impl LoggingConfig {
    /// Build the subscriber filter: the default level plus every override.
    pub fn filter(&self) -> Targets {
        self.overrides.iter().fold(
            Targets::new().with_default(LevelFilter::from(self.level)),
            |targets, (target, level)| targets.with_target(target.clone(), *level),
        )
    }
}

fn default_setup_retry_initial_secs() -> u64 {
    5
}

fn default_setup_retry_max_secs() -> u64 {
    300
}

/// Engine tuning
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct EngineConfig {
    /// Delay before the first retry of an integration that is not ready
    #[serde(default = "default_setup_retry_initial_secs")]
    pub setup_retry_initial_secs: u64,

    /// Upper bound for the doubling retry delay
    #[serde(default = "default_setup_retry_max_secs")]
    pub setup_retry_max_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            setup_retry_initial_secs: default_setup_retry_initial_secs(),
            setup_retry_max_secs: default_setup_retry_max_secs(),
        }
    }
}

fn default_api_listen() -> String {
    "127.0.0.1".to_string()
}

fn default_api_port() -> u16 {
    8565
}

/// HTTP API configuration. The API is only served when this table is present.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ApiConfig {
    #[serde(default = "default_api_listen")]
    pub listen: String,

    #[serde(default = "default_api_port")]
    pub port: u16,
}

/// Integration configuration container
#[derive(Debug, Default, Deserialize)]
pub struct IntegrationsConfig {
    /// Helvar routers. Key = entry id.
    #[cfg(feature = "integration_helvar")]
    #[serde(default)]
    pub helvar: BTreeMap<String, HelvarConfig>,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::Io(path.as_ref().to_path_buf(), e))?;

        contents.parse()
    }
}

impl std::str::FromStr for Config {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let config: Config = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }
}

impl Config {
    fn validate(&self) -> Result<(), ConfigError> {
        #[cfg(feature = "integration_helvar")]
        for (entry_id, helvar) in &self.integrations.helvar {
            if helvar.host.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "integrations.helvar.{}: host must not be empty",
                    entry_id
                )));
            }
            if helvar.poll_interval_secs == 0 {
                return Err(ConfigError::Invalid(format!(
                    "integrations.helvar.{}: poll_interval_secs must be positive",
                    entry_id
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {0}: {1}")]
    Io(PathBuf, #[source] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
