//! Kernel configuration
//!
//! An office can be built from a TOML file. Every field has a default, so an
//! empty file (or a missing section) yields a working passive office.
//!
//! ```toml
//! [office]
//! name = "orders"
//! default_timeout_ms = 5000
//! sourcing_sweep_ms = 50
//! operations_sweep_ms = 50
//!
//! [team]
//! kind = "pool"
//! num_workers = 4
//!
//! [logging]
//! level = "debug"
//! ```

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::util::logger::LogLevel;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KernelConfig {
    #[serde(default)]
    pub office: OfficeConfig,
    #[serde(default)]
    pub team: TeamConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Office settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfficeConfig {
    #[serde(default = "default_office_name")]
    pub name: String,
    /// Timeout for resources declaring none. Zero or absent disables it.
    #[serde(default)]
    pub default_timeout_ms: Option<u64>,
    /// Background sweep interval of sourcing monitors. Zero disables it.
    #[serde(default = "default_sweep_ms")]
    pub sourcing_sweep_ms: u64,
    /// Background sweep interval of operation monitors. Zero disables it.
    #[serde(default = "default_sweep_ms")]
    pub operations_sweep_ms: u64,
}

fn default_office_name() -> String {
    "office".to_string()
}

fn default_sweep_ms() -> u64 {
    50
}

impl Default for OfficeConfig {
    fn default() -> Self {
        Self {
            name: default_office_name(),
            default_timeout_ms: None,
            sourcing_sweep_ms: default_sweep_ms(),
            operations_sweep_ms: default_sweep_ms(),
        }
    }
}

impl OfficeConfig {
    pub fn default_timeout(&self) -> Option<Duration> {
        self.default_timeout_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }
}

/// Kind of the office's default team.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TeamKind {
    /// Runs work on the dispatching thread.
    #[default]
    Passive,
    /// One dedicated OS thread.
    Dedicated,
    /// Work-stealing worker pool.
    Pool,
}

/// Default team settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeamConfig {
    #[serde(default)]
    pub kind: TeamKind,
    #[serde(default = "default_team_name")]
    pub name: String,
    /// Pool size; defaults to the available parallelism.
    #[serde(default)]
    pub num_workers: Option<usize>,
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
}

fn default_team_name() -> String {
    "default".to_string()
}

fn default_idle_timeout_ms() -> u64 {
    1
}

impl Default for TeamConfig {
    fn default() -> Self {
        Self {
            kind: TeamKind::default(),
            name: default_team_name(),
            num_workers: None,
            idle_timeout_ms: default_idle_timeout_ms(),
        }
    }
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl LoggingConfig {
    pub fn log_level(&self) -> Result<LogLevel, ConfigError> {
        self.level
            .parse()
            .map_err(|_| ConfigError::InvalidValue {
                field: "logging.level",
                value: self.level.clone(),
            })
    }
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Config parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Config serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("Invalid value for {field}: '{value}'")]
    InvalidValue { field: &'static str, value: String },
}

/// Parse a configuration from TOML text.
pub fn from_toml_str(content: &str) -> Result<KernelConfig, ConfigError> {
    let config: KernelConfig = toml::from_str(content)?;
    config.logging.log_level()?;
    Ok(config)
}

/// Load a configuration file.
pub fn load_config(path: &Path) -> Result<KernelConfig, ConfigError> {
    let content = fs::read_to_string(path)?;
    from_toml_str(&content)
}

/// Write a configuration file, replacing any existing one.
pub fn save_config(
    path: &Path,
    config: &KernelConfig,
) -> Result<(), ConfigError> {
    let content = toml::to_string_pretty(config)?;
    fs::write(path, content)?;
    Ok(())
}

/// Sweep interval in milliseconds; zero means no background sweep.
pub fn sweep_interval(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}
