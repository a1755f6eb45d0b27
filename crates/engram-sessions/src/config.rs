//! Configuration for the session runtime

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

/// Errors raised while loading configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Could not read the config file
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// Could not parse the config file
    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Tuning knobs for the session lifecycle.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct SessionConfig {
    /// Seconds of inactivity after which the sweeper ends a session
    #[serde(default = "default_timeout_threshold_secs")]
    pub timeout_threshold_secs: u64,

    /// Seconds between sweeper passes
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// Seconds between periodic durable counter flushes; 0 disables them
    #[serde(default = "default_flush_interval_secs")]
    pub flush_interval_secs: u64,
}

fn default_timeout_threshold_secs() -> u64 {
    2 * 60 * 60
}

fn default_sweep_interval_secs() -> u64 {
    5 * 60
}

fn default_flush_interval_secs() -> u64 {
    60
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timeout_threshold_secs: default_timeout_threshold_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            flush_interval_secs: default_flush_interval_secs(),
        }
    }
}

impl SessionConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inactivity threshold as a duration.
    #[must_use]
    pub fn timeout_threshold(&self) -> Duration {
        Duration::from_secs(self.timeout_threshold_secs)
    }

    /// Sweep interval as a duration.
    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    /// Periodic flush interval, or `None` when disabled.
    #[must_use]
    pub fn flush_interval(&self) -> Option<Duration> {
        if self.flush_interval_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.flush_interval_secs))
        }
    }

    /// Parses a configuration from a TOML string.
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    /// Loads a configuration file from disk.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }
}
