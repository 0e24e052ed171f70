//! Configuration
//!
//! A single JSON file with serde defaults for every field, plus an
//! environment override for the serial port.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

use crate::datalog::DEFAULT_SESSION_NAME;
use crate::hub::DEFAULT_QUEUE_CAPACITY;
use crate::serial::{
    ReaderConfig, DEFAULT_BAUD_RATE, DEFAULT_READ_TIMEOUT_MS, DEFAULT_RECONNECT_DELAY_MS,
    DEFAULT_SETTLE_DELAY_MS, DEFAULT_STOP_TIMEOUT_MS, MAX_CONSECUTIVE_FAILURES,
};

/// Environment variable overriding `serial.port`
pub const PORT_ENV_VAR: &str = "MX5DAQ_SERIAL_PORT";

/// Older name of [`PORT_ENV_VAR`], still honored
pub const LEGACY_PORT_ENV_VAR: &str = "SERIAL_PORT";

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid config value: {0}")]
    Invalid(String),
}

/// Serial link settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialSettings {
    /// Port name; empty means auto-detect
    pub port: String,
    /// Baud rate
    pub baud_rate: u32,
    /// Per-read timeout
    pub read_timeout_ms: u64,
    /// Pause before each reconnect attempt
    pub reconnect_delay_ms: u64,
    /// Consecutive connection failures before giving up
    pub max_consecutive_failures: u32,
    /// Bounded wait for the read loop to stop
    pub stop_timeout_ms: u64,
    /// Wait after opening the port while the board resets
    pub settle_delay_ms: u64,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            port: String::new(),
            baud_rate: DEFAULT_BAUD_RATE,
            read_timeout_ms: DEFAULT_READ_TIMEOUT_MS,
            reconnect_delay_ms: DEFAULT_RECONNECT_DELAY_MS,
            max_consecutive_failures: MAX_CONSECUTIVE_FAILURES,
            stop_timeout_ms: DEFAULT_STOP_TIMEOUT_MS,
            settle_delay_ms: DEFAULT_SETTLE_DELAY_MS,
        }
    }
}

/// CSV logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Directory for session files
    pub directory: PathBuf,
    /// Open a session automatically when streaming starts
    pub auto_log: bool,
    /// Session name used when none is given
    pub default_session: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("data/logs"),
            auto_log: true,
            default_session: DEFAULT_SESSION_NAME.into(),
        }
    }
}

/// Broadcast hub settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HubSettings {
    /// Queue depth of channel subscriptions
    pub subscriber_queue_capacity: usize,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            subscriber_queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DaqConfig {
    /// Serial link
    pub serial: SerialSettings,
    /// CSV logging
    pub logging: LoggingSettings,
    /// Subscriber fan-out
    pub hub: HubSettings,
}

impl DaqConfig {
    /// Default config file location (`<config dir>/mx5daq/config.json`)
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("mx5daq").join("config.json"))
    }

    /// Parse a JSON document
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Load from `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let config = match std::fs::read_to_string(path) {
            Ok(contents) => Self::from_json(&contents).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "Config file not found, using defaults");
                Self::default()
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Apply environment overrides
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let port = lookup(PORT_ENV_VAR)
            .or_else(|| lookup(LEGACY_PORT_ENV_VAR))
            .filter(|p| !p.trim().is_empty());
        if let Some(port) = port {
            info!(port = %port, "Serial port overridden from environment");
            self.serial.port = port.trim().to_string();
        }
    }

    /// Reject values the pipeline cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.serial.baud_rate == 0 {
            return Err(ConfigError::Invalid("serial.baud_rate must be > 0".into()));
        }
        if self.serial.max_consecutive_failures == 0 {
            return Err(ConfigError::Invalid(
                "serial.max_consecutive_failures must be > 0".into(),
            ));
        }
        let reopen_ms = self
            .serial
            .settle_delay_ms
            .saturating_add(self.serial.read_timeout_ms);
        if self.serial.stop_timeout_ms <= reopen_ms {
            return Err(ConfigError::Invalid(format!(
                "serial.stop_timeout_ms must exceed settle_delay_ms + read_timeout_ms ({} ms)",
                reopen_ms
            )));
        }
        if self.hub.subscriber_queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "hub.subscriber_queue_capacity must be > 0".into(),
            ));
        }
        Ok(())
    }

    /// Reader policy derived from the serial settings
    pub fn reader_config(&self) -> ReaderConfig {
        ReaderConfig {
            read_timeout: Duration::from_millis(self.serial.read_timeout_ms),
            reconnect_delay: Duration::from_millis(self.serial.reconnect_delay_ms),
            max_consecutive_failures: self.serial.max_consecutive_failures,
            stop_timeout: Duration::from_millis(self.serial.stop_timeout_ms),
        }
    }
}
