//! Top-level error type

use thiserror::Error;

use crate::config::ConfigError;
use crate::datalog::LogError;
use crate::serial::SerialError;

/// Errors surfaced through the controller's control operations
#[derive(Error, Debug)]
pub enum DaqError {
    #[error(transparent)]
    Serial(#[from] SerialError),

    #[error(transparent)]
    Log(#[from] LogError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}
