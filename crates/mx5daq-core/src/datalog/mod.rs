//! Data Logging
//!
//! Persists readings to session-scoped CSV files.

mod format;
mod recorder;

pub use format::{format_value, write_header, write_row, CSV_HEADER};
pub use recorder::{needs_flush, DataLogger, SessionInfo, SessionStart, DEFAULT_SESSION_NAME};

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while persisting a session
#[derive(Error, Debug)]
pub enum LogError {
    #[error("Failed to create log directory {path}: {source}")]
    CreateDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to create log file {path}: {source}")]
    CreateFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Write to {path} failed: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
