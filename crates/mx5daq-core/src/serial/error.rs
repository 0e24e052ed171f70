//! Serial errors

use thiserror::Error;

/// Errors that can occur on the serial side of the pipeline
#[derive(Error, Debug)]
pub enum SerialError {
    #[error("Failed to open {port} at {baud} baud: {reason}")]
    OpenFailed {
        port: String,
        baud: u32,
        reason: String,
    },

    #[error("Not connected to the acquisition module")]
    NotConnected,

    #[error("No serial port found")]
    PortNotFound,

    #[error("Read loop did not stop within {0} ms")]
    StopTimeout(u64),

    #[error("Failed to spawn read loop: {0}")]
    Spawn(#[source] std::io::Error),
}
