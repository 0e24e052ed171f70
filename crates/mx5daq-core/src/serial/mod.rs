//! Serial Communication
//!
//! Owns the physical link to the acquisition module and runs the read loop.
//!
//! The module prints newline-terminated ASCII lines at 115200 baud, nominally
//! 10 per second. The reader parses each line and hands accepted readings to
//! a [`Sink`](crate::sink::Sink).

mod error;
pub mod port;
mod reader;

pub use error::SerialError;
pub use port::{
    find_sensor_port, list_ports, Connector, PortInfo, SerialLink, SerialPortConnector,
};
pub use reader::{ConnectionState, ReaderConfig, SerialReader};

/// Default baud rate of the acquisition module
pub const DEFAULT_BAUD_RATE: u32 = 115200;

/// Per-read timeout in milliseconds
pub const DEFAULT_READ_TIMEOUT_MS: u64 = 1000;

/// Pause before each reconnect attempt in milliseconds
pub const DEFAULT_RECONNECT_DELAY_MS: u64 = 2000;

/// Consecutive connection failures tolerated before the reader gives up
pub const MAX_CONSECUTIVE_FAILURES: u32 = 5;

/// How long stop/disconnect wait for the read loop to exit, in milliseconds.
/// Longer than a reopen (settle delay) plus one blocking read.
pub const DEFAULT_STOP_TIMEOUT_MS: u64 = 5000;

/// Delay after opening the port while the microcontroller resets, in milliseconds
pub const DEFAULT_SETTLE_DELAY_MS: u64 = 2000;

/// Lines longer than this without a newline are discarded
pub const MAX_LINE_LENGTH: usize = 1024;
