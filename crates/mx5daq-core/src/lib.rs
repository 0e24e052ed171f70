//! # MX5 DAQ Core Library
//!
//! Ingestion pipeline for the MX5 data acquisition module.

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//!
//! This library provides:
//! - Line parsing of the module's comma-separated telemetry records
//! - A serial reader with bounded automatic reconnection
//! - Broadcast fan-out of readings to any number of subscribers
//! - Session-scoped CSV logging with a periodic flush discipline
//! - A controller that ties the pieces together behind a small control surface
//!
//! ## Example
//!
//! ```rust,ignore
//! use mx5daq_core::prelude::*;
//!
//! let mut controller = Controller::new(DaqConfig::default());
//! let (_id, mut readings) = controller.hub().channel();
//!
//! controller.connect("/dev/ttyACM0", DEFAULT_BAUD_RATE)?;
//! controller.start_streaming()?;
//!
//! while let Some(reading) = readings.blocking_recv() {
//!     println!("{}", reading.to_json());
//! }
//! ```

pub mod config;
pub mod controller;
pub mod datalog;
pub mod error;
pub mod hub;
pub mod parser;
pub mod reading;
pub mod serial;
pub mod sink;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::DaqConfig;
    pub use crate::controller::{Controller, SystemStatus};
    pub use crate::datalog::DataLogger;
    pub use crate::error::DaqError;
    pub use crate::hub::{BroadcastHub, DeliveryError, Endpoint, SubscriptionId};
    pub use crate::parser::{parse_line, LineRejection};
    pub use crate::reading::Reading;
    pub use crate::serial::{ConnectionState, SerialReader, DEFAULT_BAUD_RATE};
    pub use crate::sink::Sink;
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
