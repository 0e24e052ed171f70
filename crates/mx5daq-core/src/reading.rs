//! Sensor readings
//!
//! One parsed telemetry sample from the acquisition module.

use serde::{Deserialize, Serialize};

/// Column names in wire and log order.
pub const FIELD_NAMES: [&str; 5] = [
    "timestamp",
    "coolant_temp",
    "oil_temp",
    "oil_pressure",
    "throttle_position",
];

/// A point-in-time sensor sample.
///
/// The timestamp is always present; every sensor channel is independently
/// optional because the module only transmits the channels it has enabled.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    /// Seconds since module power-up (device millisecond counter / 1000)
    pub timestamp: f64,
    /// Coolant temperature in °C
    pub coolant_temp: Option<f64>,
    /// Oil temperature in °C
    pub oil_temp: Option<f64>,
    /// Oil pressure in PSI
    pub oil_pressure: Option<f64>,
    /// Throttle position in percent
    pub throttle_position: Option<f64>,
}

impl Reading {
    /// Create a reading with only a timestamp set
    pub fn new(timestamp: f64) -> Self {
        Self {
            timestamp,
            coolant_temp: None,
            oil_temp: None,
            oil_pressure: None,
            throttle_position: None,
        }
    }

    /// Sensor channels in wire order (coolant, oil temp, oil pressure, throttle)
    pub fn channels(&self) -> [Option<f64>; 4] {
        [
            self.coolant_temp,
            self.oil_temp,
            self.oil_pressure,
            self.throttle_position,
        ]
    }

    /// Render the outbound subscriber event. Absent channels become `null`.
    pub fn to_json(&self) -> String {
        // A struct of plain floats and options cannot fail to serialize.
        serde_json::to_string(self).unwrap_or_default()
    }
}
