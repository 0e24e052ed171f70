//! Telemetry line parser
//!
//! Converts one text line from the acquisition module into a [`Reading`].
//!
//! Wire format: `timestamp_ms,coolant_temp,oil_temp,oil_pressure,throttle_position`
//! with trailing channels optional. Anything after the fifth field is ignored.

use std::fmt;

use crate::reading::Reading;

/// Field delimiter on the wire
pub const DELIMITER: char = ',';

/// Number of fields the parser maps; extra fields are ignored
const MAPPED_FIELDS: usize = 5;

/// Why a line did not produce a reading.
///
/// None of these are errors in the propagating sense: the reader logs and
/// discards the line, and the connection-failure counter is untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineRejection {
    /// Blank line (or whitespace only)
    Empty,
    /// Textual first token, e.g. the `MX5 DAQ System Starting...` banner or
    /// the column header the module prints on boot
    Banner,
    /// Fewer than two fields: a bare timestamp carries no sensor data
    InsufficientFields {
        /// Number of fields found
        found: usize,
    },
    /// A field failed numeric conversion; the whole line is dropped
    InvalidField {
        /// Zero-based field position
        index: usize,
        /// Raw field text
        value: String,
    },
}

impl LineRejection {
    /// Banners and blank lines are expected chatter, not data problems
    pub fn is_noise(&self) -> bool {
        matches!(self, LineRejection::Empty | LineRejection::Banner)
    }
}

impl fmt::Display for LineRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LineRejection::Empty => write!(f, "empty line"),
            LineRejection::Banner => write!(f, "device banner"),
            LineRejection::InsufficientFields { found } => {
                write!(f, "insufficient fields: expected at least 2, got {}", found)
            }
            LineRejection::InvalidField { index, value } => {
                write!(f, "field {} is not numeric: '{}'", index, value)
            }
        }
    }
}

fn parse_field(fields: &[&str], index: usize) -> Result<Option<f64>, LineRejection> {
    let Some(raw) = fields.get(index) else {
        return Ok(None);
    };
    let raw = raw.trim();
    match raw.parse::<f64>() {
        Ok(v) if v.is_finite() => Ok(Some(v)),
        _ => Err(LineRejection::InvalidField {
            index,
            value: raw.to_string(),
        }),
    }
}

/// Parse one line into a [`Reading`].
///
/// Total and deterministic: the same input always yields the same result and
/// nothing here panics.
pub fn parse_line(line: &str) -> Result<Reading, LineRejection> {
    let line = line.trim();
    if line.is_empty() {
        return Err(LineRejection::Empty);
    }

    let fields: Vec<&str> = line.split(DELIMITER).take(MAPPED_FIELDS).collect();

    let timestamp_ms = match fields[0].trim().parse::<f64>() {
        Ok(v) => v,
        Err(_) => return Err(LineRejection::Banner),
    };
    if !timestamp_ms.is_finite() {
        return Err(LineRejection::InvalidField {
            index: 0,
            value: fields[0].trim().to_string(),
        });
    }

    if fields.len() < 2 {
        return Err(LineRejection::InsufficientFields {
            found: fields.len(),
        });
    }

    Ok(Reading {
        timestamp: timestamp_ms / 1000.0,
        coolant_temp: parse_field(&fields, 1)?,
        oil_temp: parse_field(&fields, 2)?,
        oil_pressure: parse_field(&fields, 3)?,
        throttle_position: parse_field(&fields, 4)?,
    })
}
