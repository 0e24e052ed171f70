//! CSV record format
//!
//! One header row, then one row per reading with the five columns in wire
//! order. Absent channels are written as empty cells.

use std::io::{self, Write};

use crate::reading::Reading;

/// Literal header row
pub const CSV_HEADER: &str = "timestamp,coolant_temp,oil_temp,oil_pressure,throttle_position";

/// Render one cell. Whole numbers keep a trailing `.0` so that every cell in a
/// column reads back as a float.
pub fn format_value(value: Option<f64>) -> String {
    match value {
        None => String::new(),
        Some(v) if v.fract() == 0.0 && v.abs() < 1e15 => format!("{:.1}", v),
        Some(v) => format!("{}", v),
    }
}

/// Write the header row
pub fn write_header<W: Write>(writer: &mut W) -> io::Result<()> {
    writeln!(writer, "{}", CSV_HEADER)
}

/// Write one data row
pub fn write_row<W: Write>(writer: &mut W, reading: &Reading) -> io::Result<()> {
    write!(writer, "{}", format_value(Some(reading.timestamp)))?;
    for value in reading.channels() {
        write!(writer, ",{}", format_value(value))?;
    }
    writeln!(writer)
}
