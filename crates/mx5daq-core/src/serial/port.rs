//! Serial port handling
//!
//! Port discovery plus the [`SerialLink`]/[`Connector`] seam the reader is
//! written against. [`SerialPortConnector`] is the real implementation.

use serialport::{SerialPort, SerialPortInfo, SerialPortType};
use std::collections::HashMap;
#[cfg(target_os = "linux")]
use std::fs;
use std::io::{self, Read};
use std::time::Duration;
use tracing::{debug, warn};

use super::SerialError;

/// Keywords identifying the acquisition module's USB bridge
const SENSOR_PORT_KEYWORDS: [&str; 3] = ["arduino", "ch340", "usb serial"];

/// Information about an available serial port
#[derive(Debug, Clone)]
pub struct PortInfo {
    /// Port name (e.g., "/dev/ttyACM0" or "COM3")
    pub name: String,

    /// USB vendor ID (if USB device)
    pub vid: Option<u16>,

    /// USB product ID (if USB device)
    pub pid: Option<u16>,

    /// Manufacturer name (if available)
    pub manufacturer: Option<String>,

    /// Product name (if available)
    pub product: Option<String>,
}

impl PortInfo {
    fn bare(name: String) -> Self {
        Self {
            name,
            vid: None,
            pid: None,
            manufacturer: None,
            product: None,
        }
    }

    /// Whether the USB descriptors look like the acquisition module
    pub fn looks_like_sensor(&self) -> bool {
        [&self.product, &self.manufacturer]
            .into_iter()
            .flatten()
            .map(|s| s.to_lowercase())
            .any(|s| SENSOR_PORT_KEYWORDS.iter().any(|k| s.contains(k)))
    }
}

impl From<SerialPortInfo> for PortInfo {
    fn from(info: SerialPortInfo) -> Self {
        match info.port_type {
            SerialPortType::UsbPort(usb) => Self {
                name: info.port_name,
                vid: Some(usb.vid),
                pid: Some(usb.pid),
                manufacturer: usb.manufacturer,
                product: usb.product,
            },
            _ => Self::bare(info.port_name),
        }
    }
}

/// Sort key: ttyACM* first, then ttyUSB*, each numerically, then the rest by name
fn port_sort_key(name: &str) -> (u8, usize, String) {
    let basename = name.rsplit('/').next().unwrap_or(name);
    if let Some(rest) = basename.strip_prefix("ttyACM") {
        let num = rest.parse::<usize>().unwrap_or(usize::MAX);
        return (0, num, basename.to_string());
    }
    if let Some(rest) = basename.strip_prefix("ttyUSB") {
        let num = rest.parse::<usize>().unwrap_or(usize::MAX);
        return (1, num, basename.to_string());
    }
    (2, 0, basename.to_string())
}

/// List available serial ports in a deterministic order
pub fn list_ports() -> Vec<PortInfo> {
    let mut map: HashMap<String, PortInfo> = HashMap::new();
    for info in serialport::available_ports().unwrap_or_default() {
        let p = PortInfo::from(info);
        map.entry(p.name.clone()).or_insert(p);
    }

    // udev may not report every CDC device
    #[cfg(target_os = "linux")]
    if let Ok(entries) = fs::read_dir("/dev") {
        for entry in entries.flatten() {
            if let Some(fname) = entry.file_name().to_str() {
                if fname.starts_with("ttyACM") || fname.starts_with("ttyUSB") {
                    let full = format!("/dev/{}", fname);
                    map.entry(full.clone())
                        .or_insert_with(|| PortInfo::bare(full));
                }
            }
        }
    }

    let mut v: Vec<PortInfo> = map.into_values().collect();
    v.sort_by_key(|p| port_sort_key(&p.name));
    v
}

/// Pick the port the acquisition module is most likely attached to
pub fn find_sensor_port() -> Option<String> {
    select_sensor_port(&list_ports())
}

fn select_sensor_port(ports: &[PortInfo]) -> Option<String> {
    if let Some(port) = ports.iter().find(|p| p.looks_like_sensor()) {
        debug!(port = %port.name, "Detected acquisition module");
        return Some(port.name.clone());
    }
    let first = ports.first()?;
    warn!(port = %first.name, "Acquisition module not detected, falling back to first port");
    Some(first.name.clone())
}

/// One open byte stream from the acquisition module
pub trait SerialLink: Read + Send {
    /// Number of bytes ready to read without blocking
    fn bytes_to_read(&mut self) -> io::Result<u32>;
}

/// Opens links. The reader reconnects through this as well.
pub trait Connector: Send + Sync {
    /// Open `port` at `baud`, with reads bounded by `timeout`
    fn open(
        &self,
        port: &str,
        baud: u32,
        timeout: Duration,
    ) -> Result<Box<dyn SerialLink>, SerialError>;
}

/// Serial port wrapper implementing [`SerialLink`]
pub struct SerialChannel {
    port: Box<dyn SerialPort>,
}

impl SerialChannel {
    /// Wrap an open port
    pub fn new(port: Box<dyn SerialPort>) -> Self {
        Self { port }
    }
}

impl Read for SerialChannel {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.port.read(buf)
    }
}

impl SerialLink for SerialChannel {
    fn bytes_to_read(&mut self) -> io::Result<u32> {
        self.port.bytes_to_read().map_err(io::Error::other)
    }
}

/// [`Connector`] backed by the `serialport` crate
#[derive(Debug, Clone)]
pub struct SerialPortConnector {
    /// Wait after opening while the board resets
    settle_delay: Duration,
}

impl SerialPortConnector {
    /// Create a connector that waits `settle_delay` after each open
    pub fn new(settle_delay: Duration) -> Self {
        Self { settle_delay }
    }
}

impl Default for SerialPortConnector {
    fn default() -> Self {
        Self::new(Duration::from_millis(super::DEFAULT_SETTLE_DELAY_MS))
    }
}

impl Connector for SerialPortConnector {
    fn open(
        &self,
        port: &str,
        baud: u32,
        timeout: Duration,
    ) -> Result<Box<dyn SerialLink>, SerialError> {
        let open_failed = |reason: String| SerialError::OpenFailed {
            port: port.to_string(),
            baud,
            reason,
        };

        let mut handle = serialport::new(port, baud)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .timeout(timeout)
            .open()
            .map_err(|e| open_failed(e.to_string()))?;

        // Opening toggles DTR, which resets the board; keep it asserted afterwards
        if let Err(e) = handle.write_data_terminal_ready(true) {
            debug!(port, error = %e, "Failed to assert DTR (continuing)");
        }

        if !self.settle_delay.is_zero() {
            std::thread::sleep(self.settle_delay);
        }
        handle
            .clear(serialport::ClearBuffer::Input)
            .map_err(|e| open_failed(e.to_string()))?;

        Ok(Box::new(SerialChannel::new(handle)))
    }
}
