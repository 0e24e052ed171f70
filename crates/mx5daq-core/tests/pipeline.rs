use mx5daq_core::config::DaqConfig;
use mx5daq_core::controller::Controller;
use mx5daq_core::datalog::CSV_HEADER;
use mx5daq_core::reading::Reading;
use mx5daq_core::serial::{Connector, SerialError, SerialLink};
use pretty_assertions::assert_eq;
use std::collections::VecDeque;
use std::io::{self, Read};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tempfile::TempDir;

/// Link fed by the test through a channel. Dropping the sender unplugs it.
struct FeedLink {
    rx: Receiver<Vec<u8>>,
    pending: VecDeque<u8>,
}

impl Read for FeedLink {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pending.is_empty() {
            match self.rx.recv_timeout(Duration::from_millis(5)) {
                Ok(bytes) => self.pending.extend(bytes),
                Err(RecvTimeoutError::Timeout) => {
                    return Err(io::Error::new(io::ErrorKind::TimedOut, "timeout"))
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(io::Error::new(io::ErrorKind::BrokenPipe, "unplugged"))
                }
            }
        }
        let n = buf.len().min(self.pending.len());
        for (slot, byte) in buf.iter_mut().zip(self.pending.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

impl SerialLink for FeedLink {
    fn bytes_to_read(&mut self) -> io::Result<u32> {
        Ok(self.pending.len() as u32)
    }
}

/// Hands out at most one link; later opens fail like an unplugged device
struct FeedConnector {
    link: Mutex<Option<FeedLink>>,
}

fn feed() -> (Sender<Vec<u8>>, Arc<FeedConnector>) {
    let (tx, rx) = mpsc::channel();
    let connector = Arc::new(FeedConnector {
        link: Mutex::new(Some(FeedLink {
            rx,
            pending: VecDeque::new(),
        })),
    });
    (tx, connector)
}

impl Connector for FeedConnector {
    fn open(
        &self,
        port: &str,
        baud: u32,
        _timeout: Duration,
    ) -> Result<Box<dyn SerialLink>, SerialError> {
        match self.link.lock().unwrap().take() {
            Some(link) => Ok(Box::new(link)),
            None => Err(SerialError::OpenFailed {
                port: port.to_string(),
                baud,
                reason: "device unplugged".into(),
            }),
        }
    }
}

fn test_config(dir: &TempDir) -> DaqConfig {
    let mut config = DaqConfig::default();
    config.logging.directory = dir.path().to_path_buf();
    config.logging.auto_log = false;
    config.serial.read_timeout_ms = 5;
    config.serial.reconnect_delay_ms = 5;
    config.serial.settle_delay_ms = 0;
    config
}

fn send(tx: &Sender<Vec<u8>>, text: &str) {
    tx.send(text.as_bytes().to_vec()).unwrap();
}

fn recv(rx: &mut tokio::sync::mpsc::Receiver<Reading>) -> Reading {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        match rx.try_recv() {
            Ok(reading) => return reading,
            Err(_) if Instant::now() < deadline => std::thread::sleep(Duration::from_millis(2)),
            Err(e) => panic!("no reading received: {e}"),
        }
    }
}

fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    false
}

#[test]
fn test_readings_reach_subscribers_and_log_in_order() {
    let dir = TempDir::new().unwrap();
    let (tx, connector) = feed();
    let mut controller = Controller::with_connector(test_config(&dir), connector);

    let (_a, mut rx_a) = controller.subscribe_channel();
    let (_b, mut rx_b) = controller.subscribe_channel();

    controller.connect("sim", 115200).unwrap();
    let session = controller.start_logging(Some("pipeline")).unwrap();
    controller.start_streaming().unwrap();

    send(&tx, "MX5 DAQ System Starting...\r\n");
    send(&tx, "timestamp_ms,coolant_temp_c\r\n");
    send(&tx, "1000,90.5,95.2,40.0,20.0\r\n2000,88.1\r\n");
    send(&tx, "2100,oops\r\n2200,89.0,96.0\r\n");

    let expected = [
        Reading {
            timestamp: 1.0,
            coolant_temp: Some(90.5),
            oil_temp: Some(95.2),
            oil_pressure: Some(40.0),
            throttle_position: Some(20.0),
        },
        Reading {
            timestamp: 2.0,
            coolant_temp: Some(88.1),
            oil_temp: None,
            oil_pressure: None,
            throttle_position: None,
        },
        Reading {
            timestamp: 2.2,
            coolant_temp: Some(89.0),
            oil_temp: Some(96.0),
            oil_pressure: None,
            throttle_position: None,
        },
    ];
    for reading in &expected {
        assert_eq!(&recv(&mut rx_a), reading);
        assert_eq!(&recv(&mut rx_b), reading);
    }

    controller.stop_streaming().unwrap();
    let info = controller.stop_logging().unwrap().unwrap();
    assert_eq!(info.rows, 3);

    let contents = std::fs::read_to_string(&session.info().path).unwrap();
    assert_eq!(
        contents,
        format!(
            "{}\n1.0,90.5,95.2,40.0,20.0\n2.0,88.1,,,\n2.2,89.0,96.0,,\n",
            CSV_HEADER
        )
    );
}

#[test]
fn test_dropped_subscriber_does_not_disturb_others() {
    let dir = TempDir::new().unwrap();
    let (tx, connector) = feed();
    let mut controller = Controller::with_connector(test_config(&dir), connector);

    let (_gone, rx_gone) = controller.subscribe_channel();
    let (_alive, mut rx_alive) = controller.subscribe_channel();
    controller.connect("sim", 115200).unwrap();
    controller.start_streaming().unwrap();

    send(&tx, "100,80.0\n");
    assert_eq!(recv(&mut rx_alive).timestamp, 0.1);

    drop(rx_gone);
    send(&tx, "200,80.5\n300,81.0\n");
    assert_eq!(recv(&mut rx_alive).timestamp, 0.2);
    assert_eq!(recv(&mut rx_alive).timestamp, 0.3);
    assert_eq!(controller.status().subscribers, 1);

    controller.disconnect().unwrap();
}

#[test]
fn test_unplugged_device_ends_in_disconnected_state() {
    let dir = TempDir::new().unwrap();
    let (tx, connector) = feed();
    let mut controller = Controller::with_connector(test_config(&dir), connector);
    let (_id, mut rx) = controller.subscribe_channel();

    controller.connect("sim", 115200).unwrap();
    controller.start_streaming().unwrap();
    send(&tx, "100,80.0\n");
    recv(&mut rx);

    drop(tx);
    assert!(wait_until(|| !controller.status().connected));

    let status = controller.status();
    assert!(!status.streaming);
    assert!(controller.start_streaming().is_err());
    controller.stop_streaming().unwrap();
}

#[test]
fn test_no_deliveries_after_stop() {
    let dir = TempDir::new().unwrap();
    let (tx, connector) = feed();
    let mut controller = Controller::with_connector(test_config(&dir), connector);
    let (_id, mut rx) = controller.subscribe_channel();

    controller.connect("sim", 115200).unwrap();
    controller.start_streaming().unwrap();
    send(&tx, "100,80.0\n");
    recv(&mut rx);

    controller.stop_streaming().unwrap();
    send(&tx, "200,80.0\n");
    std::thread::sleep(Duration::from_millis(50));
    assert!(rx.try_recv().is_err());

    // Resuming picks up what the device sent in the meantime
    controller.start_streaming().unwrap();
    assert_eq!(recv(&mut rx).timestamp, 0.2);
    controller.disconnect().unwrap();
}
