//! Serial reader
//!
//! Connection lifecycle plus the background read loop.
//!
//! ```text
//! Disconnected --connect()--> Connected --start_streaming()--> Streaming
//!      ^                          ^                               |
//!      |                          +------stop_streaming()---------+
//!      +--disconnect() / too many consecutive failures------------+
//! ```

use serde::{Deserialize, Serialize};
use std::io::{self, Read};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use super::port::{Connector, SerialLink};
use super::{
    SerialError, DEFAULT_READ_TIMEOUT_MS, DEFAULT_RECONNECT_DELAY_MS, DEFAULT_STOP_TIMEOUT_MS,
    MAX_CONSECUTIVE_FAILURES, MAX_LINE_LENGTH,
};
use crate::parser::parse_line;
use crate::reading::Reading;
use crate::sink::Sink;

/// Granularity of interruptible sleeps in the read loop
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Bytes pulled from the link per read call
const READ_CHUNK: usize = 256;

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// No open link
    Disconnected,
    /// Link open, read loop idle
    Connected,
    /// Read loop running
    Streaming,
}

/// Reader timing and retry policy
#[derive(Debug, Clone)]
pub struct ReaderConfig {
    /// Upper bound on a single blocking read
    pub read_timeout: Duration,
    /// Pause before each reconnect attempt
    pub reconnect_delay: Duration,
    /// Consecutive failures after which the loop gives up
    pub max_consecutive_failures: u32,
    /// How long stop waits for the loop to exit
    pub stop_timeout: Duration,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_millis(DEFAULT_READ_TIMEOUT_MS),
            reconnect_delay: Duration::from_millis(DEFAULT_RECONNECT_DELAY_MS),
            max_consecutive_failures: MAX_CONSECUTIVE_FAILURES,
            stop_timeout: Duration::from_millis(DEFAULT_STOP_TIMEOUT_MS),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// State shared between the owner and the read loop
struct Shared {
    link: Mutex<Option<Box<dyn SerialLink>>>,
    state: Mutex<ConnectionState>,
    /// Port and baud of the last successful connect, for reconnects
    target: Mutex<Option<(String, u32)>>,
}

impl Shared {
    fn set_state(&self, state: ConnectionState) {
        *lock(&self.state) = state;
    }
}

/// Handle on a running read loop
struct Worker {
    running: Arc<AtomicBool>,
    done: mpsc::Receiver<()>,
    thread: JoinHandle<()>,
}

/// Owner of the physical link and its read loop
pub struct SerialReader {
    connector: Arc<dyn Connector>,
    config: ReaderConfig,
    shared: Arc<Shared>,
    worker: Option<Worker>,
}

impl SerialReader {
    /// Create a disconnected reader
    pub fn new(connector: Arc<dyn Connector>, config: ReaderConfig) -> Self {
        Self {
            connector,
            config,
            shared: Arc::new(Shared {
                link: Mutex::new(None),
                state: Mutex::new(ConnectionState::Disconnected),
                target: Mutex::new(None),
            }),
            worker: None,
        }
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        *lock(&self.shared.state)
    }

    /// Check if the read loop is running
    pub fn is_streaming(&self) -> bool {
        self.state() == ConnectionState::Streaming
    }

    /// Port and baud rate of the current (or last) connection
    pub fn target(&self) -> Option<(String, u32)> {
        lock(&self.shared.target).clone()
    }

    /// Reader policy
    pub fn config(&self) -> &ReaderConfig {
        &self.config
    }

    /// Open the link. An existing connection is closed first.
    pub fn connect(&mut self, port: &str, baud: u32) -> Result<(), SerialError> {
        if self.state() != ConnectionState::Disconnected {
            self.disconnect()?;
        }

        match self.connector.open(port, baud, self.config.read_timeout) {
            Ok(link) => {
                *lock(&self.shared.link) = Some(link);
                *lock(&self.shared.target) = Some((port.to_string(), baud));
                self.shared.set_state(ConnectionState::Connected);
                info!(port, baud, "Connected");
                Ok(())
            }
            Err(e) => {
                error!(port, baud, error = %e, "Connection failed");
                Err(e)
            }
        }
    }

    /// Stop streaming and close the link. Idempotent.
    ///
    /// The link is closed even if the read loop had to be abandoned; the
    /// stop timeout is still reported.
    pub fn disconnect(&mut self) -> Result<(), SerialError> {
        let stopped = self.stop_streaming();
        let had_link = lock(&self.shared.link).take().is_some();
        self.shared.set_state(ConnectionState::Disconnected);
        if had_link {
            info!("Disconnected");
        }
        stopped
    }

    /// Start the read loop, delivering every accepted reading to `sink`.
    ///
    /// No-op if already streaming.
    pub fn start_streaming(&mut self, sink: Arc<dyn Sink>) -> Result<(), SerialError> {
        self.reap_finished_worker();
        match self.state() {
            ConnectionState::Streaming => return Ok(()),
            ConnectionState::Disconnected => return Err(SerialError::NotConnected),
            ConnectionState::Connected => {}
        }
        let Some((port, baud)) = self.target() else {
            return Err(SerialError::NotConnected);
        };

        let running = Arc::new(AtomicBool::new(true));
        let (done_tx, done_rx) = mpsc::channel();
        let read_loop = ReadLoop {
            shared: self.shared.clone(),
            connector: self.connector.clone(),
            config: self.config.clone(),
            sink,
            running: running.clone(),
            port,
            baud,
            line: Vec::with_capacity(MAX_LINE_LENGTH),
            overflowed: false,
            failures: 0,
        };

        self.shared.set_state(ConnectionState::Streaming);
        let spawned = thread::Builder::new()
            .name("serial-reader".into())
            .spawn(move || {
                read_loop.run();
                let _ = done_tx.send(());
            });

        match spawned {
            Ok(thread) => {
                self.worker = Some(Worker {
                    running,
                    done: done_rx,
                    thread,
                });
                info!("Streaming started");
                Ok(())
            }
            Err(e) => {
                self.shared.set_state(ConnectionState::Connected);
                Err(SerialError::Spawn(e))
            }
        }
    }

    /// Stop the read loop and wait (bounded) for it to exit. Idempotent.
    ///
    /// After `Ok(())` no further deliveries happen. On
    /// [`SerialError::StopTimeout`] the loop is abandoned: it is told to stop
    /// and will not deliver again once its current read returns.
    pub fn stop_streaming(&mut self) -> Result<(), SerialError> {
        let Some(worker) = self.worker.take() else {
            return Ok(());
        };
        worker.running.store(false, Ordering::SeqCst);

        let result = match worker.done.recv_timeout(self.config.stop_timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                let _ = worker.thread.join();
                Ok(())
            }
            Err(RecvTimeoutError::Timeout) => {
                let timeout_ms = self.config.stop_timeout.as_millis() as u64;
                warn!(timeout_ms, "Read loop did not stop in time, abandoning it");
                Err(SerialError::StopTimeout(timeout_ms))
            }
        };

        self.settle_state();
        info!("Streaming stopped");
        result
    }

    /// Drop the handle of a loop that already exited on its own
    fn reap_finished_worker(&mut self) {
        let finished = self
            .worker
            .as_ref()
            .is_some_and(|w| !w.running.load(Ordering::SeqCst) || w.thread.is_finished());
        if finished {
            if let Some(worker) = self.worker.take() {
                worker.running.store(false, Ordering::SeqCst);
                let _ = worker.thread.join();
            }
            self.settle_state();
        }
    }

    fn settle_state(&self) {
        let state = if lock(&self.shared.link).is_some() {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        };
        self.shared.set_state(state);
    }
}

impl Drop for SerialReader {
    fn drop(&mut self) {
        let _ = self.disconnect();
    }
}

/// Why a poll of the link failed
#[derive(Debug)]
enum LinkFailure {
    Closed,
    Io(io::Error),
}

impl std::fmt::Display for LinkFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkFailure::Closed => write!(f, "link closed"),
            LinkFailure::Io(e) => write!(f, "{}", e),
        }
    }
}

/// State owned by the background thread
struct ReadLoop {
    shared: Arc<Shared>,
    connector: Arc<dyn Connector>,
    config: ReaderConfig,
    sink: Arc<dyn Sink>,
    running: Arc<AtomicBool>,
    port: String,
    baud: u32,
    /// Bytes of the line being assembled
    line: Vec<u8>,
    /// Skipping the rest of an overlong line
    overflowed: bool,
    /// Consecutive connection failures since the last delivered reading
    failures: u32,
}

impl ReadLoop {
    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn run(mut self) {
        debug!(port = %self.port, "Read loop running");
        while self.is_running() {
            let chunk = match self.poll() {
                Ok(chunk) => chunk,
                Err(failure) => {
                    if self.recover(failure) {
                        continue;
                    }
                    break;
                }
            };
            self.ingest(&chunk);
        }
        debug!(port = %self.port, "Read loop exited");
    }

    /// Read whatever is available. An empty chunk means nothing arrived
    /// within the read timeout.
    fn poll(&mut self) -> Result<Vec<u8>, LinkFailure> {
        let mut guard = lock(&self.shared.link);
        let link = guard.as_mut().ok_or(LinkFailure::Closed)?;

        let available = link.bytes_to_read().map_err(LinkFailure::Io)? as usize;
        let mut buf = vec![0u8; available.clamp(1, READ_CHUNK)];
        match link.read(&mut buf) {
            Ok(n) => {
                buf.truncate(n);
                Ok(buf)
            }
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) =>
            {
                Ok(Vec::new())
            }
            Err(e) => Err(LinkFailure::Io(e)),
        }
    }

    fn ingest(&mut self, chunk: &[u8]) {
        for &byte in chunk {
            if byte == b'\n' {
                if self.overflowed {
                    self.overflowed = false;
                    continue;
                }
                let raw = std::mem::take(&mut self.line);
                self.handle_line(&raw);
                self.line = raw;
                self.line.clear();
            } else if self.overflowed {
                continue;
            } else if self.line.len() >= MAX_LINE_LENGTH {
                warn!(
                    max = MAX_LINE_LENGTH,
                    "Line exceeds maximum length, discarding"
                );
                self.line.clear();
                self.overflowed = true;
            } else {
                self.line.push(byte);
            }
        }
    }

    fn handle_line(&mut self, raw: &[u8]) {
        let text = match std::str::from_utf8(raw) {
            Ok(text) => text.trim(),
            Err(e) => {
                warn!(error = %e, "Discarding undecodable line");
                return;
            }
        };
        if text.is_empty() {
            return;
        }

        match parse_line(text) {
            Ok(reading) => self.deliver(&reading),
            Err(rejection) if rejection.is_noise() => {
                debug!(line = text, "Skipping device banner");
            }
            Err(rejection) => {
                warn!(line = text, reason = %rejection, "Discarding malformed line");
            }
        }
    }

    fn deliver(&mut self, reading: &Reading) {
        if !self.is_running() {
            return;
        }
        let sink = &self.sink;
        if panic::catch_unwind(AssertUnwindSafe(|| sink.deliver(reading))).is_err() {
            error!(timestamp = reading.timestamp, "Sink panicked while delivering reading");
        }
        self.failures = 0;
    }

    /// Count a connection failure and try to reopen the link.
    /// Returns `false` when the loop should exit.
    fn recover(&mut self, failure: LinkFailure) -> bool {
        self.failures += 1;
        self.line.clear();
        self.overflowed = false;
        lock(&self.shared.link).take();

        let max = self.config.max_consecutive_failures;
        if self.failures >= max {
            error!(
                port = %self.port,
                failures = self.failures,
                error = %failure,
                "Max reconnection attempts reached, stopping stream"
            );
            self.running.store(false, Ordering::SeqCst);
            self.shared.set_state(ConnectionState::Disconnected);
            return false;
        }

        warn!(
            port = %self.port,
            failures = self.failures,
            max,
            error = %failure,
            "Connection lost, attempting reconnection"
        );
        if !self.sleep_while_running(self.config.reconnect_delay) {
            return false;
        }

        match self
            .connector
            .open(&self.port, self.baud, self.config.read_timeout)
        {
            // A stop may have been requested (and given up on) while the
            // open was in progress; the link must not outlive the loop.
            Ok(link) if !self.is_running() => {
                drop(link);
                debug!(port = %self.port, "Stopped during reconnect, closing reopened link");
                return false;
            }
            Ok(link) => {
                *lock(&self.shared.link) = Some(link);
                info!(port = %self.port, "Reconnected");
            }
            Err(e) => {
                warn!(port = %self.port, error = %e, "Reconnect attempt failed");
            }
        }
        true
    }

    /// Sleep for `duration` unless asked to stop first. Returns whether the
    /// loop is still running.
    fn sleep_while_running(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        while self.is_running() {
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            thread::sleep((deadline - now).min(STOP_POLL_INTERVAL));
        }
        false
    }
}
