//! Controller
//!
//! Owns the reader, hub and logger and exposes the control surface the outer
//! layer (web server, CLI) drives. The controller makes no lifecycle decisions
//! of its own beyond the optional auto-logging on stream start.

use serde::Serialize;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info};

use crate::config::DaqConfig;
use crate::datalog::{DataLogger, SessionInfo, SessionStart};
use crate::error::DaqError;
use crate::hub::{BroadcastHub, Endpoint, SubscriptionId};
use crate::reading::Reading;
use crate::serial::{
    find_sensor_port, ConnectionState, Connector, SerialError, SerialPortConnector, SerialReader,
};
use crate::sink::Sink;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Snapshot of the pipeline for status endpoints
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SystemStatus {
    /// A link to the module is open
    pub connected: bool,
    /// The read loop is running
    pub streaming: bool,
    /// A logging session is active
    pub logging: bool,
    /// Port of the current connection
    pub port: Option<String>,
    /// File of the active logging session
    pub session_file: Option<PathBuf>,
    /// Most recent failure surfaced by the pipeline
    pub last_error: Option<String>,
    /// Registered subscribers
    pub subscribers: usize,
}

/// Sink the read loop delivers into: every subscriber first, then the log
struct PipelineSink {
    hub: Arc<BroadcastHub>,
    logger: Arc<Mutex<DataLogger>>,
    last_error: Arc<Mutex<Option<String>>>,
}

impl Sink for PipelineSink {
    fn deliver(&self, reading: &Reading) {
        self.hub.broadcast(reading);

        if let Err(e) = lock(&self.logger).record(reading) {
            error!(error = %e, "Logging session aborted");
            *lock(&self.last_error) = Some(e.to_string());
        }
    }
}

/// Drives the ingestion pipeline
pub struct Controller {
    config: DaqConfig,
    reader: SerialReader,
    hub: Arc<BroadcastHub>,
    logger: Arc<Mutex<DataLogger>>,
    last_error: Arc<Mutex<Option<String>>>,
}

impl Controller {
    /// Create a controller talking to real serial ports
    pub fn new(config: DaqConfig) -> Self {
        let settle = Duration::from_millis(config.serial.settle_delay_ms);
        Self::with_connector(config, Arc::new(SerialPortConnector::new(settle)))
    }

    /// Create a controller with a custom link factory
    pub fn with_connector(config: DaqConfig, connector: Arc<dyn Connector>) -> Self {
        let reader = SerialReader::new(connector, config.reader_config());
        let hub = Arc::new(BroadcastHub::new(config.hub.subscriber_queue_capacity));
        let logger = Arc::new(Mutex::new(DataLogger::new(config.logging.directory.clone())));
        Self {
            config,
            reader,
            hub,
            logger,
            last_error: Arc::new(Mutex::new(None)),
        }
    }

    /// Active configuration
    pub fn config(&self) -> &DaqConfig {
        &self.config
    }

    /// The broadcast hub, for direct subscription management
    pub fn hub(&self) -> &Arc<BroadcastHub> {
        &self.hub
    }

    fn remember<T, E: Into<DaqError>>(&self, result: Result<T, E>) -> Result<T, DaqError> {
        result.map_err(|e| {
            let e = e.into();
            *lock(&self.last_error) = Some(e.to_string());
            e
        })
    }

    /// Open the link to the module
    pub fn connect(&mut self, port: &str, baud: u32) -> Result<(), DaqError> {
        let result = self.reader.connect(port, baud);
        self.remember(result)
    }

    /// Connect using the configured port, auto-detecting it when unset
    pub fn connect_configured(&mut self) -> Result<String, DaqError> {
        let port = if self.config.serial.port.is_empty() {
            let detected = find_sensor_port().ok_or(SerialError::PortNotFound);
            self.remember(detected)?
        } else {
            self.config.serial.port.clone()
        };
        self.connect(&port, self.config.serial.baud_rate)?;
        Ok(port)
    }

    /// Stop streaming and close the link. Idempotent.
    pub fn disconnect(&mut self) -> Result<(), DaqError> {
        let result = self.reader.disconnect();
        self.remember(result)
    }

    /// Start delivering readings to subscribers (and the log, if active).
    ///
    /// With `logging.auto_log` set, a session is opened first if none is
    /// running; a failure to open it is recorded but does not prevent
    /// streaming. If the read loop then fails to start, that session is
    /// closed again.
    pub fn start_streaming(&mut self) -> Result<(), DaqError> {
        let auto_logged = self.config.logging.auto_log
            && !self.is_logging()
            && match self.start_logging(None) {
                Ok(start) => matches!(start, SessionStart::Started(_)),
                Err(e) => {
                    error!(error = %e, "Auto-logging could not start");
                    false
                }
            };

        let sink = Arc::new(PipelineSink {
            hub: self.hub.clone(),
            logger: self.logger.clone(),
            last_error: self.last_error.clone(),
        });
        let result = self.reader.start_streaming(sink);
        if result.is_err() && auto_logged {
            if let Err(e) = lock(&self.logger).stop() {
                error!(error = %e, "Failed to close auto-started session");
            }
        }
        self.remember(result)
    }

    /// Stop the read loop. Idempotent.
    pub fn stop_streaming(&mut self) -> Result<(), DaqError> {
        let result = self.reader.stop_streaming();
        self.remember(result)
    }

    /// Open a logging session. A running session is kept, and reported as
    /// [`SessionStart::AlreadyActive`].
    pub fn start_logging(&mut self, session_name: Option<&str>) -> Result<SessionStart, DaqError> {
        let name = session_name.unwrap_or(&self.config.logging.default_session);
        let result = lock(&self.logger).start(Some(name));
        self.remember(result)
    }

    /// Close the logging session. Returns `None` if none was active.
    pub fn stop_logging(&mut self) -> Result<Option<SessionInfo>, DaqError> {
        let result = lock(&self.logger).stop();
        self.remember(result)
    }

    /// Check if a logging session is active
    pub fn is_logging(&self) -> bool {
        lock(&self.logger).is_logging()
    }

    /// Register a subscriber endpoint
    pub fn subscribe<E: Endpoint + 'static>(&self, endpoint: E) -> SubscriptionId {
        self.hub.subscribe(endpoint)
    }

    /// Register a bounded channel subscriber
    pub fn subscribe_channel(&self) -> (SubscriptionId, mpsc::Receiver<Reading>) {
        self.hub.channel()
    }

    /// Deregister a subscriber
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.hub.unsubscribe(id)
    }

    /// Current state of the pipeline
    pub fn status(&self) -> SystemStatus {
        let state = self.reader.state();
        let session_file = lock(&self.logger).session().map(|s| s.path.clone());
        SystemStatus {
            connected: state != ConnectionState::Disconnected,
            streaming: state == ConnectionState::Streaming,
            logging: session_file.is_some(),
            port: (state != ConnectionState::Disconnected)
                .then(|| self.reader.target().map(|(port, _)| port))
                .flatten(),
            session_file,
            last_error: lock(&self.last_error).clone(),
            subscribers: self.hub.len(),
        }
    }

    /// Stop everything: streaming, logging, the link
    pub fn shutdown(&mut self) -> Result<(), DaqError> {
        let disconnected = self.disconnect();
        let logging = self.stop_logging();
        info!("Pipeline shut down");
        disconnected?;
        logging.map(|_| ())
    }
}
