//! Data logger / recorder
//!
//! Writes readings to one CSV file per logging session.

use std::fs::{self, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use serde::Serialize;
use tracing::{error, info, warn};

use super::format::{write_header, write_row};
use super::LogError;
use crate::reading::Reading;

/// Session name used when the caller supplies none
pub const DEFAULT_SESSION_NAME: &str = "session";

/// Give up on unique file names after this many collisions
const MAX_NAME_ATTEMPTS: u32 = 100;

/// Flush when the integer part of `timestamp * 10` is a multiple of 10,
/// i.e. about once per second of device time at 10 Hz.
pub fn needs_flush(timestamp: f64) -> bool {
    (timestamp * 10.0) as i64 % 10 == 0
}

/// Snapshot of a logging session
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    /// Sanitized session name
    pub name: String,
    /// Output file
    pub path: PathBuf,
    /// Wall-clock creation time
    pub started_at: DateTime<Local>,
    /// Data rows written (header excluded)
    pub rows: u64,
    /// Flushes performed so far
    pub flushes: u64,
}

/// Result of [`DataLogger::start`]
#[derive(Debug, Clone)]
pub enum SessionStart {
    /// A new session file was opened
    Started(SessionInfo),
    /// A session was already running and has been left untouched
    AlreadyActive(SessionInfo),
}

impl SessionStart {
    /// The session that is active after the call
    pub fn info(&self) -> &SessionInfo {
        match self {
            SessionStart::Started(info) | SessionStart::AlreadyActive(info) => info,
        }
    }
}

struct Session {
    info: SessionInfo,
    writer: Box<dyn Write + Send>,
}

/// Data logger state
pub struct DataLogger {
    /// Directory receiving session files
    directory: PathBuf,
    /// Active session, if any
    session: Option<Session>,
}

impl DataLogger {
    /// Create an idle logger writing into `directory`
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            session: None,
        }
    }

    /// Directory receiving session files
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Check if a session is active
    pub fn is_logging(&self) -> bool {
        self.session.is_some()
    }

    /// Active session snapshot
    pub fn session(&self) -> Option<&SessionInfo> {
        self.session.as_ref().map(|s| &s.info)
    }

    /// Open a new session file, or report the one already running.
    ///
    /// The file is named `<name>_<YYYYmmdd_HHMMSS>.csv` and begins with the
    /// header row.
    pub fn start(&mut self, session_name: Option<&str>) -> Result<SessionStart, LogError> {
        if let Some(active) = &self.session {
            warn!(
                session = %active.info.name,
                path = %active.info.path.display(),
                "Logging already active, keeping current session"
            );
            return Ok(SessionStart::AlreadyActive(active.info.clone()));
        }

        fs::create_dir_all(&self.directory).map_err(|source| LogError::CreateDirectory {
            path: self.directory.clone(),
            source,
        })?;

        let name = sanitize_session_name(session_name);
        let started_at = Local::now();
        let stem = format!("{}_{}", name, started_at.format("%Y%m%d_%H%M%S"));
        let (path, file) = create_unique(&self.directory, &stem)?;

        let mut writer = BufWriter::new(file);
        write_header(&mut writer).map_err(|source| LogError::Write {
            path: path.clone(),
            source,
        })?;

        let info = SessionInfo {
            name,
            path,
            started_at,
            rows: 0,
            flushes: 0,
        };
        self.activate(info.clone(), Box::new(writer));
        info!(session = %info.name, path = %info.path.display(), "Logging started");
        Ok(SessionStart::Started(info))
    }

    fn activate(&mut self, info: SessionInfo, writer: Box<dyn Write + Send>) {
        self.session = Some(Session { info, writer });
    }

    /// Flush and close the active session. Returns `None` if already idle.
    ///
    /// The logger is idle afterwards even when the final flush fails.
    pub fn stop(&mut self) -> Result<Option<SessionInfo>, LogError> {
        let Some(mut session) = self.session.take() else {
            return Ok(None);
        };

        let result = session.writer.flush();
        let info = session.info;
        match result {
            Ok(()) => {
                info!(session = %info.name, rows = info.rows, "Logging stopped");
                Ok(Some(info))
            }
            Err(source) => {
                error!(session = %info.name, error = %source, "Final flush failed");
                Err(LogError::Write {
                    path: info.path,
                    source,
                })
            }
        }
    }

    /// Append one reading. No-op while idle.
    ///
    /// A write failure ends the session: the logger goes idle and the error
    /// is returned to the caller.
    pub fn record(&mut self, reading: &Reading) -> Result<(), LogError> {
        let Some(session) = self.session.as_mut() else {
            return Ok(());
        };

        if let Err(source) = write_session_row(session, reading) {
            let info = self.session.take().map(|s| s.info);
            let path = info.map(|i| i.path).unwrap_or_default();
            error!(path = %path.display(), error = %source, "Log write failed, session closed");
            return Err(LogError::Write { path, source });
        }
        Ok(())
    }
}

fn write_session_row(session: &mut Session, reading: &Reading) -> io::Result<()> {
    write_row(&mut session.writer, reading)?;
    session.info.rows += 1;

    if needs_flush(reading.timestamp) {
        session.writer.flush()?;
        session.info.flushes += 1;
    }
    Ok(())
}

fn sanitize_session_name(name: Option<&str>) -> String {
    let cleaned: String = name
        .unwrap_or_default()
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();

    if cleaned.is_empty() {
        DEFAULT_SESSION_NAME.to_string()
    } else {
        cleaned
    }
}

fn create_unique(directory: &Path, stem: &str) -> Result<(PathBuf, fs::File), LogError> {
    let mut path = directory.join(format!("{}.csv", stem));
    for attempt in 1..=MAX_NAME_ATTEMPTS {
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => return Ok((path, file)),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                path = directory.join(format!("{}_{}.csv", stem, attempt));
            }
            Err(source) => return Err(LogError::CreateFile { path, source }),
        }
    }
    Err(LogError::CreateFile {
        path,
        source: io::Error::new(io::ErrorKind::AlreadyExists, "no free session file name"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datalog::CSV_HEADER;
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    /// Writer that counts flushes and can be told to fail
    #[derive(Clone, Default)]
    struct Probe {
        flushes: Arc<Mutex<u64>>,
        fail: Arc<Mutex<bool>>,
    }

    impl Write for Probe {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if *self.fail.lock().unwrap() {
                return Err(io::Error::new(io::ErrorKind::Other, "disk full"));
            }
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            *self.flushes.lock().unwrap() += 1;
            Ok(())
        }
    }

    fn probe_logger(probe: &Probe) -> DataLogger {
        let mut logger = DataLogger::new("unused");
        logger.activate(
            SessionInfo {
                name: "probe".into(),
                path: PathBuf::from("probe.csv"),
                started_at: Local::now(),
                rows: 0,
                flushes: 0,
            },
            Box::new(probe.clone()),
        );
        logger
    }

    #[test]
    fn test_logger_basic() {
        let dir = TempDir::new().unwrap();
        let mut logger = DataLogger::new(dir.path().join("logs"));
        assert!(!logger.is_logging());

        let start = logger.start(Some("track day")).unwrap();
        assert!(matches!(start, SessionStart::Started(_)));
        assert!(logger.is_logging());
        let path = start.info().path.clone();
        let file_name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(file_name.starts_with("track_day_"));
        assert!(file_name.ends_with(".csv"));

        let mut reading = Reading::new(0.5);
        reading.coolant_temp = Some(90.5);
        logger.record(&reading).unwrap();

        let info = logger.stop().unwrap().unwrap();
        assert_eq!(info.rows, 1);
        assert!(!logger.is_logging());

        let contents = fs::read_to_string(&path).unwrap();
        assert_eq!(contents, format!("{}\n0.5,90.5,,,\n", CSV_HEADER));
    }

    #[test]
    fn test_second_start_keeps_first_session() {
        let dir = TempDir::new().unwrap();
        let mut logger = DataLogger::new(dir.path());

        let first = logger.start(Some("a")).unwrap().info().path.clone();
        logger.record(&Reading::new(0.1)).unwrap();

        let second = logger.start(Some("b")).unwrap();
        assert!(matches!(second, SessionStart::AlreadyActive(_)));
        assert_eq!(second.info().path, first);

        logger.record(&Reading::new(0.2)).unwrap();
        logger.stop().unwrap();

        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
        let rows = fs::read_to_string(&first).unwrap().lines().count();
        assert_eq!(rows, 3);
    }

    #[test]
    fn test_idle_operations_are_noops() {
        let dir = TempDir::new().unwrap();
        let mut logger = DataLogger::new(dir.path().join("never"));
        logger.record(&Reading::new(1.0)).unwrap();
        assert!(logger.stop().unwrap().is_none());
        assert!(!dir.path().join("never").exists());
    }

    #[test]
    fn test_flush_cadence_at_ten_hertz() {
        let probe = Probe::default();
        let mut logger = probe_logger(&probe);

        let n = 57;
        for i in 1..=n {
            logger.record(&Reading::new(i as f64 * 100.0 / 1000.0)).unwrap();
        }

        let flushes = *probe.flushes.lock().unwrap();
        assert!(flushes >= n / 10, "only {} flushes", flushes);
        assert_eq!(logger.session().unwrap().flushes, flushes);
    }

    #[test]
    fn test_flushed_rows_visible_before_stop() {
        let dir = TempDir::new().unwrap();
        let mut logger = DataLogger::new(dir.path());
        let path = logger.start(None).unwrap().info().path.clone();
        assert!(path
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with(DEFAULT_SESSION_NAME));

        logger.record(&Reading::new(0.9)).unwrap();
        logger.record(&Reading::new(1.0)).unwrap();

        let contents = fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 3);
        logger.stop().unwrap();
    }

    #[test]
    fn test_write_failure_ends_session() {
        let probe = Probe::default();
        let mut logger = probe_logger(&probe);
        logger.record(&Reading::new(0.1)).unwrap();

        *probe.fail.lock().unwrap() = true;
        let err = logger.record(&Reading::new(0.2)).unwrap_err();
        assert!(matches!(err, LogError::Write { .. }));
        assert!(!logger.is_logging());

        // Subsequent records are idle no-ops
        logger.record(&Reading::new(0.3)).unwrap();
    }

    #[test]
    fn test_needs_flush() {
        assert!(needs_flush(0.0));
        assert!(needs_flush(1.0));
        assert!(needs_flush(1.05));
        assert!(!needs_flush(1.1));
        assert!(!needs_flush(0.9));
    }

    #[test]
    fn test_sanitize_session_name() {
        assert_eq!(sanitize_session_name(None), "session");
        assert_eq!(sanitize_session_name(Some("  ")), "session");
        assert_eq!(sanitize_session_name(Some("../etc/x")), "___etc_x");
        assert_eq!(sanitize_session_name(Some("run-1_b")), "run-1_b");
    }
}
