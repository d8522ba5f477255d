// Logger handle, consumer thread and sinks

use anyhow::{Context, Result};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::SystemTime;

use super::{Facility, Severity};

/// Depth of the channel between producers and the consumer thread. When it
/// fills, entries are dropped and counted rather than blocking the data
/// plane.
const CHANNEL_DEPTH: usize = 4096;

/// One formatted-on-consume log record.
#[derive(Debug)]
pub struct LogEntry {
    pub timestamp: SystemTime,
    pub severity: Severity,
    pub facility: Facility,
    pub message: String,
}

/// Destination for consumed log entries.
pub trait LogSink: Send + 'static {
    fn write(&self, entry: &LogEntry);
}

/// Default sink: one line per entry on stderr.
pub struct StderrSink;

impl LogSink for StderrSink {
    fn write(&self, entry: &LogEntry) {
        let unix = entry
            .timestamp
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default();
        eprintln!(
            "[{}.{:03}] {} {}: {}",
            unix.as_secs(),
            unix.subsec_millis(),
            entry.severity,
            entry.facility,
            entry.message
        );
    }
}

/// Test sink collecting formatted lines in memory.
pub struct MemorySink {
    lines: Arc<Mutex<Vec<String>>>,
}

impl MemorySink {
    pub fn new() -> (Self, Arc<Mutex<Vec<String>>>) {
        let lines = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                lines: lines.clone(),
            },
            lines,
        )
    }
}

impl LogSink for MemorySink {
    fn write(&self, entry: &LogEntry) {
        let mut lines = self.lines.lock().unwrap_or_else(|e| e.into_inner());
        lines.push(format!(
            "{} {}: {}",
            entry.severity, entry.facility, entry.message
        ));
    }
}

struct Shared {
    min_severity: AtomicU8,
    dropped: AtomicU64,
}

/// Logger handle for writing log entries.
///
/// Lightweight and cloneable; every clone feeds the same consumer thread.
/// Producers never block: when the consumer falls behind, entries are
/// dropped and accounted in `dropped_entries`.
pub struct Logger {
    tx: SyncSender<LogEntry>,
    shared: Arc<Shared>,
}

impl Clone for Logger {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            shared: self.shared.clone(),
        }
    }
}

impl Logger {
    /// Start a consumer thread draining into `sink` and return the handle
    /// feeding it. The consumer exits once every `Logger` clone is gone.
    pub fn start(
        sink: Box<dyn LogSink>,
        min_severity: Severity,
    ) -> Result<(Self, thread::JoinHandle<()>)> {
        let (tx, rx): (SyncSender<LogEntry>, Receiver<LogEntry>) = sync_channel(CHANNEL_DEPTH);
        let handle = thread::Builder::new()
            .name("log-consumer".into())
            .spawn(move || {
                while let Ok(entry) = rx.recv() {
                    sink.write(&entry);
                }
            })
            .context("spawn log consumer thread")?;
        let logger = Self {
            tx,
            shared: Arc::new(Shared {
                min_severity: AtomicU8::new(min_severity.as_u8()),
                dropped: AtomicU64::new(0),
            }),
        };
        Ok((logger, handle))
    }

    /// A logger wired to stderr, for binaries and tests that do not care
    /// about the consumer handle.
    pub fn stderr(min_severity: Severity) -> Result<Self> {
        Ok(Self::start(Box::new(StderrSink), min_severity)?.0)
    }

    pub fn set_min_severity(&self, severity: Severity) {
        self.shared
            .min_severity
            .store(severity.as_u8(), Ordering::Relaxed);
    }

    #[inline]
    pub fn enabled(&self, severity: Severity) -> bool {
        severity.as_u8() <= self.shared.min_severity.load(Ordering::Relaxed)
    }

    /// Entries dropped because the consumer fell behind.
    pub fn dropped_entries(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    pub fn log(&self, severity: Severity, facility: Facility, message: &str) {
        if !self.enabled(severity) {
            return;
        }
        let entry = LogEntry {
            timestamp: SystemTime::now(),
            severity,
            facility,
            message: message.to_string(),
        };
        match self.tx.try_send(entry) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                self.shared.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    #[inline]
    pub fn error(&self, facility: Facility, message: &str) {
        self.log(Severity::Error, facility, message);
    }

    #[inline]
    pub fn warning(&self, facility: Facility, message: &str) {
        self.log(Severity::Warning, facility, message);
    }

    #[inline]
    pub fn notice(&self, facility: Facility, message: &str) {
        self.log(Severity::Notice, facility, message);
    }

    #[inline]
    pub fn info(&self, facility: Facility, message: &str) {
        self.log(Severity::Info, facility, message);
    }

    #[inline]
    pub fn debug(&self, facility: Facility, message: &str) {
        self.log(Severity::Debug, facility, message);
    }
}
