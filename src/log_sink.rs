//! Append-only record of everything shown to the user
//!
//! Entries are never changed once appended. [LogSink::snapshot] returns an
//! immutable view which stays consistent while new entries keep arriving, so
//! it can be exported from any thread.

use std::{
    fs::File,
    io::{BufWriter, Write},
    path::Path,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, RwLock,
    },
};

use chrono::{DateTime, Local};
use strum::Display;

use crate::error::Error;

/// Where a log line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum LogSource {
    System,
    Device,
    User,
}

/// A single line of the log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    /// Position in the log, strictly increasing
    pub seq: u64,
    pub timestamp: Option<DateTime<Local>>,
    pub source: LogSource,
    pub text: String,
}

impl LogEntry {
    /// Text as displayed, with the `[HH:MM:SS.mmm]` prefix when timestamped
    pub fn render(&self) -> String {
        match &self.timestamp {
            Some(ts) => format!("[{}] {}", ts.format("%H:%M:%S%.3f"), self.text),
            None => self.text.clone(),
        }
    }
}

#[derive(Default)]
struct Entries {
    next_seq: u64,
    lines: Vec<Arc<LogEntry>>,
}

#[derive(Default)]
struct Inner {
    entries: RwLock<Entries>,
    timestamps: AtomicBool,
}

/// Shared, ordered log of system, device and user lines
#[derive(Clone, Default)]
pub struct LogSink {
    inner: Arc<Inner>,
}

impl LogSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Prefix entries appended from now on with a timestamp.
    pub fn set_timestamps(&self, enabled: bool) {
        self.inner.timestamps.store(enabled, Ordering::Relaxed);
    }

    /// Append a line, returning its sequence number.
    pub fn append(&self, source: LogSource, text: impl Into<String>) -> u64 {
        let timestamp = self
            .inner
            .timestamps
            .load(Ordering::Relaxed)
            .then(Local::now);

        let mut entries = self
            .inner
            .entries
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let seq = entries.next_seq;
        entries.next_seq += 1;
        entries.lines.push(Arc::new(LogEntry {
            seq,
            timestamp,
            source,
            text: text.into(),
        }));

        seq
    }

    pub fn system(&self, text: impl Into<String>) -> u64 {
        self.append(LogSource::System, text)
    }

    pub fn device(&self, text: impl Into<String>) -> u64 {
        self.append(LogSource::Device, text)
    }

    pub fn user(&self, text: impl Into<String>) -> u64 {
        self.append(LogSource::User, text)
    }

    /// Immutable view of the log as it is right now
    pub fn snapshot(&self) -> LogSnapshot {
        let entries = self
            .inner
            .entries
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        LogSnapshot(entries.lines.clone())
    }

    /// Entries with a sequence number of at least `seq`
    pub fn since(&self, seq: u64) -> Vec<Arc<LogEntry>> {
        let entries = self
            .inner
            .entries
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let start = entries.lines.partition_point(|entry| entry.seq < seq);

        entries.lines[start..].to_vec()
    }

    /// Sequence number the next appended entry will get
    pub fn next_seq(&self) -> u64 {
        self.inner
            .entries
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .next_seq
    }

    /// Drop all entries from later snapshots. Snapshots already taken keep
    /// them, and sequence numbers keep counting.
    pub fn clear(&self) {
        self.inner
            .entries
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .lines
            .clear();
    }

    /// Write the log as of this call to `path`.
    pub fn export(&self, path: &Path) -> Result<usize, Error> {
        self.snapshot().export(path)
    }
}

/// An immutable, ordered view of the log
#[derive(Debug, Clone, Default)]
pub struct LogSnapshot(Vec<Arc<LogEntry>>);

impl LogSnapshot {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &LogEntry> {
        self.0.iter().map(|entry| entry.as_ref())
    }

    /// Write every entry of this snapshot to `path`, one per line. Returns the
    /// number of entries written.
    pub fn export(&self, path: &Path) -> Result<usize, Error> {
        if self.0.iter().all(|entry| entry.text.trim().is_empty()) {
            return Err(Error::NothingToExport);
        }

        let mut out = BufWriter::new(File::create(path)?);
        for entry in self.iter() {
            writeln!(out, "{}", entry.render())?;
        }
        out.flush()?;

        Ok(self.0.len())
    }
}

/// File name suggested for an export made now, `log_YYYYmmdd_HHMMSS.log`
pub fn default_export_name() -> String {
    format!("log_{}.log", Local::now().format("%Y%m%d_%H%M%S"))
}
