//! Activity log: one JSON object per line, appended for every canary call.
//!
//! Lines are assembled in memory and written with a single `write_all`, so a
//! reader tailing the file never sees half a record. When the configured path
//! cannot be written the writer degrades instead of failing the call:
//! primary file, then fallback file, then stderr with a `[CNY-JSONL]` prefix,
//! then silent discard.

#![allow(missing_docs)]

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::canary::facade::Response;
use crate::canary::types::{Operation, Timestamp};
use crate::core::config::{LoggingConfig, PathsConfig};
use crate::core::errors::{CanaryError, Result};
use crate::daemon::notifications::{EventSink, NotificationEvent};

/// Severity level for log events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

/// What a log line records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Init,
    Feed,
    Poison,
    Touch,
    Query,
    Death,
    HookNotice,
    HookFailure,
    WatchStart,
    WatchStop,
    Error,
}

impl From<Operation> for EventType {
    fn from(op: Operation) -> Self {
        match op {
            Operation::Feed => Self::Feed,
            Operation::Poison => Self::Poison,
            Operation::Touch => Self::Touch,
            Operation::Query => Self::Query,
        }
    }
}

/// A single log line. Only `ts`, `event`, `severity` are always present.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    /// RFC 3339 UTC timestamp of the write.
    pub ts: String,
    pub event: EventType,
    pub severity: Severity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub canary: Option<String>,
    /// Identity the call was made as.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub caller: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ok: Option<bool>,
    /// Liveness after the call.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alive: Option<bool>,
    /// Whether this call committed the death.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub died: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_last_fed: Option<Timestamp>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub death_timestamp: Option<Timestamp>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trigger: Option<Operation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl LogEntry {
    /// Create a new entry stamped with the current UTC time.
    pub fn new(event: EventType, severity: Severity) -> Self {
        Self {
            ts: format_utc_now(),
            event,
            severity,
            canary: None,
            caller: None,
            ok: None,
            alive: None,
            died: None,
            time_last_fed: None,
            death_timestamp: None,
            trigger: None,
            error_code: None,
            error_message: None,
            details: None,
        }
    }

    /// Record the outcome of one facade call.
    pub fn from_response(canary: &str, response: &Response) -> Self {
        let severity = if response.died {
            Severity::Critical
        } else if response.ok {
            Severity::Info
        } else {
            Severity::Warning
        };
        let mut entry = Self::new(response.operation.into(), severity);
        entry.canary = Some(canary.to_string());
        entry.caller = Some(response.caller.clone());
        entry.ok = Some(response.ok);
        entry.alive = Some(response.alive);
        entry.died = Some(response.died);
        entry.time_last_fed = Some(response.status.time_last_fed);
        if let Some(death) = response.status.death {
            entry.death_timestamp = Some(death.timestamp);
            entry.trigger = Some(death.trigger);
        }
        entry.error_code = response.error_code.map(str::to_string);
        entry.error_message.clone_from(&response.reason);
        entry
    }

    /// Record a notification raised while a call was in flight.
    pub fn from_event(event: &NotificationEvent) -> Self {
        match event {
            NotificationEvent::CanaryDied {
                canary,
                death_timestamp,
                trigger,
            } => {
                let mut entry = Self::new(EventType::Death, Severity::Critical);
                entry.canary = Some(canary.clone());
                entry.death_timestamp = Some(*death_timestamp);
                entry.trigger = Some(*trigger);
                entry.details = Some(event.summary());
                entry
            }
            NotificationEvent::HookRaised {
                canary,
                hook,
                message,
            } => {
                let mut entry = Self::new(EventType::HookNotice, Severity::Info);
                entry.canary = Some(canary.clone());
                entry.details = Some(format!("{hook}: {message}"));
                entry
            }
            NotificationEvent::HookFailed {
                canary,
                hook,
                error,
            } => {
                let mut entry = Self::new(EventType::HookFailure, Severity::Warning);
                entry.canary = Some(canary.clone());
                entry.error_code = Some("CNY-2101".to_string());
                entry.error_message = Some(error.clone());
                entry.details = Some(format!("hook {hook}"));
                entry
            }
        }
    }

    /// Record a failure that happened outside the canary itself.
    pub fn from_error(canary: Option<&str>, err: &CanaryError) -> Self {
        let mut entry = Self::new(EventType::Error, Severity::Warning);
        entry.canary = canary.map(str::to_string);
        entry.ok = Some(false);
        entry.error_code = Some(err.code().to_string());
        entry.error_message = Some(err.to_string());
        entry
    }
}

/// Degradation state of the JSONL writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriterState {
    Normal,
    Fallback,
    Stderr,
    Discard,
}

/// Configuration for the JSONL writer.
#[derive(Debug, Clone)]
pub struct JsonlConfig {
    pub path: PathBuf,
    /// Optional second file, ideally on another filesystem.
    pub fallback_path: Option<PathBuf>,
    /// Rotate once the current file would exceed this many bytes.
    pub max_size_bytes: u64,
    pub max_rotated_files: u32,
    /// Seconds between forced fsyncs. Zero syncs after every line.
    pub fsync_interval_secs: u64,
}

impl JsonlConfig {
    /// Writer settings for the configured activity log.
    #[must_use]
    pub fn from_config(logging: &LoggingConfig, paths: &PathsConfig) -> Self {
        Self {
            path: paths.activity_log.clone(),
            fallback_path: Some(std::env::temp_dir().join("canary-activity.jsonl")),
            max_size_bytes: logging.max_size_bytes,
            max_rotated_files: logging.max_rotated_files,
            fsync_interval_secs: logging.fsync_interval_secs,
        }
    }
}

impl Default for JsonlConfig {
    fn default() -> Self {
        Self::from_config(&LoggingConfig::default(), &PathsConfig::default())
    }
}

/// Append-only JSONL writer with rotation and a fallback chain.
pub struct JsonlWriter {
    config: JsonlConfig,
    writer: Option<BufWriter<File>>,
    state: WriterState,
    bytes_written: u64,
    last_fsync: SystemTime,
}

impl JsonlWriter {
    /// Open the log. Never fails; falls through the degradation chain instead.
    pub fn open(config: JsonlConfig) -> Self {
        let mut w = Self {
            config,
            writer: None,
            state: WriterState::Discard,
            bytes_written: 0,
            last_fsync: SystemTime::now(),
        };
        w.open_primary();
        w
    }

    /// A writer that drops everything, for runs with logging disabled.
    pub fn discard() -> Self {
        Self {
            config: JsonlConfig {
                path: PathBuf::new(),
                fallback_path: None,
                max_size_bytes: u64::MAX,
                max_rotated_files: 0,
                fsync_interval_secs: u64::MAX,
            },
            writer: None,
            state: WriterState::Discard,
            bytes_written: 0,
            last_fsync: SystemTime::now(),
        }
    }

    pub fn write_entry(&mut self, entry: &LogEntry) {
        let line = match serde_json::to_string(entry) {
            Ok(json) => format!("{json}\n"),
            Err(e) => {
                let _ = writeln!(io::stderr(), "[CNY-JSONL] serialize error: {e}");
                return;
            }
        };
        self.write_line(&line);
    }

    pub fn flush(&mut self) {
        if let Some(w) = self.writer.as_mut() {
            let _ = w.flush();
        }
    }

    pub fn fsync(&mut self) {
        if let Some(w) = self.writer.as_mut() {
            let _ = w.flush();
            let _ = w.get_ref().sync_data();
            self.last_fsync = SystemTime::now();
        }
    }

    /// Current degradation state.
    pub fn state(&self) -> &'static str {
        match self.state {
            WriterState::Normal => "normal",
            WriterState::Fallback => "fallback",
            WriterState::Stderr => "stderr",
            WriterState::Discard => "discard",
        }
    }

    /// Reopen the primary path after a degradation, if it has come back.
    pub fn try_recover(&mut self) {
        if matches!(self.state, WriterState::Normal) || self.config.path.as_os_str().is_empty() {
            return;
        }
        if let Ok((file, size)) = open_append(&self.config.path) {
            self.writer = Some(BufWriter::new(file));
            self.state = WriterState::Normal;
            self.bytes_written = size;
            let _ = writeln!(
                io::stderr(),
                "[CNY-JSONL] recovered to primary path: {}",
                self.config.path.display()
            );
        }
    }

    fn write_line(&mut self, line: &str) {
        let len = line.len() as u64;
        if self.bytes_written.saturating_add(len) > self.config.max_size_bytes
            && matches!(self.state, WriterState::Normal | WriterState::Fallback)
        {
            self.rotate();
        }

        match self.state {
            WriterState::Normal | WriterState::Fallback => {
                let written = self
                    .writer
                    .as_mut()
                    .is_some_and(|w| w.write_all(line.as_bytes()).is_ok());
                if written {
                    self.bytes_written += len;
                    self.maybe_fsync();
                } else {
                    self.degrade();
                    self.write_line(line);
                }
            }
            WriterState::Stderr => {
                let _ = write!(io::stderr(), "[CNY-JSONL] {line}");
            }
            WriterState::Discard => {}
        }
    }

    fn maybe_fsync(&mut self) {
        let elapsed = SystemTime::now()
            .duration_since(self.last_fsync)
            .unwrap_or(Duration::ZERO);
        if elapsed.as_secs() >= self.config.fsync_interval_secs {
            self.fsync();
        }
    }

    fn open_primary(&mut self) {
        if self.config.path.as_os_str().is_empty() {
            return;
        }
        match open_append(&self.config.path) {
            Ok((file, size)) => self.attach(file, size, WriterState::Normal),
            Err(_) => self.open_fallback(),
        }
    }

    fn open_fallback(&mut self) {
        let opened = self
            .config
            .fallback_path
            .clone()
            .map(|fb| (open_append(&fb), fb));
        match opened {
            Some((Ok((file, size)), fb)) => {
                let _ = writeln!(
                    io::stderr(),
                    "[CNY-JSONL] primary path failed, using fallback: {}",
                    fb.display()
                );
                self.attach(file, size, WriterState::Fallback);
            }
            Some((Err(_), _)) | None => {
                self.state = WriterState::Stderr;
                let _ = writeln!(
                    io::stderr(),
                    "[CNY-JSONL] activity log unwritable, using stderr"
                );
            }
        }
    }

    fn attach(&mut self, file: File, size: u64, state: WriterState) {
        self.writer = Some(BufWriter::new(file));
        self.state = state;
        self.bytes_written = size;
    }

    fn degrade(&mut self) {
        self.writer = None;
        match self.state {
            WriterState::Normal => self.open_fallback(),
            WriterState::Fallback => {
                self.state = WriterState::Stderr;
                let _ = writeln!(io::stderr(), "[CNY-JSONL] fallback write failed, using stderr");
            }
            WriterState::Stderr | WriterState::Discard => self.state = WriterState::Discard,
        }
    }

    fn rotate(&mut self) {
        self.flush();
        self.writer = None;

        let base = match self.state {
            WriterState::Normal => self.config.path.clone(),
            WriterState::Fallback => match &self.config.fallback_path {
                Some(p) => p.clone(),
                None => return,
            },
            _ => return,
        };

        // activity.jsonl.N is dropped, .N-1 → .N, …, current → .1
        let keep = self.config.max_rotated_files;
        let _ = fs::remove_file(rotated_name(&base, keep));
        for i in (1..keep).rev() {
            let _ = fs::rename(rotated_name(&base, i), rotated_name(&base, i + 1));
        }
        if keep == 0 {
            let _ = fs::remove_file(&base);
        } else {
            let _ = fs::rename(&base, rotated_name(&base, 1));
        }

        match open_append(&base) {
            Ok((file, _)) => {
                self.writer = Some(BufWriter::new(file));
                self.bytes_written = 0;
            }
            Err(_) => self.degrade(),
        }
    }
}

impl Drop for JsonlWriter {
    fn drop(&mut self) {
        self.flush();
    }
}

/// Shared activity log that doubles as an [`EventSink`], so deaths and hook
/// outcomes land in the same file as the calls that caused them.
pub struct ActivityLog {
    writer: Mutex<JsonlWriter>,
}

impl ActivityLog {
    pub fn new(writer: JsonlWriter) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    pub fn record(&self, entry: &LogEntry) {
        self.writer.lock().write_entry(entry);
    }

    pub fn record_response(&self, canary: &str, response: &Response) {
        self.record(&LogEntry::from_response(canary, response));
    }

    pub fn flush(&self) {
        self.writer.lock().flush();
    }

    pub fn state(&self) -> &'static str {
        self.writer.lock().state()
    }

    /// Move back to the primary log file if it is writable again.
    pub fn try_recover(&self) {
        self.writer.lock().try_recover();
    }
}

impl EventSink for ActivityLog {
    fn emit(&self, event: &NotificationEvent) {
        self.record(&LogEntry::from_event(event));
    }
}

fn open_append(path: &Path) -> Result<(File, u64)> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| CanaryError::io(parent, source))?;
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|source| CanaryError::io(path, source))?;
    let size = file.metadata().map(|m| m.len()).unwrap_or(0);
    Ok((file, size))
}

/// `activity.jsonl` → `activity.jsonl.3`.
fn rotated_name(base: &Path, index: u32) -> PathBuf {
    let mut name = base.as_os_str().to_owned();
    name.push(format!(".{index}"));
    PathBuf::from(name)
}

fn format_utc_now() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}
