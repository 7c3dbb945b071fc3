//! Death notifications: the event sink contract plus desktop, file, journal,
//! and webhook channels.
//!
//! The canary guarantees each instance emits its death notice at most once;
//! sinks only deliver. Channels are fire-and-forget: a delivery failure never
//! propagates back into the canary call that caused the death.

#![allow(missing_docs)]

use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::canary::types::{Operation, Timestamp};

// ──────────────────── notification level ────────────────────

/// Severity level for notification filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationLevel {
    Info,
    Warning,
    Error,
    Critical,
}

impl fmt::Display for NotificationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Info => write!(f, "info"),
            Self::Warning => write!(f, "warning"),
            Self::Error => write!(f, "error"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

// ──────────────────── notification events ────────────────────

/// A structured notification event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NotificationEvent {
    /// The core death notice. Emitted once per canary, before anything a hook raises.
    CanaryDied {
        canary: String,
        death_timestamp: Timestamp,
        trigger: Operation,
    },
    /// A notice raised by a custom death hook.
    HookRaised {
        canary: String,
        hook: String,
        message: String,
    },
    /// A custom death hook failed after the death was committed.
    HookFailed {
        canary: String,
        hook: String,
        error: String,
    },
}

impl NotificationEvent {
    /// The severity level of this event (for min-level filtering).
    #[must_use]
    pub const fn level(&self) -> NotificationLevel {
        match self {
            Self::CanaryDied { .. } => NotificationLevel::Critical,
            Self::HookRaised { .. } => NotificationLevel::Warning,
            Self::HookFailed { .. } => NotificationLevel::Error,
        }
    }

    /// Name of the canary this event concerns.
    #[must_use]
    pub fn canary(&self) -> &str {
        match self {
            Self::CanaryDied { canary, .. }
            | Self::HookRaised { canary, .. }
            | Self::HookFailed { canary, .. } => canary,
        }
    }

    /// Short human-readable summary line.
    #[must_use]
    pub fn summary(&self) -> String {
        match self {
            Self::CanaryDied {
                canary,
                death_timestamp,
                trigger,
            } => {
                let when = chrono::DateTime::from_timestamp(
                    i64::try_from(*death_timestamp).unwrap_or(i64::MAX),
                    0,
                )
                .map_or_else(
                    || death_timestamp.to_string(),
                    |dt| dt.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
                );
                format!("RIP canary {canary}: pronounced dead at {when} (by {trigger})")
            }
            Self::HookRaised {
                canary,
                hook,
                message,
            } => format!("canary {canary} [{hook}]: {message}"),
            Self::HookFailed {
                canary,
                hook,
                error,
            } => format!("canary {canary} death hook {hook} failed: {error}"),
        }
    }
}

// ──────────────────── sink contract ────────────────────

/// Receives canary notifications.
///
/// Implementations must not call back into the canary that emitted the event:
/// emission happens while the canary holds its single-writer lock.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &NotificationEvent);
}

/// Records every event in memory. Useful for embedding and tests.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<NotificationEvent>>,
}

impl MemorySink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of everything emitted so far, in emission order.
    #[must_use]
    pub fn events(&self) -> Vec<NotificationEvent> {
        self.events.lock().clone()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    /// Number of core death notices received.
    #[must_use]
    pub fn deaths(&self) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| matches!(e, NotificationEvent::CanaryDied { .. }))
            .count()
    }
}

impl EventSink for MemorySink {
    fn emit(&self, event: &NotificationEvent) {
        self.events.lock().push(event.clone());
    }
}

/// Holds events back until [`HeldSink::release`] forwards them.
///
/// Whatever is still held when the sink is dropped is discarded, so a call
/// that fails before committing its state announces nothing.
#[derive(Debug, Default)]
pub struct HeldSink {
    events: Mutex<Vec<NotificationEvent>>,
}

impl HeldSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    /// Forward everything held to `target` in emission order. Returns the count.
    pub fn release(&self, target: &dyn EventSink) -> usize {
        let events = std::mem::take(&mut *self.events.lock());
        for event in &events {
            target.emit(event);
        }
        events.len()
    }
}

impl EventSink for HeldSink {
    fn emit(&self, event: &NotificationEvent) {
        self.events.lock().push(event.clone());
    }
}

/// Delivers each event to several sinks, in registration order.
#[derive(Default)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanoutSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl EventSink for FanoutSink {
    fn emit(&self, event: &NotificationEvent) {
        for sink in &self.sinks {
            sink.emit(event);
        }
    }
}

// ──────────────────── configuration ────────────────────

/// Top-level notification configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct NotificationConfig {
    /// Master switch for all notifications.
    pub enabled: bool,
    /// Which channel names to activate.
    pub channels: Vec<String>,
    pub desktop: DesktopConfig,
    pub webhook: WebhookConfig,
    pub file: FileConfig,
    pub journal: JournalConfig,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            channels: vec!["journal".to_string(), "file".to_string()],
            desktop: DesktopConfig::default(),
            webhook: WebhookConfig::default(),
            file: FileConfig::default(),
            journal: JournalConfig::default(),
        }
    }
}

/// Desktop notification settings (notify-send on Linux, osascript on macOS).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DesktopConfig {
    pub enabled: bool,
    pub min_level: NotificationLevel,
}

impl Default for DesktopConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            min_level: NotificationLevel::Warning,
        }
    }
}

/// Webhook notification settings (HTTP POST via curl).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WebhookConfig {
    pub enabled: bool,
    pub url: String,
    pub min_level: NotificationLevel,
    /// Template string with `${CANARY}`, `${LEVEL}`, `${SUMMARY}`, `${DEATH_TS}` placeholders.
    pub template: String,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: String::new(),
            min_level: NotificationLevel::Critical,
            template: r#"{"text": "canary: ${SUMMARY}"}"#.to_string(),
        }
    }
}

/// File notification settings (append-only JSONL).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct FileConfig {
    pub path: PathBuf,
}

impl Default for FileConfig {
    fn default() -> Self {
        let home = std::env::var_os("HOME").map_or_else(|| PathBuf::from("/tmp"), PathBuf::from);
        Self {
            path: home
                .join(".local")
                .join("share")
                .join("canary")
                .join("notifications.jsonl"),
        }
    }
}

/// Journal notification settings (systemd journal via stderr).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct JournalConfig {
    pub min_level: NotificationLevel,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            min_level: NotificationLevel::Warning,
        }
    }
}

// ──────────────────── JSONL record ────────────────────

/// A single notification record written to the JSONL file.
#[derive(Debug, Serialize)]
struct NotificationRecord {
    ts: String,
    level: NotificationLevel,
    summary: String,
    #[serde(flatten)]
    event: NotificationEvent,
}

// ──────────────────── notification channels ────────────────────

/// A notification channel that can dispatch events.
trait Channel: Send + Sync {
    fn name(&self) -> &'static str;
    fn send(&self, event: &NotificationEvent);
}

// ──── Desktop (notify-send / osascript) ────

struct DesktopChannel {
    min_level: NotificationLevel,
}

impl DesktopChannel {
    const fn new(config: &DesktopConfig) -> Self {
        Self {
            min_level: config.min_level,
        }
    }
}

impl Channel for DesktopChannel {
    fn name(&self) -> &'static str {
        "desktop"
    }

    fn send(&self, event: &NotificationEvent) {
        if event.level() < self.min_level {
            return;
        }

        let summary = event.summary();
        let urgency = match event.level() {
            NotificationLevel::Critical | NotificationLevel::Error => "critical",
            NotificationLevel::Warning => "normal",
            NotificationLevel::Info => "low",
        };

        #[cfg(target_os = "linux")]
        {
            let mut command = Command::new("notify-send");
            command
                .arg("--urgency")
                .arg(urgency)
                .arg("--app-name=canary")
                .arg("Canary")
                .arg(&summary);
            spawn_reaped(command);
        }

        #[cfg(target_os = "macos")]
        {
            let script = format!(
                "display notification \"{}\" with title \"canary\"",
                summary.replace('"', "\\\"")
            );
            let mut command = Command::new("osascript");
            command.arg("-e").arg(&script);
            spawn_reaped(command);
        }

        #[cfg(not(any(target_os = "linux", target_os = "macos")))]
        {
            let _ = (urgency, summary);
        }
    }
}

// ──── File (append-only JSONL) ────

struct FileChannel {
    path: PathBuf,
}

impl FileChannel {
    fn new(config: &FileConfig) -> Self {
        Self {
            path: config.path.clone(),
        }
    }
}

impl Channel for FileChannel {
    fn name(&self) -> &'static str {
        "file"
    }

    fn send(&self, event: &NotificationEvent) {
        let record = NotificationRecord {
            ts: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            level: event.level(),
            summary: event.summary(),
            event: event.clone(),
        };

        let Ok(json) = serde_json::to_string(&record) else {
            return;
        };

        if let Some(parent) = self.path.parent() {
            let _ = fs::create_dir_all(parent);
        }

        let file = {
            let mut opts = OpenOptions::new();
            opts.create(true).append(true);
            #[cfg(unix)]
            {
                use std::os::unix::fs::OpenOptionsExt as _;
                opts.mode(0o600);
            }
            opts.open(&self.path)
        };

        if let Ok(mut f) = file {
            let _ = writeln!(f, "{json}");
        }
    }
}

// ──── Journal (systemd structured stderr) ────

struct JournalChannel {
    min_level: NotificationLevel,
}

impl JournalChannel {
    const fn new(config: &JournalConfig) -> Self {
        Self {
            min_level: config.min_level,
        }
    }
}

impl Channel for JournalChannel {
    fn name(&self) -> &'static str {
        "journal"
    }

    fn send(&self, event: &NotificationEvent) {
        if event.level() < self.min_level {
            return;
        }

        let priority = match event.level() {
            NotificationLevel::Critical => "CRIT",
            NotificationLevel::Error => "ERR",
            NotificationLevel::Warning => "WARNING",
            NotificationLevel::Info => "INFO",
        };

        eprintln!("[CNY-NOTIFY] [{priority}] {}", event.summary());
    }
}

// ──── Webhook (HTTP POST via curl) ────

struct WebhookChannel {
    url: String,
    min_level: NotificationLevel,
    template: String,
}

impl WebhookChannel {
    fn new(config: &WebhookConfig) -> Self {
        Self {
            url: config.url.clone(),
            min_level: config.min_level,
            template: config.template.clone(),
        }
    }

    fn render_body(&self, event: &NotificationEvent) -> String {
        let summary = event.summary();
        let level = event.level().to_string();
        let death_ts = match event {
            NotificationEvent::CanaryDied {
                death_timestamp, ..
            } => death_timestamp.to_string(),
            _ => "N/A".to_string(),
        };

        // JSON-escape values to prevent injection in webhook payloads.
        let esc = |s: &str| {
            s.replace('\\', "\\\\")
                .replace('"', "\\\"")
                .replace('\n', "\\n")
        };

        self.template
            .replace("${SUMMARY}", &esc(&summary))
            .replace("${LEVEL}", &esc(&level))
            .replace("${CANARY}", &esc(event.canary()))
            .replace("${DEATH_TS}", &esc(&death_ts))
    }
}

impl Channel for WebhookChannel {
    fn name(&self) -> &'static str {
        "webhook"
    }

    fn send(&self, event: &NotificationEvent) {
        if event.level() < self.min_level || self.url.is_empty() {
            return;
        }

        let body = self.render_body(event);

        let mut command = Command::new("curl");
        command
            .arg("--silent")
            .arg("--max-time")
            .arg("5")
            .arg("--header")
            .arg("Content-Type: application/json")
            .arg("--data")
            .arg(&body)
            .arg(&self.url);
        spawn_reaped(command);
    }
}

/// Start a delivery helper without blocking the caller, and wait for it on a
/// background thread so `canary watch` does not accumulate zombies.
fn spawn_reaped(mut command: Command) -> Option<JoinHandle<Option<ExitStatus>>> {
    let mut child = command
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .ok()?;
    thread::Builder::new()
        .name("canary-notify-reap".to_string())
        .spawn(move || child.wait().ok())
        .ok()
}

// ──────────────────── notification manager ────────────────────

/// Fans each event out to every enabled channel.
pub struct NotificationManager {
    channels: Vec<Box<dyn Channel>>,
    enabled: bool,
    dispatched: AtomicU64,
}

impl NotificationManager {
    /// Build a manager from configuration.
    #[must_use]
    pub fn from_config(config: &NotificationConfig) -> Self {
        if !config.enabled {
            return Self::disabled();
        }

        let mut channels: Vec<Box<dyn Channel>> = Vec::new();

        for channel_name in &config.channels {
            match channel_name.as_str() {
                "desktop" if config.desktop.enabled => {
                    channels.push(Box::new(DesktopChannel::new(&config.desktop)));
                }
                "file" => {
                    channels.push(Box::new(FileChannel::new(&config.file)));
                }
                "journal" => {
                    channels.push(Box::new(JournalChannel::new(&config.journal)));
                }
                "webhook" if config.webhook.enabled => {
                    channels.push(Box::new(WebhookChannel::new(&config.webhook)));
                }
                _ => {
                    // Unknown or disabled channel name: skip.
                }
            }
        }

        Self {
            channels,
            enabled: true,
            dispatched: AtomicU64::new(0),
        }
    }

    /// Create a disabled (no-op) manager.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            channels: Vec::new(),
            enabled: false,
            dispatched: AtomicU64::new(0),
        }
    }

    /// Dispatch a notification event to all enabled channels.
    pub fn notify(&self, event: &NotificationEvent) {
        if !self.enabled {
            return;
        }

        self.dispatched.fetch_add(1, Ordering::Relaxed);

        for channel in &self.channels {
            channel.send(event);
        }
    }

    /// Number of active channels.
    #[must_use]
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Whether the manager is enabled.
    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Events dispatched since construction.
    #[must_use]
    pub fn dispatched(&self) -> u64 {
        self.dispatched.load(Ordering::Relaxed)
    }

    /// List the names of active channels.
    #[must_use]
    pub fn channel_names(&self) -> Vec<&str> {
        self.channels.iter().map(|c| c.name()).collect()
    }
}

impl EventSink for NotificationManager {
    fn emit(&self, event: &NotificationEvent) {
        self.notify(event);
    }
}

// ──────────────────── tests ────────────────────
