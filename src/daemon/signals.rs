//! Signal handling for `canary watch`: SIGTERM/SIGINT stop the loop, SIGUSR1
//! forces an immediate check, and a systemd watchdog heartbeat keeps the unit
//! alive while the loop runs.
//!
//! Signals only flip flags; the watch loop polls them between sleeps.

#![allow(missing_docs)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use signal_hook::consts::{SIGINT, SIGTERM};

/// Flags shared between the OS signal hooks and the watch loop.
#[derive(Clone, Debug, Default)]
pub struct SignalHandler {
    shutdown_flag: Arc<AtomicBool>,
    check_flag: Arc<AtomicBool>,
}

impl SignalHandler {
    /// Create a handler and register OS signal hooks. Registration failures
    /// are reported on stderr and otherwise ignored.
    pub fn new() -> Self {
        let handler = Self::unregistered();
        handler.register_signals();
        handler
    }

    /// A handler that only responds to programmatic requests.
    pub fn unregistered() -> Self {
        Self {
            shutdown_flag: Arc::new(AtomicBool::new(false)),
            check_flag: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn should_shutdown(&self) -> bool {
        self.shutdown_flag.load(Ordering::Relaxed)
    }

    /// Check (and clear) whether an immediate check was requested.
    pub fn should_check(&self) -> bool {
        self.check_flag.swap(false, Ordering::Relaxed)
    }

    pub fn request_shutdown(&self) {
        self.shutdown_flag.store(true, Ordering::Relaxed);
    }

    pub fn request_check(&self) {
        self.check_flag.store(true, Ordering::Relaxed);
    }

    fn register_signals(&self) {
        for (name, signal) in [("SIGTERM", SIGTERM), ("SIGINT", SIGINT)] {
            if let Err(e) = signal_hook::flag::register(signal, Arc::clone(&self.shutdown_flag)) {
                eprintln!("[CNY-SIGNAL] failed to register {name}: {e}");
            }
        }

        #[cfg(unix)]
        {
            use signal_hook::consts::SIGUSR1;
            if let Err(e) = signal_hook::flag::register(SIGUSR1, Arc::clone(&self.check_flag)) {
                eprintln!("[CNY-SIGNAL] failed to register SIGUSR1: {e}");
            }
        }
    }
}

/// Systemd watchdog heartbeat.
///
/// Sends `WATCHDOG=1` over `NOTIFY_SOCKET` at half the unit's `WatchdogSec`.
#[derive(Debug)]
pub struct WatchdogHeartbeat {
    interval: Duration,
    last_beat: Instant,
    enabled: bool,
}

impl WatchdogHeartbeat {
    /// Heartbeat for a unit with the given `WatchdogSec`. Zero disables it.
    pub fn new(watchdog_sec: u64) -> Self {
        Self {
            interval: Duration::from_secs(watchdog_sec / 2),
            last_beat: Instant::now(),
            enabled: watchdog_sec > 0,
        }
    }

    /// Heartbeat configured from `WATCHDOG_USEC`, as systemd exports it.
    pub fn from_env() -> Self {
        let secs = std::env::var("WATCHDOG_USEC")
            .ok()
            .and_then(|raw| raw.trim().parse::<u64>().ok())
            .map_or(0, |usec| usec / 1_000_000);
        Self::new(secs)
    }

    pub fn disabled() -> Self {
        Self::new(0)
    }

    /// Send a heartbeat if the interval has elapsed. Returns whether one was sent.
    pub fn maybe_notify(&mut self, status: &str) -> bool {
        if !self.enabled || self.last_beat.elapsed() < self.interval {
            return false;
        }
        self.last_beat = Instant::now();
        sd_notify_watchdog(status);
        true
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }
}

fn sd_notify_watchdog(status: &str) {
    #[cfg(target_os = "linux")]
    {
        use std::os::unix::net::UnixDatagram;

        let Some(socket_path) = std::env::var_os("NOTIFY_SOCKET").filter(|p| !p.is_empty()) else {
            return;
        };
        if let Ok(sock) = UnixDatagram::unbound() {
            let msg = format!("WATCHDOG=1\nSTATUS={status}\n");
            let _ = sock.send_to(msg.as_bytes(), socket_path);
        }
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = status;
    }
}
