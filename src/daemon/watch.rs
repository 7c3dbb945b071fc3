//! `canary watch`: touch the canary on a fixed cadence so a starved canary is
//! pronounced dead (and its hook run) without waiting for someone to call in.
//!
//! The loop knows nothing about storage. Each poll is a caller-supplied probe
//! that performs one complete touch, typically lock, load, touch, save.

use std::thread;
use std::time::{Duration, Instant};

use crate::canary::facade::{CanaryStatus, Response};
use crate::core::errors::Result;
use crate::daemon::signals::{SignalHandler, WatchdogHeartbeat};

/// Longest uninterrupted sleep between signal checks.
const SLEEP_SLICE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct WatchOptions {
    pub poll_interval: Duration,
    /// Stop after this many polls. `None` runs until death or shutdown.
    pub max_polls: Option<u64>,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
            max_polls: None,
        }
    }
}

/// Why the loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchExit {
    /// The canary is dead. `by_watch` is true when one of our touches killed it.
    Died { by_watch: bool },
    Shutdown,
    PollLimit,
}

#[derive(Debug, Clone)]
pub struct WatchReport {
    pub exit: WatchExit,
    pub polls: u64,
    /// Status from the last successful poll.
    pub last_status: Option<CanaryStatus>,
}

/// Poll until the canary dies, a shutdown is requested, or the poll limit is hit.
///
/// A probe error ends the loop and is returned as-is; the caller decides
/// whether it is worth restarting.
pub fn run<P>(
    mut probe: P,
    options: &WatchOptions,
    signals: &SignalHandler,
    heartbeat: &mut WatchdogHeartbeat,
) -> Result<WatchReport>
where
    P: FnMut() -> Result<Response>,
{
    let mut polls = 0_u64;
    let mut last_status = None;

    loop {
        if signals.should_shutdown() {
            return Ok(WatchReport {
                exit: WatchExit::Shutdown,
                polls,
                last_status,
            });
        }

        let response = probe()?;
        polls += 1;
        let alive = response.alive;
        let died = response.died;
        last_status = Some(response.status);

        if !alive {
            return Ok(WatchReport {
                exit: WatchExit::Died { by_watch: died },
                polls,
                last_status,
            });
        }

        heartbeat.maybe_notify(&format!("alive after {polls} polls"));

        if options.max_polls.is_some_and(|max| polls >= max) {
            return Ok(WatchReport {
                exit: WatchExit::PollLimit,
                polls,
                last_status,
            });
        }

        sleep_interruptible(options.poll_interval, signals);
    }
}

/// Sleep for `total`, waking early on shutdown or a check request.
fn sleep_interruptible(total: Duration, signals: &SignalHandler) {
    let deadline = Instant::now() + total;
    loop {
        if signals.should_shutdown() || signals.should_check() {
            return;
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return;
        }
        thread::sleep(remaining.min(SLEEP_SLICE));
    }
}
