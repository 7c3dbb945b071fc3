//! The canary as callers see it: feed, poison, touch, query.
//!
//! [`Canary`] wires the access guard, the state machine, the death hook, the
//! clock, and the event sink together. All mutable state sits behind one lock,
//! and the clock is read while that lock is held, so calls against one canary
//! are totally ordered and never interleave their effects.

use std::collections::BTreeSet;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::canary::access::AccessGuard;
use crate::canary::hook::{DeathContext, DeathHook};
use crate::canary::state::{CanaryState, FeedOutcome, TouchOutcome};
use crate::canary::types::{CanaryType, Death, Operation, Role, Timestamp};
use crate::core::clock::Clock;
use crate::core::errors::{CanaryError, Result};
use crate::daemon::notifications::{EventSink, NotificationEvent};

/// Immutable construction parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanarySpec {
    pub name: String,
    pub canary_type: CanaryType,
    pub feeding_interval: u64,
    pub feeders: BTreeSet<String>,
}

/// Everything about a canary that changes after construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanarySnapshot {
    pub time_last_fed: Timestamp,
    pub death: Option<Death>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hook_state: Option<Value>,
}

/// Point-in-time view returned by [`Canary::query`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CanaryStatus {
    pub name: String,
    pub canary_type: CanaryType,
    pub feeding_interval: u64,
    pub time_last_fed: Timestamp,
    pub alive: bool,
    /// Zero while alive.
    pub death_timestamp: Timestamp,
    pub death: Option<Death>,
    /// Last instant at which a feed still succeeds. `None` once dead.
    pub feed_deadline: Option<Timestamp>,
    pub hook: String,
}

/// Boundary response: the outcome of one dispatched operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Response {
    pub operation: Operation,
    pub caller: String,
    pub ok: bool,
    /// For touch: whether the canary was found alive. Otherwise cached liveness after the call.
    pub alive: bool,
    /// Whether this call pronounced the canary dead.
    pub died: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<&'static str>,
    pub status: CanaryStatus,
}

impl Response {
    /// Fold a hook failure reported after the call into this response.
    ///
    /// A response that already failed (a starving feed) keeps its own reason.
    pub fn record_hook_failure(&mut self, err: &CanaryError) {
        if self.ok {
            self.ok = false;
            self.reason = Some(err.to_string());
            self.error_code = Some(err.code());
        }
    }
}

struct Cell {
    state: CanaryState,
    hook: DeathHook,
    /// Death whose hook has been held back by [`Canary::with_deferred_hook`].
    deferred: Option<Death>,
}

/// A canary instance.
pub struct Canary {
    name: String,
    guard: AccessGuard,
    feeding_interval: u64,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn EventSink>,
    defer_hook: bool,
    cell: Mutex<Cell>,
}

impl Canary {
    /// Hatch a new canary, last fed at the clock's current time.
    pub fn new(
        spec: &CanarySpec,
        hook: DeathHook,
        clock: Arc<dyn Clock>,
        sink: Arc<dyn EventSink>,
    ) -> Result<Self> {
        let guard = AccessGuard::new(spec.canary_type, spec.feeders.iter().cloned())?;
        let state = CanaryState::new(spec.feeding_interval, clock.now())?;
        Ok(Self::assemble(spec, guard, state, hook, clock, sink))
    }

    /// Rebuild a canary from a persisted snapshot.
    pub fn restore(
        spec: &CanarySpec,
        snapshot: CanarySnapshot,
        mut hook: DeathHook,
        clock: Arc<dyn Clock>,
        sink: Arc<dyn EventSink>,
    ) -> Result<Self> {
        let guard = AccessGuard::new(spec.canary_type, spec.feeders.iter().cloned())?;
        let state =
            CanaryState::from_parts(spec.feeding_interval, snapshot.time_last_fed, snapshot.death)?;
        if let Some(hook_state) = snapshot.hook_state {
            hook.restore_state(hook_state)?;
        }
        Ok(Self::assemble(spec, guard, state, hook, clock, sink))
    }

    fn assemble(
        spec: &CanarySpec,
        guard: AccessGuard,
        state: CanaryState,
        hook: DeathHook,
        clock: Arc<dyn Clock>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            name: spec.name.clone(),
            guard,
            feeding_interval: spec.feeding_interval,
            clock,
            sink,
            defer_hook: false,
            cell: Mutex::new(Cell {
                state,
                hook,
                deferred: None,
            }),
        }
    }

    /// Hold the death hook back until [`Canary::run_deferred_hook`] is called.
    ///
    /// The core death notice is still emitted by the call that commits the
    /// death. Callers that persist state use this to run the hook only once the
    /// death is durable.
    #[must_use]
    pub fn with_deferred_hook(mut self) -> Self {
        self.defer_hook = true;
        self
    }

    /// Run a hook held back by [`Canary::with_deferred_hook`].
    ///
    /// `None` if no death is waiting on its hook. Otherwise the hook runs once
    /// and its outcome is returned with the same policy as an immediate hook.
    pub fn run_deferred_hook(&self) -> Option<Result<()>> {
        let mut cell = self.cell.lock();
        let death = cell.deferred.take()?;
        Some(self.run_hook(&mut cell, death))
    }

    // ──────────────────── mutating operations ────────────────────

    /// Renew the canary. Feeders only.
    ///
    /// Returns the new `time_last_fed`. If the interval had already lapsed the
    /// canary dies here and the call fails with [`CanaryError::Starved`].
    pub fn feed(&self, caller: &str) -> Result<Timestamp> {
        self.guard.authorize(caller, Role::Feeder)?;

        let mut cell = self.cell.lock();
        let now = self.clock.now();
        match cell.state.feed(now)? {
            FeedOutcome::Fed { time_last_fed } => Ok(time_last_fed),
            FeedOutcome::Starved(death) => {
                let time_last_fed = cell.state.time_last_fed();
                // Starvation wins over a hook failure; the failure is still notified.
                if let Err(err) = self.pronounce(&mut cell, death) {
                    debug_assert!(err.committed_death(), "{err}");
                }
                Err(CanaryError::Starved {
                    time_last_fed,
                    death_timestamp: death.timestamp,
                })
            }
        }
    }

    /// Kill the canary immediately. Feeders only.
    pub fn poison(&self, caller: &str) -> Result<Death> {
        self.guard.authorize(caller, Role::Feeder)?;

        let mut cell = self.cell.lock();
        let now = self.clock.now();
        let death = cell.state.poison(now)?;
        self.pronounce(&mut cell, death)?;
        Ok(death)
    }

    /// Check whether the canary is alive, pronouncing it dead if its interval
    /// lapsed. Open to any caller; never renews.
    pub fn touch(&self, caller: &str) -> Result<bool> {
        self.touch_outcome(caller).map(TouchOutcome::is_alive)
    }

    fn touch_outcome(&self, _caller: &str) -> Result<TouchOutcome> {
        let mut cell = self.cell.lock();
        let now = self.clock.now();
        let outcome = cell.state.touch(now)?;
        if let TouchOutcome::Died(death) = outcome {
            self.pronounce(&mut cell, death)?;
        }
        Ok(outcome)
    }

    /// Emit the death notice, then run the hook unless it is deferred.
    fn pronounce(&self, cell: &mut Cell, death: Death) -> Result<()> {
        self.sink.emit(&NotificationEvent::CanaryDied {
            canary: self.name.clone(),
            death_timestamp: death.timestamp,
            trigger: death.trigger,
        });

        if self.defer_hook {
            cell.deferred = Some(death);
            return Ok(());
        }
        self.run_hook(cell, death)
    }

    /// Run the hook and emit what it raised.
    fn run_hook(&self, cell: &mut Cell, death: Death) -> Result<()> {
        let report = cell.hook.invoke(&DeathContext {
            canary: &self.name,
            death,
        });
        let hook = cell.hook.name().to_string();

        for message in report.notices {
            self.sink.emit(&NotificationEvent::HookRaised {
                canary: self.name.clone(),
                hook: hook.clone(),
                message,
            });
        }

        match report.failure {
            None => Ok(()),
            Some(details) => {
                self.sink.emit(&NotificationEvent::HookFailed {
                    canary: self.name.clone(),
                    hook: hook.clone(),
                    error: details.clone(),
                });
                Err(CanaryError::HookFailed { hook, details })
            }
        }
    }

    // ──────────────────── boundary dispatch ────────────────────

    /// Run `op` on behalf of `caller` and translate the result into a [`Response`].
    pub fn dispatch(&self, op: Operation, caller: &str) -> Response {
        let (result, died) = match op {
            Operation::Feed => match self.feed(caller) {
                Ok(_) => (Ok(true), false),
                Err(err) => {
                    let died = err.committed_death();
                    (Err(err), died)
                }
            },
            Operation::Poison => match self.poison(caller) {
                Ok(_) => (Ok(false), true),
                Err(err) => {
                    let died = err.committed_death();
                    (Err(err), died)
                }
            },
            Operation::Touch => match self.touch_outcome(caller) {
                Ok(outcome) => (
                    Ok(outcome.is_alive()),
                    matches!(outcome, TouchOutcome::Died(_)),
                ),
                Err(err) => {
                    let died = err.committed_death();
                    (Err(err), died)
                }
            },
            Operation::Query => (Ok(self.is_alive()), false),
        };

        let status = self.query();
        match result {
            Ok(alive) => Response {
                operation: op,
                caller: caller.to_string(),
                ok: true,
                alive,
                died,
                reason: None,
                error_code: None,
                status,
            },
            Err(err) => Response {
                operation: op,
                caller: caller.to_string(),
                ok: false,
                alive: status.alive,
                died,
                reason: Some(
                    err.reason()
                        .map_or_else(|| err.to_string(), str::to_string),
                ),
                error_code: Some(err.code()),
                status,
            },
        }
    }

    // ──────────────────── reads ────────────────────

    /// Consistent snapshot of every observable field.
    #[must_use]
    pub fn query(&self) -> CanaryStatus {
        let cell = self.cell.lock();
        let alive = cell.state.is_alive();
        CanaryStatus {
            name: self.name.clone(),
            canary_type: self.guard.kind(),
            feeding_interval: self.feeding_interval,
            time_last_fed: cell.state.time_last_fed(),
            alive,
            death_timestamp: cell.state.death_timestamp(),
            death: cell.state.death(),
            feed_deadline: alive.then(|| cell.state.expires_after()),
            hook: cell.hook.name().to_string(),
        }
    }

    /// Cached liveness; a lapsed interval is not noticed until the next feed or touch.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.cell.lock().state.is_alive()
    }

    #[must_use]
    pub fn time_last_fed(&self) -> Timestamp {
        self.cell.lock().state.time_last_fed()
    }

    /// Death timestamp, or zero while alive.
    #[must_use]
    pub fn death_timestamp(&self) -> Timestamp {
        self.cell.lock().state.death_timestamp()
    }

    #[must_use]
    pub const fn feeding_interval(&self) -> u64 {
        self.feeding_interval
    }

    #[must_use]
    pub const fn canary_type(&self) -> CanaryType {
        self.guard.kind()
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn feeders(&self) -> &BTreeSet<String> {
        self.guard.feeders()
    }

    /// The mutable part of the canary, for persistence.
    #[must_use]
    pub fn snapshot(&self) -> CanarySnapshot {
        let cell = self.cell.lock();
        CanarySnapshot {
            time_last_fed: cell.state.time_last_fed(),
            death: cell.state.death(),
            hook_state: cell.hook.private_state(),
        }
    }
}

impl std::fmt::Debug for Canary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Canary")
            .field("name", &self.name)
            .field("guard", &self.guard)
            .field("feeding_interval", &self.feeding_interval)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canary::hook::{AnnounceAction, DeathAction};
    use crate::core::clock::ManualClock;
    use crate::daemon::notifications::MemorySink;

    fn spec(interval: u64, feeders: &[&str]) -> CanarySpec {
        CanarySpec {
            name: "test".to_string(),
            canary_type: if feeders.len() == 1 {
                CanaryType::SingleFeeder
            } else {
                CanaryType::MultipleFeeders
            },
            feeding_interval: interval,
            feeders: feeders.iter().map(|f| (*f).to_string()).collect(),
        }
    }

    fn hatch(interval: u64, hook: DeathHook) -> (Canary, Arc<ManualClock>, Arc<MemorySink>) {
        let clock = Arc::new(ManualClock::new(0));
        let sink = Arc::new(MemorySink::new());
        let canary = Canary::new(
            &spec(interval, &["alice"]),
            hook,
            clock.clone(),
            sink.clone(),
        )
        .unwrap();
        (canary, clock, sink)
    }

    #[test]
    fn construction_rejects_zero_interval_and_empty_feeders() {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(0));
        let sink: Arc<dyn EventSink> = Arc::new(MemorySink::new());
        let err = Canary::new(&spec(0, &["alice"]), DeathHook::NoOp, clock.clone(), sink.clone())
            .unwrap_err();
        assert_eq!(err.code(), "CNY-1101");
        let err = Canary::new(&spec(10, &[]), DeathHook::NoOp, clock, sink).unwrap_err();
        assert_eq!(err.code(), "CNY-1101");
    }

    #[test]
    fn new_canary_reads() {
        let (canary, _, sink) = hatch(86_400, DeathHook::NoOp);
        assert!(canary.is_alive());
        assert_eq!(canary.death_timestamp(), 0);
        assert_eq!(canary.feeding_interval(), 86_400);
        assert_eq!(canary.canary_type(), CanaryType::SingleFeeder);
        assert!(sink.is_empty());
    }

    #[test]
    fn unauthorized_feed_has_no_effect() {
        let (canary, clock, sink) = hatch(10, DeathHook::NoOp);
        clock.set(50);
        let err = canary.feed("mallory").unwrap_err();
        assert_eq!(err.reason(), Some("You're not the feeder."));
        // Authorization is checked before expiry: the overdue canary is untouched.
        assert!(canary.is_alive());
        assert_eq!(canary.time_last_fed(), 0);
        assert!(sink.is_empty());
    }

    #[test]
    fn starving_feed_notifies_once_and_fails() {
        let (canary, clock, sink) = hatch(10, DeathHook::NoOp);
        clock.set(5);
        assert_eq!(canary.feed("alice").unwrap(), 5);
        clock.set(17);
        let err = canary.feed("alice").unwrap_err();
        assert!(matches!(
            err,
            CanaryError::Starved {
                time_last_fed: 5,
                death_timestamp: 17
            }
        ));
        assert_eq!(canary.time_last_fed(), 5);
        assert_eq!(sink.deaths(), 1);

        clock.set(18);
        let err = canary.feed("alice").unwrap_err();
        assert!(matches!(err, CanaryError::AlreadyDead { .. }));
        assert_eq!(sink.len(), 1);
    }

    #[test]
    fn hook_runs_after_core_notice() {
        let (canary, clock, sink) = hatch(10, DeathHook::custom(AnnounceAction::new("I am dead")));
        clock.set(2);
        canary.poison("alice").unwrap();

        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert!(matches!(
            &events[0],
            NotificationEvent::CanaryDied {
                death_timestamp: 2,
                trigger: Operation::Poison,
                ..
            }
        ));
        assert!(matches!(
            &events[1],
            NotificationEvent::HookRaised { message, .. } if message == "I am dead"
        ));
    }

    struct Exploding;

    impl DeathAction for Exploding {
        fn name(&self) -> &str {
            "exploding"
        }

        fn on_death(&mut self, _ctx: &DeathContext<'_>, _notices: &mut Vec<String>) -> Result<()> {
            Err(CanaryError::Runtime {
                details: "boom".to_string(),
            })
        }
    }

    #[test]
    fn hook_failure_keeps_death_committed() {
        let (canary, clock, sink) = hatch(10, DeathHook::custom(Exploding));
        clock.set(3);
        let err = canary.poison("alice").unwrap_err();
        assert!(matches!(err, CanaryError::HookFailed { .. }));
        assert!(err.committed_death());
        assert!(!canary.is_alive());
        assert_eq!(canary.death_timestamp(), 3);

        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], NotificationEvent::CanaryDied { .. }));
        assert!(matches!(events[1], NotificationEvent::HookFailed { .. }));

        // The hook never runs again.
        clock.set(4);
        assert!(!canary.touch("anyone").unwrap());
        assert_eq!(sink.len(), 2);
    }

    #[test]
    fn hook_failure_during_starving_feed_still_reports_starvation() {
        let (canary, clock, sink) = hatch(10, DeathHook::custom(Exploding));
        clock.set(11);
        let err = canary.feed("alice").unwrap_err();
        assert!(matches!(err, CanaryError::Starved { .. }));
        assert_eq!(sink.len(), 2);
    }

    #[test]
    fn deferred_hook_waits_for_its_caller() {
        let (canary, clock, sink) = hatch(10, DeathHook::custom(AnnounceAction::new("I am dead")));
        let canary = canary.with_deferred_hook();
        clock.set(2);
        let response = canary.dispatch(Operation::Poison, "alice");
        assert!(response.ok && response.died);
        assert_eq!(sink.events().len(), 1);
        assert_eq!(sink.deaths(), 1);
        assert_eq!(
            canary.snapshot().hook_state,
            Some(serde_json::json!({ "announced_at": null }))
        );

        assert!(matches!(canary.run_deferred_hook(), Some(Ok(()))));
        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[1], NotificationEvent::HookRaised { .. }));
        assert_eq!(
            canary.snapshot().hook_state,
            Some(serde_json::json!({ "announced_at": 2 }))
        );

        assert!(canary.run_deferred_hook().is_none());
        assert_eq!(sink.len(), 2);
    }

    #[test]
    fn deferred_hook_failure_folds_into_the_response() {
        let (canary, clock, sink) = hatch(10, DeathHook::custom(Exploding));
        let canary = canary.with_deferred_hook();
        clock.set(20);
        let mut response = canary.dispatch(Operation::Touch, "anyone");
        assert!(response.ok && response.died);

        let err = canary.run_deferred_hook().unwrap().unwrap_err();
        response.record_hook_failure(&err);
        assert!(!response.ok);
        assert_eq!(response.error_code, Some("CNY-2101"));
        assert!(!response.status.alive);
        assert!(matches!(sink.events()[1], NotificationEvent::HookFailed { .. }));

        let mut late = canary.dispatch(Operation::Feed, "alice");
        late.record_hook_failure(&err);
        assert_eq!(late.reason.as_deref(), Some("The canary has died."));
    }

    #[test]
    fn dispatch_translates_rejections() {
        let (canary, clock, _) = hatch(86_400, DeathHook::NoOp);
        clock.set(1);
        let denied = canary.dispatch(Operation::Poison, "bob");
        assert!(!denied.ok);
        assert_eq!(denied.reason.as_deref(), Some("You're not the feeder."));
        assert_eq!(denied.error_code, Some("CNY-2001"));
        assert!(denied.status.alive);
        assert!(!denied.died);

        clock.set(2);
        let killed = canary.dispatch(Operation::Poison, "alice");
        assert!(killed.ok);
        assert!(killed.died);
        assert!(!killed.alive);
        assert_eq!(killed.status.death_timestamp, 2);

        let again = canary.dispatch(Operation::Feed, "alice");
        assert!(!again.ok);
        assert!(!again.died);
        assert_eq!(again.reason.as_deref(), Some("The canary has died."));
    }

    #[test]
    fn dispatch_touch_reports_liveness() {
        let (canary, clock, _) = hatch(10, DeathHook::NoOp);
        clock.set(3);
        let alive = canary.dispatch(Operation::Touch, "anyone");
        assert!(alive.ok && alive.alive && !alive.died);

        clock.set(20);
        let dead = canary.dispatch(Operation::Touch, "anyone");
        assert!(dead.ok && !dead.alive && dead.died);
    }

    #[test]
    fn query_reports_deadline_only_while_alive() {
        let (canary, clock, _) = hatch(10, DeathHook::NoOp);
        clock.set(4);
        canary.feed("alice").unwrap();
        let status = canary.query();
        assert_eq!(status.feed_deadline, Some(14));
        assert_eq!(status.hook, "none");

        canary.poison("alice").unwrap();
        let status = canary.query();
        assert_eq!(status.feed_deadline, None);
        assert_eq!(status.death_timestamp, 4);
    }

    #[test]
    fn snapshot_and_restore_preserve_state_and_hook() {
        let (canary, clock, _) = hatch(10, DeathHook::custom(AnnounceAction::new("I am dead")));
        clock.set(6);
        canary.feed("alice").unwrap();
        clock.set(30);
        assert!(!canary.touch("x").unwrap());
        let snapshot = canary.snapshot();
        assert_eq!(snapshot.time_last_fed, 6);
        assert_eq!(
            snapshot.death,
            Some(Death {
                timestamp: 30,
                trigger: Operation::Touch
            })
        );

        let sink = Arc::new(MemorySink::new());
        let restored = Canary::restore(
            &spec(10, &["alice"]),
            snapshot.clone(),
            DeathHook::custom(AnnounceAction::new("I am dead")),
            clock.clone(),
            sink.clone(),
        )
        .unwrap();
        assert_eq!(restored.snapshot(), snapshot);
        assert!(!restored.is_alive());
        assert!(!restored.touch("x").unwrap());
        assert!(sink.is_empty());
    }

    #[test]
    fn concurrent_touches_notify_once() {
        let (canary, clock, sink) = hatch(10, DeathHook::NoOp);
        clock.set(100);
        let canary = Arc::new(canary);
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let canary = Arc::clone(&canary);
                std::thread::spawn(move || canary.touch(&format!("t{i}")).unwrap())
            })
            .collect();
        for handle in handles {
            assert!(!handle.join().unwrap());
        }
        assert_eq!(sink.deaths(), 1);
    }
}
