//! The canary state machine: Alive until starved or poisoned, then Dead forever.
//!
//! Expiry is evaluated lazily: nothing runs between calls, so a lapsed feeding
//! interval is only noticed by the next feed or touch. Until then the canary
//! reads as alive. Reads never re-evaluate expiry.
//!
//! ```text
//!            feed (within interval)
//!              ┌──────┐
//!              ▼      │
//!           ┌───────────┐  feed/touch past interval  ┌──────┐
//!  new() ──▶│   Alive   │ ─────────────────────────▶ │ Dead │ (absorbing)
//!           └───────────┘         poison             └──────┘
//!                       ─────────────────────────▶
//! ```
//!
//! This type performs no authorization and no I/O; the facade layers those on.

use crate::canary::types::{Death, NO_DEATH, Operation, Timestamp};
use crate::core::errors::{CanaryError, Result};

/// Result of a feed that was not rejected outright.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedOutcome {
    /// Renewed; `time_last_fed` now equals the call's `now`.
    Fed { time_last_fed: Timestamp },
    /// The interval had lapsed: the canary died during this call.
    Starved(Death),
}

/// Result of a touch. Touch never fails on a dead canary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TouchOutcome {
    Alive,
    /// The interval had lapsed: the canary died during this call.
    Died(Death),
    /// Already dead before the call; nothing happened.
    StillDead,
}

impl TouchOutcome {
    #[must_use]
    pub const fn is_alive(self) -> bool {
        matches!(self, Self::Alive)
    }
}

/// Mutable core of a canary: feeding interval, last feeding, and death record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanaryState {
    feeding_interval: u64,
    time_last_fed: Timestamp,
    death: Option<Death>,
}

impl CanaryState {
    /// A freshly hatched, alive canary last fed at `now`.
    pub fn new(feeding_interval: u64, now: Timestamp) -> Result<Self> {
        if feeding_interval == 0 {
            return Err(CanaryError::Construction {
                details: "feeding interval must be > 0".to_string(),
            });
        }
        Ok(Self {
            feeding_interval,
            time_last_fed: now,
            death: None,
        })
    }

    /// Reassemble a state from persisted parts, re-checking invariants.
    pub fn from_parts(
        feeding_interval: u64,
        time_last_fed: Timestamp,
        death: Option<Death>,
    ) -> Result<Self> {
        let mut state = Self::new(feeding_interval, time_last_fed)?;
        if let Some(death) = death {
            if death.timestamp < time_last_fed {
                return Err(CanaryError::Construction {
                    details: format!(
                        "death at {} precedes last feeding at {time_last_fed}",
                        death.timestamp
                    ),
                });
            }
            if death.trigger == Operation::Query {
                return Err(CanaryError::Construction {
                    details: "a query cannot cause death".to_string(),
                });
            }
            state.death = Some(death);
        }
        Ok(state)
    }

    /// Renew the canary, or pronounce it dead if the interval already lapsed.
    ///
    /// A starving feed commits the death but leaves `time_last_fed` untouched.
    pub fn feed(&mut self, now: Timestamp) -> Result<FeedOutcome> {
        self.ensure_alive()?;
        self.ensure_monotonic(now)?;

        if self.is_expired_at(now) {
            return Ok(FeedOutcome::Starved(self.die(now, Operation::Feed)));
        }

        self.time_last_fed = now;
        Ok(FeedOutcome::Fed {
            time_last_fed: now,
        })
    }

    /// Check for expiry without renewing.
    pub fn touch(&mut self, now: Timestamp) -> Result<TouchOutcome> {
        if self.death.is_some() {
            return Ok(TouchOutcome::StillDead);
        }
        self.ensure_monotonic(now)?;

        if self.is_expired_at(now) {
            Ok(TouchOutcome::Died(self.die(now, Operation::Touch)))
        } else {
            Ok(TouchOutcome::Alive)
        }
    }

    /// Kill the canary now, regardless of how recently it was fed.
    pub fn poison(&mut self, now: Timestamp) -> Result<Death> {
        self.ensure_alive()?;
        self.ensure_monotonic(now)?;
        Ok(self.die(now, Operation::Poison))
    }

    /// Cached liveness. Does not look at the clock.
    #[must_use]
    pub const fn is_alive(&self) -> bool {
        self.death.is_none()
    }

    /// Whether a feed or touch at `now` would find the interval lapsed.
    #[must_use]
    pub const fn is_expired_at(&self, now: Timestamp) -> bool {
        now.saturating_sub(self.time_last_fed) > self.feeding_interval
    }

    /// Unix time at which the interval lapses (exclusive boundary).
    #[must_use]
    pub const fn expires_after(&self) -> Timestamp {
        self.time_last_fed.saturating_add(self.feeding_interval)
    }

    #[must_use]
    pub const fn feeding_interval(&self) -> u64 {
        self.feeding_interval
    }

    #[must_use]
    pub const fn time_last_fed(&self) -> Timestamp {
        self.time_last_fed
    }

    #[must_use]
    pub const fn death(&self) -> Option<Death> {
        self.death
    }

    /// Death timestamp, or [`NO_DEATH`] while alive.
    #[must_use]
    pub fn death_timestamp(&self) -> Timestamp {
        self.death.map_or(NO_DEATH, |d| d.timestamp)
    }

    fn die(&mut self, now: Timestamp, trigger: Operation) -> Death {
        debug_assert!(self.death.is_none(), "death is set exactly once");
        let death = Death {
            timestamp: now,
            trigger,
        };
        self.death = Some(death);
        death
    }

    fn ensure_alive(&self) -> Result<()> {
        match self.death {
            Some(death) => Err(CanaryError::AlreadyDead {
                death_timestamp: death.timestamp,
            }),
            None => Ok(()),
        }
    }

    fn ensure_monotonic(&self, now: Timestamp) -> Result<()> {
        if now < self.time_last_fed {
            return Err(CanaryError::ClockRegression {
                now,
                time_last_fed: self.time_last_fed,
            });
        }
        Ok(())
    }
}
