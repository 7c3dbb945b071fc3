//! Convenience re-exports for library consumers.
//!
//! ```rust,no_run
//! use canary_switch::prelude::*;
//! ```

// Core
pub use crate::core::clock::{Clock, ManualClock, SystemClock};
pub use crate::core::config::Config;
pub use crate::core::errors::{CanaryError, REASON_DEAD, REASON_NOT_FEEDER, Result};
pub use crate::core::state_store::StateStore;

// Canary
pub use crate::canary::access::AccessGuard;
pub use crate::canary::facade::{Canary, CanarySnapshot, CanarySpec, CanaryStatus, Response};
pub use crate::canary::hook::{DeathAction, DeathContext, DeathHook};
pub use crate::canary::state::CanaryState;
pub use crate::canary::types::{CanaryType, Death, Operation, Role, Timestamp};

// Notifications
pub use crate::daemon::notifications::{
    EventSink, FanoutSink, HeldSink, MemorySink, NotificationEvent, NotificationManager,
};

// Logging
pub use crate::logger::jsonl::{ActivityLog, JsonlWriter};
