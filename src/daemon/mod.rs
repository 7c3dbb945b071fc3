//! Notification delivery, signal handling, and the proactive watch loop.

pub mod notifications;
#[cfg(feature = "daemon")]
pub mod signals;
#[cfg(feature = "daemon")]
pub mod watch;
