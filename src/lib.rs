#![forbid(unsafe_code)]

//! Canary switch: a liveness dead-man's switch.
//!
//! A canary stays alive only while an authorized feeder keeps feeding it within
//! a fixed interval. Expiry is noticed lazily, by the next feed or touch, and
//! death is irreversible: it is announced exactly once and runs the canary's
//! death hook exactly once.
//!
//! # Library usage
//!
//! Use the [`prelude`] for convenient access to the most common types:
//!
//! ```rust,no_run
//! use canary_switch::prelude::*;
//! ```
//!
//! Individual modules can also be imported directly:
//!
//! ```rust,no_run
//! use canary_switch::canary::facade::{Canary, CanarySpec};
//! use canary_switch::core::config::Config;
//! ```

pub mod prelude;

pub mod canary;
pub mod core;
pub mod daemon;
pub mod logger;
