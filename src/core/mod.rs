//! Core types: errors, configuration, clocks, and durable canary state.

pub mod clock;
pub mod config;
pub mod errors;
pub mod state_store;
