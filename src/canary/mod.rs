//! The canary: access control, state machine, death hooks, and the facade
//! that composes them.

pub mod access;
pub mod facade;
pub mod hook;
pub mod state;
pub mod types;
