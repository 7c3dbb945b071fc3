//! Shared vocabulary: timestamps, roles, canary variants, operations, deaths.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Seconds since the unix epoch, as supplied by a [`crate::core::clock::Clock`].
pub type Timestamp = u64;

/// Sentinel returned by death-timestamp reads while the canary is alive.
pub const NO_DEATH: Timestamp = 0;

/// Role required by gated operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// May feed and poison.
    Feeder,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Feeder => write!(f, "feeder"),
        }
    }
}

/// Access variant of a canary.
///
/// The variant only selects how feeders are authorized; expiry and death
/// handling are identical across variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CanaryType {
    /// Exactly one registered feeder.
    #[default]
    SingleFeeder,
    /// Any member of a non-empty feeder set may feed or poison.
    MultipleFeeders,
}

impl CanaryType {
    /// Parse the config/env spelling of a variant.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "single_feeder" | "single" => Some(Self::SingleFeeder),
            "multiple_feeders" | "multi_feeder" | "multiple" => Some(Self::MultipleFeeders),
            _ => None,
        }
    }
}

impl fmt::Display for CanaryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SingleFeeder => write!(f, "single_feeder"),
            Self::MultipleFeeders => write!(f, "multiple_feeders"),
        }
    }
}

/// Boundary operations that may be dispatched against a canary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Feed,
    Poison,
    Touch,
    Query,
}

impl Operation {
    /// Whether the operation can change canary state.
    #[must_use]
    pub const fn is_mutating(self) -> bool {
        !matches!(self, Self::Query)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Feed => write!(f, "feed"),
            Self::Poison => write!(f, "poison"),
            Self::Touch => write!(f, "touch"),
            Self::Query => write!(f, "query"),
        }
    }
}

/// The death pronouncement: when the canary died and which call noticed it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Death {
    pub timestamp: Timestamp,
    pub trigger: Operation,
}
