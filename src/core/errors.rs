//! CNY-prefixed error types with structured error codes.

#![allow(missing_docs)]

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::canary::types::{Role, Timestamp};

/// Shared `Result` alias for the project.
pub type Result<T> = std::result::Result<T, CanaryError>;

/// Stable reason string for callers outside the feeder set.
pub const REASON_NOT_FEEDER: &str = "You're not the feeder.";

/// Stable reason string for mutating calls against a dead canary.
pub const REASON_DEAD: &str = "The canary has died.";

/// Top-level error type for the canary switch.
#[derive(Debug, Error)]
pub enum CanaryError {
    #[error("[CNY-1001] invalid configuration: {details}")]
    InvalidConfig { details: String },

    #[error("[CNY-1002] missing configuration file: {path}")]
    MissingConfig { path: PathBuf },

    #[error("[CNY-1003] configuration parse failure in {context}: {details}")]
    ConfigParse {
        context: &'static str,
        details: String,
    },

    #[error("[CNY-1101] cannot construct canary: {details}")]
    Construction { details: String },

    #[error("[CNY-2001] {reason} (caller {caller:?} lacks role {role})", reason = REASON_NOT_FEEDER)]
    Unauthorized { caller: String, role: Role },

    #[error("[CNY-2002] {reason} (died at {death_timestamp})", reason = REASON_DEAD)]
    AlreadyDead { death_timestamp: Timestamp },

    #[error("[CNY-2003] {reason} (starved: fed at {time_last_fed}, died at {death_timestamp})", reason = REASON_DEAD)]
    Starved {
        time_last_fed: Timestamp,
        death_timestamp: Timestamp,
    },

    #[error("[CNY-2004] clock went backwards: now {now} is before last feeding at {time_last_fed}")]
    ClockRegression {
        now: Timestamp,
        time_last_fed: Timestamp,
    },

    #[error("[CNY-2101] death hook {hook} failed after death was committed: {details}")]
    HookFailed { hook: String, details: String },

    #[error("[CNY-2201] serialization failure in {context}: {details}")]
    Serialization {
        context: &'static str,
        details: String,
    },

    #[error("[CNY-2202] corrupt canary state at {path}: {details}")]
    StateCorrupt { path: PathBuf, details: String },

    #[error("[CNY-3002] IO failure at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("[CNY-3900] runtime failure: {details}")]
    Runtime { details: String },
}

impl CanaryError {
    /// Stable machine-parseable error code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::InvalidConfig { .. } => "CNY-1001",
            Self::MissingConfig { .. } => "CNY-1002",
            Self::ConfigParse { .. } => "CNY-1003",
            Self::Construction { .. } => "CNY-1101",
            Self::Unauthorized { .. } => "CNY-2001",
            Self::AlreadyDead { .. } => "CNY-2002",
            Self::Starved { .. } => "CNY-2003",
            Self::ClockRegression { .. } => "CNY-2004",
            Self::HookFailed { .. } => "CNY-2101",
            Self::Serialization { .. } => "CNY-2201",
            Self::StateCorrupt { .. } => "CNY-2202",
            Self::Io { .. } => "CNY-3002",
            Self::Runtime { .. } => "CNY-3900",
        }
    }

    /// Matchable reason string for rejections observed at the boundary.
    ///
    /// Only the canary's own rejections carry the fixed wording; everything
    /// else is reported through its `Display` text.
    #[must_use]
    pub const fn reason(&self) -> Option<&'static str> {
        match self {
            Self::Unauthorized { .. } => Some(REASON_NOT_FEEDER),
            Self::AlreadyDead { .. } | Self::Starved { .. } => Some(REASON_DEAD),
            _ => None,
        }
    }

    /// Whether the failed call left a committed death behind it.
    #[must_use]
    pub const fn committed_death(&self) -> bool {
        matches!(self, Self::Starved { .. } | Self::HookFailed { .. })
    }

    /// Whether retrying might resolve the failure.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Io { .. } | Self::Runtime { .. })
    }

    /// Convenience constructor for IO errors with a known path.
    #[must_use]
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }
}

impl From<serde_json::Error> for CanaryError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization {
            context: "serde_json",
            details: value.to_string(),
        }
    }
}

impl From<toml::de::Error> for CanaryError {
    fn from(value: toml::de::Error) -> Self {
        Self::ConfigParse {
            context: "toml",
            details: value.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn every_variant() -> Vec<CanaryError> {
        vec![
            CanaryError::InvalidConfig {
                details: String::new(),
            },
            CanaryError::MissingConfig {
                path: PathBuf::new(),
            },
            CanaryError::ConfigParse {
                context: "",
                details: String::new(),
            },
            CanaryError::Construction {
                details: String::new(),
            },
            CanaryError::Unauthorized {
                caller: String::new(),
                role: Role::Feeder,
            },
            CanaryError::AlreadyDead { death_timestamp: 0 },
            CanaryError::Starved {
                time_last_fed: 0,
                death_timestamp: 0,
            },
            CanaryError::ClockRegression {
                now: 0,
                time_last_fed: 0,
            },
            CanaryError::HookFailed {
                hook: String::new(),
                details: String::new(),
            },
            CanaryError::Serialization {
                context: "",
                details: String::new(),
            },
            CanaryError::StateCorrupt {
                path: PathBuf::new(),
                details: String::new(),
            },
            CanaryError::Io {
                path: PathBuf::new(),
                source: std::io::Error::other("test"),
            },
            CanaryError::Runtime {
                details: String::new(),
            },
        ]
    }

    #[test]
    fn error_codes_are_unique() {
        let errors = every_variant();
        let codes: Vec<&str> = errors.iter().map(CanaryError::code).collect();
        let unique: std::collections::HashSet<&&str> = codes.iter().collect();
        assert_eq!(
            codes.len(),
            unique.len(),
            "error codes must be unique: {codes:?}"
        );
    }

    #[test]
    fn display_carries_code_prefix() {
        for err in every_variant() {
            let msg = err.to_string();
            assert!(
                msg.starts_with(&format!("[{}]", err.code())),
                "display should lead with code: {msg}"
            );
        }
    }

    #[test]
    fn rejection_reasons_are_stable() {
        let unauthorized = CanaryError::Unauthorized {
            caller: "mallory".to_string(),
            role: Role::Feeder,
        };
        assert_eq!(unauthorized.reason(), Some("You're not the feeder."));
        assert!(unauthorized.to_string().contains("You're not the feeder."));
        assert!(unauthorized.to_string().contains("mallory"));

        let dead = CanaryError::AlreadyDead {
            death_timestamp: 17,
        };
        assert_eq!(dead.reason(), Some("The canary has died."));

        let starved = CanaryError::Starved {
            time_last_fed: 5,
            death_timestamp: 17,
        };
        assert_eq!(starved.reason(), Some("The canary has died."));

        assert_eq!(
            CanaryError::Runtime {
                details: "x".to_string()
            }
            .reason(),
            None
        );
    }

    #[test]
    fn committed_death_only_for_post_commit_failures() {
        assert!(
            CanaryError::Starved {
                time_last_fed: 0,
                death_timestamp: 11
            }
            .committed_death()
        );
        assert!(
            CanaryError::HookFailed {
                hook: "command".to_string(),
                details: String::new()
            }
            .committed_death()
        );
        assert!(!CanaryError::AlreadyDead { death_timestamp: 1 }.committed_death());
        assert!(
            !CanaryError::Unauthorized {
                caller: String::new(),
                role: Role::Feeder
            }
            .committed_death()
        );
    }

    #[test]
    fn logical_rejections_are_not_retryable() {
        assert!(
            CanaryError::Io {
                path: PathBuf::new(),
                source: std::io::Error::other("test"),
            }
            .is_retryable()
        );
        assert!(!CanaryError::AlreadyDead { death_timestamp: 3 }.is_retryable());
        assert!(
            !CanaryError::Unauthorized {
                caller: String::new(),
                role: Role::Feeder
            }
            .is_retryable()
        );
    }

    #[test]
    fn io_convenience_constructor() {
        let err = CanaryError::io(
            "/tmp/canary.json",
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        );
        assert_eq!(err.code(), "CNY-3002");
        assert!(err.to_string().contains("/tmp/canary.json"));
    }

    #[test]
    fn from_serde_json_error() {
        let json_err = serde_json::from_str::<serde_json::Value>("not json").unwrap_err();
        let err: CanaryError = json_err.into();
        assert_eq!(err.code(), "CNY-2201");
    }

    #[test]
    fn from_toml_error() {
        let toml_err = toml::from_str::<toml::Value>("= invalid").unwrap_err();
        let err: CanaryError = toml_err.into();
        assert_eq!(err.code(), "CNY-1003");
    }
}
