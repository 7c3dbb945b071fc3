//! Feeder authorization: fail-closed identity checks evaluated before any mutation.

use std::collections::BTreeSet;
use std::sync::OnceLock;

use regex::Regex;

use crate::canary::types::{CanaryType, Role};
use crate::core::errors::{CanaryError, Result};

/// Identities are opaque to the canary but must be printable and bounded.
const IDENTITY_PATTERN: &str = r"^[A-Za-z0-9._@:+\-]{1,128}$";

fn identity_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(IDENTITY_PATTERN).expect("identity pattern compiles"))
}

/// Whether `identity` is acceptable as a registered feeder.
#[must_use]
pub fn is_valid_identity(identity: &str) -> bool {
    identity_regex().is_match(identity)
}

/// Verifies caller identities against an immutable feeder set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessGuard {
    kind: CanaryType,
    feeders: BTreeSet<String>,
}

impl AccessGuard {
    /// Build a guard for `kind`, validating the feeder set against the variant.
    pub fn new<I, S>(kind: CanaryType, feeders: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut set = BTreeSet::new();
        for feeder in feeders {
            let feeder = feeder.into();
            if !is_valid_identity(&feeder) {
                return Err(CanaryError::Construction {
                    details: format!("invalid feeder identity {feeder:?}"),
                });
            }
            if !set.insert(feeder.clone()) {
                return Err(CanaryError::Construction {
                    details: format!("duplicate feeder identity {feeder:?}"),
                });
            }
        }

        if set.is_empty() {
            return Err(CanaryError::Construction {
                details: "feeder set must not be empty".to_string(),
            });
        }
        if kind == CanaryType::SingleFeeder && set.len() != 1 {
            return Err(CanaryError::Construction {
                details: format!(
                    "single_feeder canary takes exactly one feeder, got {}",
                    set.len()
                ),
            });
        }

        Ok(Self { kind, feeders: set })
    }

    /// Check `caller` for `role`. Anything outside the feeder set is rejected.
    pub fn authorize(&self, caller: &str, role: Role) -> Result<()> {
        let allowed = match role {
            Role::Feeder => self.feeders.contains(caller),
        };
        if allowed {
            Ok(())
        } else {
            Err(CanaryError::Unauthorized {
                caller: caller.to_string(),
                role,
            })
        }
    }

    #[must_use]
    pub const fn kind(&self) -> CanaryType {
        self.kind
    }

    #[must_use]
    pub fn feeders(&self) -> &BTreeSet<String> {
        &self.feeders
    }
}
