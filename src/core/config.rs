//! Configuration system: TOML file + env var overrides + smart defaults.

#![allow(missing_docs)]

use std::collections::{BTreeSet, HashSet};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::canary::access::is_valid_identity;
use crate::canary::facade::CanarySpec;
use crate::canary::hook::{HookConfig, HookKind};
use crate::canary::types::CanaryType;
use crate::core::errors::{CanaryError, Result};
use crate::daemon::notifications::NotificationConfig;

/// Full canary configuration model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct Config {
    pub canary: CanaryConfig,
    pub notifications: NotificationConfig,
    pub logging: LoggingConfig,
    pub paths: PathsConfig,
}

/// The canary itself: identity, interval, variant, feeders, and death hook.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CanaryConfig {
    /// Label carried in notifications and logs.
    pub name: String,
    /// Seconds a feeding stays good for. Must be > 0.
    pub feeding_interval_secs: u64,
    pub canary_type: CanaryType,
    pub feeders: Vec<String>,
    pub hook: HookConfig,
}

/// Activity-log rotation and durability knobs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingConfig {
    pub enabled: bool,
    pub max_size_bytes: u64,
    pub max_rotated_files: u32,
    pub fsync_interval_secs: u64,
}

/// Filesystem paths used by the canary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathsConfig {
    pub config_file: PathBuf,
    pub state_file: PathBuf,
    pub activity_log: PathBuf,
}

impl Default for CanaryConfig {
    fn default() -> Self {
        let feeder = env::var("USER")
            .ok()
            .filter(|user| is_valid_identity(user))
            .unwrap_or_else(|| "owner".to_string());
        Self {
            name: "canary".to_string(),
            feeding_interval_secs: 86_400,
            canary_type: CanaryType::SingleFeeder,
            feeders: vec![feeder],
            hook: HookConfig::default(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_size_bytes: 10 * 1024 * 1024,
            max_rotated_files: 5,
            fsync_interval_secs: 0,
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        let home_dir = env::var_os("HOME").map_or_else(
            || {
                eprintln!(
                    "[CNY-CONFIG] WARNING: HOME not set, falling back to /tmp for data paths"
                );
                PathBuf::from("/tmp")
            },
            PathBuf::from,
        );
        let cfg = home_dir.join(".config").join("canary").join("config.toml");
        let data = home_dir.join(".local").join("share").join("canary");
        Self {
            config_file: cfg,
            state_file: data.join("state.json"),
            activity_log: data.join("activity.jsonl"),
        }
    }
}

impl CanaryConfig {
    /// Immutable construction parameters for the configured canary.
    #[must_use]
    pub fn spec(&self) -> CanarySpec {
        CanarySpec {
            name: self.name.clone(),
            canary_type: self.canary_type,
            feeding_interval: self.feeding_interval_secs,
            feeders: self.feeders.iter().cloned().collect::<BTreeSet<_>>(),
        }
    }
}

impl Config {
    /// Default configuration path.
    #[must_use]
    pub fn default_path() -> PathBuf {
        PathsConfig::default().config_file
    }

    /// Load config from default or explicit path, then apply env overrides.
    ///
    /// Missing config file is not an error when loading from default path; defaults are used.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path_buf = path.map_or_else(Self::default_path, Path::to_path_buf);
        let is_explicit_path = path.is_some();

        let mut cfg = if path_buf.exists() {
            let raw = fs::read_to_string(&path_buf).map_err(|source| CanaryError::Io {
                path: path_buf.clone(),
                source,
            })?;
            let parsed: Self = toml::from_str(&raw)?;
            parsed
        } else if is_explicit_path {
            return Err(CanaryError::MissingConfig { path: path_buf });
        } else {
            Self::default()
        };

        cfg.paths.config_file = path_buf;
        cfg.apply_env_overrides_from(env_var)?;
        cfg.normalize();
        cfg.validate()?;
        Ok(cfg)
    }

    /// Deterministic hash of the effective config for logging/telemetry.
    ///
    /// FNV-1a over the canonical JSON form, stable across processes.
    pub fn stable_hash(&self) -> Result<String> {
        let canonical = serde_json::to_string(self)?;
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for byte in canonical.as_bytes() {
            hash ^= u64::from(*byte);
            hash = hash.wrapping_mul(0x0100_0000_01b3);
        }
        Ok(format!("{hash:016x}"))
    }

    fn apply_env_overrides_from<F>(&mut self, mut lookup: F) -> Result<()>
    where
        F: FnMut(&str) -> Option<String>,
    {
        if let Some(raw) = lookup("CANARY_NAME") {
            self.canary.name = raw.trim().to_string();
        }

        if let Some(raw) = lookup("CANARY_FEEDING_INTERVAL_SECS") {
            self.canary.feeding_interval_secs =
                parse_env_u64("CANARY_FEEDING_INTERVAL_SECS", &raw)?;
        }

        if let Some(raw) = lookup("CANARY_TYPE") {
            self.canary.canary_type =
                CanaryType::parse(&raw).ok_or_else(|| CanaryError::ConfigParse {
                    context: "env",
                    details: format!("CANARY_TYPE={raw:?}: unknown canary type"),
                })?;
        }

        if let Some(raw) = lookup("CANARY_FEEDERS") {
            self.canary.feeders = raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }

        if let Some(raw) = lookup("CANARY_HOOK_KIND") {
            self.canary.hook.kind = HookKind::parse(&raw).ok_or_else(|| CanaryError::ConfigParse {
                context: "env",
                details: format!("CANARY_HOOK_KIND={raw:?}: unknown hook kind"),
            })?;
        }

        if let Some(raw) = lookup("CANARY_STATE_FILE") {
            self.paths.state_file = PathBuf::from(raw);
        }

        if let Some(raw) = lookup("CANARY_ACTIVITY_LOG") {
            self.paths.activity_log = PathBuf::from(raw);
        }

        if let Some(raw) = lookup("CANARY_NOTIFICATIONS_ENABLED") {
            self.notifications.enabled = parse_env_bool("CANARY_NOTIFICATIONS_ENABLED", &raw)?;
        }

        Ok(())
    }

    fn normalize(&mut self) {
        self.canary.name = self.canary.name.trim().to_string();
        for feeder in &mut self.canary.feeders {
            *feeder = feeder.trim().to_string();
        }
    }

    fn validate(&self) -> Result<()> {
        let canary = &self.canary;

        if canary.name.is_empty() {
            return Err(CanaryError::InvalidConfig {
                details: "canary.name must not be empty".to_string(),
            });
        }

        if canary.feeding_interval_secs == 0 {
            return Err(CanaryError::InvalidConfig {
                details: "canary.feeding_interval_secs must be > 0".to_string(),
            });
        }

        if canary.feeders.is_empty() {
            return Err(CanaryError::InvalidConfig {
                details: "canary.feeders must list at least one identity".to_string(),
            });
        }

        let mut seen = HashSet::new();
        for feeder in &canary.feeders {
            if !is_valid_identity(feeder) {
                return Err(CanaryError::InvalidConfig {
                    details: format!(
                        "canary.feeders entry {feeder:?} must match [A-Za-z0-9._@:+-]{{1,128}}"
                    ),
                });
            }
            if !seen.insert(feeder.as_str()) {
                return Err(CanaryError::InvalidConfig {
                    details: format!("canary.feeders lists {feeder:?} more than once"),
                });
            }
        }

        if canary.canary_type == CanaryType::SingleFeeder && canary.feeders.len() != 1 {
            return Err(CanaryError::InvalidConfig {
                details: format!(
                    "canary.canary_type=single_feeder requires exactly one feeder, got {}",
                    canary.feeders.len()
                ),
            });
        }

        if canary.hook.kind == HookKind::Command && canary.hook.command.is_empty() {
            return Err(CanaryError::InvalidConfig {
                details: "canary.hook.command must not be empty for kind=command".to_string(),
            });
        }

        if self.logging.max_size_bytes == 0 {
            return Err(CanaryError::InvalidConfig {
                details: "logging.max_size_bytes must be > 0".to_string(),
            });
        }

        if self.paths.state_file.as_os_str().is_empty() {
            return Err(CanaryError::InvalidConfig {
                details: "paths.state_file must not be empty".to_string(),
            });
        }

        Ok(())
    }
}

fn env_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|raw| !raw.trim().is_empty())
}

fn parse_env_u64(name: &str, raw: &str) -> Result<u64> {
    raw.trim()
        .parse::<u64>()
        .map_err(|error| CanaryError::ConfigParse {
            context: "env",
            details: format!("{name}={raw:?}: {error}"),
        })
}

fn parse_env_bool(name: &str, raw: &str) -> Result<bool> {
    raw.trim()
        .parse::<bool>()
        .map_err(|error| CanaryError::ConfigParse {
            context: "env",
            details: format!("{name}={raw:?}: {error}"),
        })
}

#[cfg(test)]
mod tests {
    use super::{CanaryError, Config};
    use crate::canary::hook::HookKind;
    use crate::canary::types::CanaryType;
    use std::collections::HashMap;
    use std::path::{Path, PathBuf};

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(name, value)| ((*name).to_string(), (*value).to_string()))
            .collect()
    }

    fn single(feeder: &str) -> Config {
        let mut cfg = Config::default();
        cfg.canary.feeders = vec![feeder.to_string()];
        cfg
    }

    #[test]
    fn default_config_is_valid() {
        let cfg = single("alice");
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.canary.feeding_interval_secs, 86_400);
        assert_eq!(cfg.canary.canary_type, CanaryType::SingleFeeder);
    }

    #[test]
    fn zero_interval_rejected() {
        let mut cfg = single("alice");
        cfg.canary.feeding_interval_secs = 0;
        let err = cfg.validate().expect_err("expected interval error");
        match err {
            CanaryError::InvalidConfig { details } => {
                assert!(details.contains("feeding_interval_secs"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn empty_feeders_rejected() {
        let mut cfg = single("alice");
        cfg.canary.feeders.clear();
        let err = cfg.validate().expect_err("expected feeder error");
        assert!(err.to_string().contains("at least one"));
    }

    #[test]
    fn single_feeder_with_two_feeders_rejected() {
        let mut cfg = single("alice");
        cfg.canary.feeders.push("bob".to_string());
        let err = cfg.validate().expect_err("expected variant error");
        assert!(err.to_string().contains("exactly one"));

        cfg.canary.canary_type = CanaryType::MultipleFeeders;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn invalid_feeder_identity_rejected() {
        let cfg = single("not valid");
        let err = cfg.validate().expect_err("expected identity error");
        assert!(err.to_string().contains("must match"));
    }

    #[test]
    fn duplicate_feeders_rejected() {
        let mut cfg = single("alice");
        cfg.canary.canary_type = CanaryType::MultipleFeeders;
        cfg.canary.feeders.push("alice".to_string());
        let err = cfg.validate().expect_err("expected duplicate error");
        assert!(err.to_string().contains("more than once"));
    }

    #[test]
    fn command_hook_requires_command() {
        let mut cfg = single("alice");
        cfg.canary.hook.kind = HookKind::Command;
        assert!(cfg.validate().is_err());
        cfg.canary.hook.command = vec!["/usr/bin/true".to_string()];
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn env_overrides_apply() {
        let env = vars(&[
            ("CANARY_NAME", "vault"),
            ("CANARY_FEEDING_INTERVAL_SECS", "10"),
            ("CANARY_TYPE", "multiple_feeders"),
            ("CANARY_FEEDERS", "alice, bob ,,carol"),
            ("CANARY_HOOK_KIND", "announce"),
            ("CANARY_STATE_FILE", "/tmp/vault.json"),
            ("CANARY_NOTIFICATIONS_ENABLED", "false"),
        ]);
        let mut cfg = Config::default();
        cfg.apply_env_overrides_from(|name| env.get(name).cloned())
            .expect("env overrides should apply");
        cfg.normalize();
        cfg.validate().expect("overridden config is valid");

        assert_eq!(cfg.canary.name, "vault");
        assert_eq!(cfg.canary.feeding_interval_secs, 10);
        assert_eq!(cfg.canary.canary_type, CanaryType::MultipleFeeders);
        assert_eq!(cfg.canary.feeders, vec!["alice", "bob", "carol"]);
        assert_eq!(cfg.canary.hook.kind, HookKind::Announce);
        assert_eq!(cfg.paths.state_file, PathBuf::from("/tmp/vault.json"));
        assert!(!cfg.notifications.enabled);
    }

    #[test]
    fn env_invalid_values_rejected() {
        let env = vars(&[("CANARY_FEEDING_INTERVAL_SECS", "soon")]);
        let mut cfg = Config::default();
        let err = cfg
            .apply_env_overrides_from(|name| env.get(name).cloned())
            .expect_err("expected parse error");
        assert_eq!(err.code(), "CNY-1003");

        let env = vars(&[("CANARY_TYPE", "iot")]);
        let err = cfg
            .apply_env_overrides_from(|name| env.get(name).cloned())
            .expect_err("expected parse error");
        assert!(err.to_string().contains("CANARY_TYPE"));
    }

    #[test]
    fn spec_mirrors_canary_section() {
        let cfg = single("alice");
        let spec = cfg.canary.spec();
        assert_eq!(spec.feeding_interval, 86_400);
        assert!(spec.feeders.contains("alice"));
        assert_eq!(spec.canary_type, CanaryType::SingleFeeder);
    }

    #[test]
    fn load_parses_toml_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[canary]
name = "escrow"
feeding_interval_secs = 10
canary_type = "single_feeder"
feeders = ["alice"]

[canary.hook]
kind = "announce"
message = "release the keys"

[paths]
state_file = "/tmp/escrow-state.json"
"#,
        )
        .expect("write config");

        let cfg = Config::load(Some(&path)).expect("load config");
        assert_eq!(cfg.canary.name, "escrow");
        assert_eq!(cfg.canary.feeding_interval_secs, 10);
        assert_eq!(cfg.canary.hook.kind, HookKind::Announce);
        assert_eq!(cfg.canary.hook.message, "release the keys");
        assert_eq!(cfg.paths.config_file, path);
    }

    #[test]
    fn load_returns_error_for_explicit_missing_path() {
        let err = Config::load(Some(Path::new("/nonexistent/canary/config.toml")))
            .expect_err("expected missing config");
        assert_eq!(err.code(), "CNY-1002");
    }

    #[test]
    fn stable_hash_changes_when_config_changes() {
        let cfg = single("alice");
        let mut modified = single("alice");
        modified.canary.feeding_interval_secs += 1;
        assert_ne!(
            cfg.stable_hash().expect("hash"),
            modified.stable_hash().expect("hash")
        );
        assert_eq!(cfg.stable_hash().unwrap(), cfg.stable_hash().unwrap());
    }

    #[test]
    fn config_roundtrips_through_toml() {
        let cfg = single("alice");
        let raw = toml::to_string_pretty(&cfg).expect("serialize");
        let parsed: Config = toml::from_str(&raw).expect("parse");
        assert_eq!(parsed, cfg);
    }
}
