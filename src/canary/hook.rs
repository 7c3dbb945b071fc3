//! On-death extension point: a hook invoked exactly once when a canary dies.
//!
//! Hooks run synchronously inside the call that commits the death, after the
//! core death notice has gone out. A failing hook never resurrects the canary:
//! the death stays committed and the failure is reported separately.

use std::process::Command;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::canary::types::{Death, Timestamp};
use crate::core::errors::{CanaryError, Result};

/// What a death hook gets to see.
#[derive(Debug, Clone, Copy)]
pub struct DeathContext<'a> {
    pub canary: &'a str,
    pub death: Death,
}

/// A custom on-death action.
///
/// Messages pushed into `notices` are emitted as hook notifications after the
/// core death notice, in push order. Private state returned by
/// [`DeathAction::private_state`] is persisted alongside the canary.
pub trait DeathAction: Send {
    fn name(&self) -> &str;

    fn on_death(&mut self, ctx: &DeathContext<'_>, notices: &mut Vec<String>) -> Result<()>;

    fn private_state(&self) -> Option<Value> {
        None
    }

    fn restore_state(&mut self, state: Value) -> Result<()> {
        let _ = state;
        Ok(())
    }
}

/// The hook attached to a canary.
#[derive(Default)]
pub enum DeathHook {
    #[default]
    NoOp,
    Custom(Box<dyn DeathAction>),
}

/// What happened when the hook ran.
#[derive(Debug, Default)]
pub struct HookReport {
    pub notices: Vec<String>,
    pub failure: Option<String>,
}

impl DeathHook {
    pub fn custom(action: impl DeathAction + 'static) -> Self {
        Self::Custom(Box::new(action))
    }

    /// Build the hook described by configuration.
    pub fn from_config(config: &HookConfig) -> Result<Self> {
        match config.kind {
            HookKind::None => Ok(Self::NoOp),
            HookKind::Announce => Ok(Self::custom(AnnounceAction::new(config.message.clone()))),
            HookKind::Command => {
                let (program, args) =
                    config
                        .command
                        .split_first()
                        .ok_or_else(|| CanaryError::InvalidConfig {
                            details: "canary.hook.command must not be empty for kind=command"
                                .to_string(),
                        })?;
                Ok(Self::custom(CommandAction::new(program.clone(), args.to_vec())))
            }
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::NoOp => "none",
            Self::Custom(action) => action.name(),
        }
    }

    /// Run the hook for `ctx`. Failures are captured, not propagated.
    pub(crate) fn invoke(&mut self, ctx: &DeathContext<'_>) -> HookReport {
        let Self::Custom(action) = self else {
            return HookReport::default();
        };

        let mut report = HookReport::default();
        if let Err(err) = action.on_death(ctx, &mut report.notices) {
            report.failure = Some(err.to_string());
        }
        report
    }

    #[must_use]
    pub fn private_state(&self) -> Option<Value> {
        match self {
            Self::NoOp => None,
            Self::Custom(action) => action.private_state(),
        }
    }

    pub fn restore_state(&mut self, state: Value) -> Result<()> {
        match self {
            Self::NoOp => Ok(()),
            Self::Custom(action) => action.restore_state(state),
        }
    }
}

impl std::fmt::Debug for DeathHook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoOp => write!(f, "DeathHook::NoOp"),
            Self::Custom(action) => write!(f, "DeathHook::Custom({})", action.name()),
        }
    }
}

// ──────────────────── configuration ────────────────────

/// Which built-in hook to attach.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HookKind {
    #[default]
    None,
    /// Raise a notice of its own after the death notice.
    Announce,
    /// Run an external program.
    Command,
}

impl HookKind {
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "none" | "noop" => Some(Self::None),
            "announce" => Some(Self::Announce),
            "command" => Some(Self::Command),
            _ => None,
        }
    }
}

/// `[canary.hook]` section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HookConfig {
    pub kind: HookKind,
    /// Message raised by the `announce` hook.
    pub message: String,
    /// Program and arguments for the `command` hook.
    pub command: Vec<String>,
}

impl Default for HookConfig {
    fn default() -> Self {
        Self {
            kind: HookKind::None,
            message: "I am dead".to_string(),
            command: Vec::new(),
        }
    }
}

// ──────────────────── built-in actions ────────────────────

/// Raises a fixed message when the canary dies.
#[derive(Debug, Clone)]
pub struct AnnounceAction {
    message: String,
    announced_at: Option<Timestamp>,
}

impl AnnounceAction {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            announced_at: None,
        }
    }

    #[must_use]
    pub const fn announced_at(&self) -> Option<Timestamp> {
        self.announced_at
    }
}

impl DeathAction for AnnounceAction {
    fn name(&self) -> &str {
        "announce"
    }

    fn on_death(&mut self, ctx: &DeathContext<'_>, notices: &mut Vec<String>) -> Result<()> {
        self.announced_at = Some(ctx.death.timestamp);
        notices.push(self.message.clone());
        Ok(())
    }

    fn private_state(&self) -> Option<Value> {
        Some(json!({ "announced_at": self.announced_at }))
    }

    fn restore_state(&mut self, state: Value) -> Result<()> {
        self.announced_at = state.get("announced_at").and_then(Value::as_u64);
        Ok(())
    }
}

/// Runs an external program with the death described in its environment.
#[derive(Debug, Clone)]
pub struct CommandAction {
    program: String,
    args: Vec<String>,
    exit_code: Option<i32>,
}

impl CommandAction {
    #[must_use]
    pub fn new(program: String, args: Vec<String>) -> Self {
        Self {
            program,
            args,
            exit_code: None,
        }
    }
}

impl DeathAction for CommandAction {
    fn name(&self) -> &str {
        "command"
    }

    fn on_death(&mut self, ctx: &DeathContext<'_>, _notices: &mut Vec<String>) -> Result<()> {
        let status = Command::new(&self.program)
            .args(&self.args)
            .env("CANARY_NAME", ctx.canary)
            .env("CANARY_DEATH_TIMESTAMP", ctx.death.timestamp.to_string())
            .env("CANARY_DEATH_TRIGGER", ctx.death.trigger.to_string())
            .status()
            .map_err(|e| CanaryError::Runtime {
                details: format!("failed to spawn {}: {e}", self.program),
            })?;

        self.exit_code = status.code();
        if status.success() {
            Ok(())
        } else {
            Err(CanaryError::Runtime {
                details: format!("{} exited with {status}", self.program),
            })
        }
    }

    fn private_state(&self) -> Option<Value> {
        Some(json!({ "exit_code": self.exit_code }))
    }

    fn restore_state(&mut self, state: Value) -> Result<()> {
        self.exit_code = state
            .get("exit_code")
            .and_then(Value::as_i64)
            .and_then(|c| i32::try_from(c).ok());
        Ok(())
    }
}
