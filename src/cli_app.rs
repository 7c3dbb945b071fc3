//! Top-level CLI definition and dispatch.

use std::io::{self, IsTerminal, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, CommandFactory, Parser, Subcommand};
use clap_complete::{Shell as CompletionShell, generate};
use colored::{Colorize, control};
use serde_json::{Value, json};
use thiserror::Error;

use canary_switch::canary::facade::{Canary, CanarySpec, CanaryStatus, Response};
use canary_switch::canary::hook::DeathHook;
use canary_switch::canary::types::{Operation, Timestamp};
use canary_switch::core::clock::{Clock, ManualClock, SystemClock};
use canary_switch::core::config::Config;
use canary_switch::core::errors::CanaryError;
use canary_switch::core::state_store::StateStore;
use canary_switch::daemon::notifications::{EventSink, FanoutSink, HeldSink, NotificationManager};
use canary_switch::daemon::signals::{SignalHandler, WatchdogHeartbeat};
use canary_switch::daemon::watch::{self, WatchExit, WatchOptions};
use canary_switch::logger::jsonl::{
    ActivityLog, EventType, JsonlConfig, JsonlWriter, LogEntry, Severity,
};

/// Canary switch: a dead-man's switch that dies unless its feeders keep feeding it.
#[derive(Debug, Parser)]
#[command(
    name = "canary",
    author,
    version,
    about = "Canary liveness switch",
    long_about = None,
    arg_required_else_help = true
)]
pub struct Cli {
    /// Override config file path.
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Force JSON output mode.
    #[arg(long, global = true)]
    json: bool,
    /// Disable colored output.
    #[arg(long, global = true)]
    no_color: bool,
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// Hatch a new canary from the current configuration.
    Init(InitArgs),
    /// Feed the canary, renewing its interval. Feeders only.
    Feed(CallerArgs),
    /// Kill the canary immediately. Feeders only.
    Poison(CallerArgs),
    /// Check the canary, pronouncing it dead if its interval has lapsed.
    Touch(TouchArgs),
    /// Show the stored canary without changing it.
    Status,
    /// Inspect configuration.
    Config(ConfigArgs),
    /// Touch the canary periodically until it dies or the process is stopped.
    Watch(WatchArgs),
    /// Generate shell completions.
    Completions(CompletionsArgs),
}

#[derive(Debug, Clone, Args, Default)]
struct InitArgs {
    /// Replace an existing canary, dead or alive.
    #[arg(long)]
    force: bool,
}

#[derive(Debug, Clone, Args)]
struct CallerArgs {
    /// Identity to act as.
    #[arg(long = "as", value_name = "ID")]
    caller: String,
}

#[derive(Debug, Clone, Args)]
struct TouchArgs {
    /// Identity to act as. Anyone may touch.
    #[arg(long = "as", value_name = "ID", default_value = "anonymous")]
    caller: String,
}

#[derive(Debug, Clone, Args)]
struct ConfigArgs {
    #[command(subcommand)]
    command: Option<ConfigCommand>,
}

#[derive(Debug, Clone, Subcommand)]
enum ConfigCommand {
    /// Print config file path.
    Path,
    /// Print the effective configuration.
    Show,
    /// Validate configuration and print its fingerprint.
    Validate,
}

#[derive(Debug, Clone, Args)]
struct WatchArgs {
    /// Seconds between touches.
    #[arg(long, default_value_t = 60, value_name = "SECONDS")]
    poll_secs: u64,
    /// Identity the watcher touches as.
    #[arg(long = "as", value_name = "ID", default_value = "watch")]
    caller: String,
    /// Stop after this many touches.
    #[arg(long, value_name = "N")]
    max_polls: Option<u64>,
}

#[derive(Debug, Clone, Args)]
struct CompletionsArgs {
    /// Shell to generate completion script for.
    #[arg(value_enum)]
    shell: CompletionShell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputMode {
    Human,
    Json,
}

/// CLI error type with explicit exit-code mapping.
#[derive(Debug, Error)]
pub enum CliError {
    /// Bad input, or a call the canary refused.
    #[error("{0}")]
    User(String),
    /// Environment/runtime failure.
    #[error("{0}")]
    Runtime(String),
    /// Internal bug or invariant violation.
    #[error("{0}")]
    Internal(String),
    /// JSON serialization failed.
    #[error("failed to serialize output: {0}")]
    Json(#[from] serde_json::Error),
    /// Output write failed.
    #[error("failed to write output: {0}")]
    Io(#[from] io::Error),
}

impl CliError {
    /// Process exit code contract for the CLI.
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::User(_) => 1,
            Self::Runtime(_) | Self::Io(_) => 2,
            Self::Internal(_) | Self::Json(_) => 3,
        }
    }
}

impl From<CanaryError> for CliError {
    fn from(err: CanaryError) -> Self {
        match err {
            CanaryError::InvalidConfig { .. }
            | CanaryError::MissingConfig { .. }
            | CanaryError::ConfigParse { .. }
            | CanaryError::Construction { .. }
            | CanaryError::Unauthorized { .. }
            | CanaryError::AlreadyDead { .. }
            | CanaryError::Starved { .. }
            | CanaryError::ClockRegression { .. } => Self::User(err.to_string()),
            CanaryError::HookFailed { .. }
            | CanaryError::StateCorrupt { .. }
            | CanaryError::Io { .. }
            | CanaryError::Runtime { .. } => Self::Runtime(err.to_string()),
            CanaryError::Serialization { .. } => Self::Internal(err.to_string()),
        }
    }
}

/// Dispatch CLI commands.
pub fn run(cli: &Cli) -> Result<(), CliError> {
    if cli.no_color {
        control::set_override(false);
    }

    match &cli.command {
        Command::Init(args) => run_init(cli, args),
        Command::Feed(args) => run_operation(cli, Operation::Feed, &args.caller),
        Command::Poison(args) => run_operation(cli, Operation::Poison, &args.caller),
        Command::Touch(args) => run_operation(cli, Operation::Touch, &args.caller),
        Command::Status => run_status(cli),
        Command::Config(args) => run_config(cli, args),
        Command::Watch(args) => run_watch(cli, args),
        Command::Completions(args) => {
            let mut command = Cli::command();
            let binary_name = command.get_name().to_string();
            generate(args.shell, &mut command, binary_name, &mut io::stdout());
            Ok(())
        }
    }
}

// ──────────────────── session ────────────────────

/// Everything one invocation needs to load, drive, and save the canary.
struct Session {
    config: Config,
    spec: CanarySpec,
    store: StateStore,
    log: Arc<ActivityLog>,
    sink: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
}

impl Session {
    fn open(cli: &Cli) -> Result<Self, CliError> {
        let config = Config::load(cli.config.as_deref())?;
        let spec = config.canary.spec();
        let store = StateStore::new(config.paths.state_file.clone());

        let writer = if config.logging.enabled {
            JsonlWriter::open(JsonlConfig::from_config(&config.logging, &config.paths))
        } else {
            JsonlWriter::discard()
        };
        let log = Arc::new(ActivityLog::new(writer));
        let notifier = Arc::new(NotificationManager::from_config(&config.notifications));
        let sink: Arc<dyn EventSink> = Arc::new(
            FanoutSink::new()
                .with(notifier)
                .with(Arc::clone(&log) as Arc<dyn EventSink>),
        );

        Ok(Self {
            config,
            spec,
            store,
            log,
            sink,
            clock: clock_from_env()?,
        })
    }

    fn name(&self) -> &str {
        &self.spec.name
    }

    fn hook(&self) -> Result<DeathHook, CanaryError> {
        DeathHook::from_config(&self.config.canary.hook)
    }

    fn hatch(&self, force: bool) -> Result<CanaryStatus, CanaryError> {
        let _lock = self.store.lock()?;
        if self.store.exists() && !force {
            return Err(CanaryError::Construction {
                details: format!(
                    "a canary is already stored at {}; pass --force to replace it",
                    self.store.path().display()
                ),
            });
        }

        let canary = Canary::new(
            &self.spec,
            self.hook()?,
            Arc::clone(&self.clock),
            Arc::clone(&self.sink),
        )?;
        self.store.store(&self.spec, &canary.snapshot())?;

        let status = canary.query();
        let mut entry = LogEntry::new(EventType::Init, Severity::Info);
        entry.canary = Some(self.name().to_string());
        entry.ok = Some(true);
        entry.alive = Some(true);
        entry.time_last_fed = Some(status.time_last_fed);
        entry.details = Some(format!(
            "{} feeder(s), interval {}s, replaced={force}",
            self.spec.feeders.len(),
            self.spec.feeding_interval
        ));
        self.log.record(&entry);
        Ok(status)
    }

    /// Lock, load, dispatch, save, then announce and log.
    ///
    /// Death notices and the death hook wait until the new state is on disk. A
    /// failed save announces nothing, and the next call finds the canary as it
    /// was before.
    fn apply(&self, op: Operation, caller: &str) -> Result<Response, CanaryError> {
        let _lock = self.store.lock()?;
        let held = Arc::new(HeldSink::new());
        let canary = self
            .load(Arc::clone(&held) as Arc<dyn EventSink>)?
            .with_deferred_hook();
        let mut response = canary.dispatch(op, caller);
        if !op.is_mutating() {
            return Ok(response);
        }

        self.store.store(&self.spec, &canary.snapshot())?;
        let hook_ran = match canary.run_deferred_hook() {
            None => false,
            Some(Ok(())) => true,
            Some(Err(err)) => {
                response.record_hook_failure(&err);
                true
            }
        };
        held.release(self.sink.as_ref());
        self.log.record_response(self.name(), &response);
        self.log.flush();

        if hook_ran {
            // Hook bookkeeping only; the death itself is already durable.
            self.store.store(&self.spec, &canary.snapshot())?;
        }
        Ok(response)
    }

    fn load(&self, sink: Arc<dyn EventSink>) -> Result<Canary, CanaryError> {
        let snapshot = self
            .store
            .load(&self.spec)?
            .ok_or_else(|| CanaryError::Construction {
                details: format!(
                    "no canary stored at {}; run `canary init` first",
                    self.store.path().display()
                ),
            })?;
        Canary::restore(
            &self.spec,
            snapshot,
            self.hook()?,
            Arc::clone(&self.clock),
            sink,
        )
    }

    fn record_error(&self, err: &CanaryError) {
        self.log.record(&LogEntry::from_error(Some(self.name()), err));
        self.log.flush();
    }
}

/// `CANARY_NOW` pins the clock to a fixed unix time, for replay and testing.
fn clock_from_env() -> Result<Arc<dyn Clock>, CanaryError> {
    match std::env::var("CANARY_NOW") {
        Ok(raw) if !raw.trim().is_empty() => {
            let now = raw
                .trim()
                .parse::<u64>()
                .map_err(|e| CanaryError::ConfigParse {
                    context: "env",
                    details: format!("CANARY_NOW={raw:?}: {e}"),
                })?;
            Ok(Arc::new(ManualClock::new(now)))
        }
        _ => Ok(Arc::new(SystemClock)),
    }
}

// ──────────────────── commands ────────────────────

fn run_init(cli: &Cli, args: &InitArgs) -> Result<(), CliError> {
    let session = Session::open(cli)?;
    let status = session.hatch(args.force).inspect_err(|e| session.record_error(e))?;

    match output_mode(cli) {
        OutputMode::Human => {
            println!(
                "{} canary {} hatched at {}",
                "✓".green(),
                status.name.bold(),
                format_ts(status.time_last_fed)
            );
            print_status_human(&status, &session.spec, session.clock.now());
        }
        OutputMode::Json => {
            let payload = json!({
                "command": "init",
                "state_file": session.store.path().to_string_lossy(),
                "status": serde_json::to_value(&status)?,
            });
            write_json_line(&payload)?;
        }
    }
    Ok(())
}

fn run_operation(cli: &Cli, op: Operation, caller: &str) -> Result<(), CliError> {
    let session = Session::open(cli)?;
    let response = session
        .apply(op, caller)
        .inspect_err(|e| session.record_error(e))?;

    match output_mode(cli) {
        OutputMode::Human => print_response_human(&response),
        OutputMode::Json => {
            let mut payload = serde_json::to_value(&response)?;
            if let Value::Object(map) = &mut payload {
                map.insert("command".to_string(), json!(op.to_string()));
            }
            write_json_line(&payload)?;
        }
    }

    if response.ok {
        Ok(())
    } else {
        Err(CliError::User(
            response
                .reason
                .unwrap_or_else(|| format!("{op} rejected")),
        ))
    }
}

fn run_status(cli: &Cli) -> Result<(), CliError> {
    let session = Session::open(cli)?;
    let response = session.apply(Operation::Query, "status")?;
    let now = session.clock.now();
    let lapsed = response.status.feed_deadline.is_some_and(|d| now > d);

    match output_mode(cli) {
        OutputMode::Human => print_status_human(&response.status, &session.spec, now),
        OutputMode::Json => {
            let payload = json!({
                "command": "status",
                "now": now,
                "lapsed": lapsed,
                "feeders": session.spec.feeders,
                "status": serde_json::to_value(&response.status)?,
            });
            write_json_line(&payload)?;
        }
    }
    Ok(())
}

fn run_config(cli: &Cli, args: &ConfigArgs) -> Result<(), CliError> {
    match &args.command {
        None | Some(ConfigCommand::Path) => {
            let path = cli.config.clone().unwrap_or_else(Config::default_path);
            let exists = path.exists();

            match output_mode(cli) {
                OutputMode::Human => {
                    println!("{}", path.display());
                    if !exists {
                        println!("  (file does not exist; defaults will be used)");
                    }
                }
                OutputMode::Json => {
                    let payload = json!({
                        "command": "config path",
                        "path": path.to_string_lossy(),
                        "exists": exists,
                    });
                    write_json_line(&payload)?;
                }
            }
            Ok(())
        }
        Some(ConfigCommand::Show) => {
            let config = Config::load(cli.config.as_deref())?;

            match output_mode(cli) {
                OutputMode::Human => {
                    let toml_str = toml::to_string_pretty(&config)
                        .map_err(|e| CliError::Internal(format!("serialize config: {e}")))?;
                    println!("{toml_str}");
                }
                OutputMode::Json => {
                    let payload = json!({
                        "command": "config show",
                        "config": serde_json::to_value(&config)?,
                    });
                    write_json_line(&payload)?;
                }
            }
            Ok(())
        }
        Some(ConfigCommand::Validate) => match Config::load(cli.config.as_deref()) {
            Ok(config) => {
                let hash = config.stable_hash()?;

                match output_mode(cli) {
                    OutputMode::Human => {
                        println!("Configuration is valid.");
                        println!("  Source: {}", config.paths.config_file.display());
                        println!("  Hash: {hash}");
                    }
                    OutputMode::Json => {
                        let payload = json!({
                            "command": "config validate",
                            "valid": true,
                            "path": config.paths.config_file.to_string_lossy(),
                            "hash": hash,
                        });
                        write_json_line(&payload)?;
                    }
                }
                Ok(())
            }
            Err(e) => {
                match output_mode(cli) {
                    OutputMode::Human => {
                        eprintln!("Configuration is INVALID: {e}");
                    }
                    OutputMode::Json => {
                        let payload = json!({
                            "command": "config validate",
                            "valid": false,
                            "error_code": e.code(),
                            "error": e.to_string(),
                        });
                        write_json_line(&payload)?;
                    }
                }
                Err(CliError::User(format!("invalid config: {e}")))
            }
        },
    }
}

fn run_watch(cli: &Cli, args: &WatchArgs) -> Result<(), CliError> {
    if args.poll_secs == 0 {
        return Err(CliError::User("--poll-secs must be > 0".to_string()));
    }

    let session = Session::open(cli)?;
    let mode = output_mode(cli);
    let options = WatchOptions {
        poll_interval: Duration::from_secs(args.poll_secs),
        max_polls: args.max_polls,
    };
    let signals = SignalHandler::new();
    let mut heartbeat = WatchdogHeartbeat::from_env();

    let mut start = LogEntry::new(EventType::WatchStart, Severity::Info);
    start.canary = Some(session.name().to_string());
    start.caller = Some(args.caller.clone());
    start.details = Some(format!("poll every {}s", args.poll_secs));
    session.log.record(&start);
    eprintln!(
        "[CNY-WATCH] watching {} every {}s as {}",
        session.name(),
        args.poll_secs,
        args.caller
    );

    let report = watch::run(
        || {
            session.log.try_recover();
            let response = session.apply(Operation::Touch, &args.caller)?;
            if mode == OutputMode::Json {
                let mut payload = serde_json::to_value(&response)?;
                if let Value::Object(map) = &mut payload {
                    map.insert("command".to_string(), json!("watch"));
                }
                write_json_line(&payload).map_err(|e| CanaryError::Runtime {
                    details: e.to_string(),
                })?;
            }
            Ok(response)
        },
        &options,
        &signals,
        &mut heartbeat,
    )
    .inspect_err(|e| session.record_error(e))?;

    let exit_label = match report.exit {
        WatchExit::Died { by_watch: true } => "canary died during watch",
        WatchExit::Died { by_watch: false } => "canary was already dead",
        WatchExit::Shutdown => "shutdown requested",
        WatchExit::PollLimit => "poll limit reached",
    };
    let mut stop = LogEntry::new(EventType::WatchStop, Severity::Info);
    stop.canary = Some(session.name().to_string());
    stop.alive = report.last_status.as_ref().map(|s| s.alive);
    stop.details = Some(format!("{exit_label} after {} polls", report.polls));
    session.log.record(&stop);
    session.log.flush();

    match mode {
        OutputMode::Human => {
            println!("{exit_label} after {} polls", report.polls);
            if let Some(status) = &report.last_status {
                print_status_human(status, &session.spec, session.clock.now());
            }
        }
        OutputMode::Json => {
            let payload = json!({
                "command": "watch",
                "exit": exit_label,
                "polls": report.polls,
                "status": report.last_status,
            });
            write_json_line(&payload)?;
        }
    }
    Ok(())
}

// ──────────────────── output ────────────────────

fn print_response_human(response: &Response) {
    let status = &response.status;
    if !response.ok {
        let reason = response.reason.as_deref().unwrap_or("rejected");
        eprintln!(
            "{} {} by {} refused: {}",
            "✗".red(),
            response.operation,
            response.caller,
            reason
        );
        if response.died {
            eprintln!(
                "  {} canary {} died at {}",
                "†".red(),
                status.name,
                format_ts(status.death_timestamp)
            );
        }
        return;
    }

    match response.operation {
        Operation::Feed => {
            let deadline = status
                .feed_deadline
                .map_or_else(|| "-".to_string(), format_ts);
            println!(
                "{} {} fed by {}; next feeding due by {}",
                "✓".green(),
                status.name.bold(),
                response.caller,
                deadline
            );
        }
        Operation::Poison => {
            println!(
                "{} {} poisoned by {} at {}",
                "†".red(),
                status.name.bold(),
                response.caller,
                format_ts(status.death_timestamp)
            );
        }
        Operation::Touch | Operation::Query => {
            if response.alive {
                println!("{} {} is alive", "✓".green(), status.name.bold());
            } else if response.died {
                println!(
                    "{} {} starved; pronounced dead at {}",
                    "†".red(),
                    status.name.bold(),
                    format_ts(status.death_timestamp)
                );
            } else {
                println!(
                    "{} {} has been dead since {}",
                    "†".red(),
                    status.name.bold(),
                    format_ts(status.death_timestamp)
                );
            }
        }
    }
}

fn print_status_human(status: &CanaryStatus, spec: &CanarySpec, now: Timestamp) {
    let state = if status.alive {
        "ALIVE".green().bold()
    } else {
        "DEAD".red().bold()
    };
    println!(
        "canary {} ({}, hook: {})",
        status.name.bold(),
        status.canary_type,
        status.hook
    );
    println!("  state:    {state}");
    println!("  last fed: {}", format_ts(status.time_last_fed));
    println!("  interval: {}s", status.feeding_interval);
    if let Some(deadline) = status.feed_deadline {
        if now > deadline {
            println!(
                "  deadline: {} {}",
                format_ts(deadline),
                "(lapsed; dies on next touch or feed)".yellow()
            );
        } else {
            println!("  deadline: {}", format_ts(deadline));
        }
    }
    if let Some(death) = status.death {
        println!("  died:     {} (by {})", format_ts(death.timestamp), death.trigger);
    }
    let feeders: Vec<&str> = spec.feeders.iter().map(String::as_str).collect();
    println!("  feeders:  {}", feeders.join(", "));
}

fn format_ts(ts: Timestamp) -> String {
    i64::try_from(ts)
        .ok()
        .and_then(|secs| chrono::DateTime::from_timestamp(secs, 0))
        .map_or_else(|| ts.to_string(), |dt| dt.to_rfc3339())
}

fn write_json_line(payload: &Value) -> Result<(), CliError> {
    let mut stdout = io::stdout().lock();
    serde_json::to_writer(&mut stdout, payload)?;
    writeln!(stdout)?;
    Ok(())
}

fn output_mode(cli: &Cli) -> OutputMode {
    let env_mode = std::env::var("CANARY_OUTPUT_FORMAT").ok();
    resolve_output_mode(cli.json, env_mode.as_deref(), io::stdout().is_terminal())
}

fn resolve_output_mode(json_flag: bool, env_mode: Option<&str>, stdout_is_tty: bool) -> OutputMode {
    if json_flag {
        return OutputMode::Json;
    }

    let fallback = if stdout_is_tty {
        OutputMode::Human
    } else {
        OutputMode::Json
    };

    match env_mode
        .map(str::trim)
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("json") => OutputMode::Json,
        Some("human") => OutputMode::Human,
        _ => fallback,
    }
}
