//! chronos: named timing measures from the command line
//!
//! Times child processes and replays recorded measure actions, delivering
//! each completed measure as a JSON line.

mod config;

use std::fs::OpenOptions;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Duration;

use anyhow::{Context, Result};
use chronos::{
    Action, ActionDispatcher, Chronos, ChronosBuilder, InlineIdleScheduler, JsonLinesSink,
    LocalIdleScheduler, Metadata, SharedIdleScheduler,
};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing::info;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use config::Config;

/// Named timing measures with idle-time delivery
///
/// Records are written to stdout as JSON lines unless `[output] path` is set.
#[derive(Parser)]
#[command(name = "chronos")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to .chronos directory (default: search for .chronos/config.toml)
    #[arg(long, global = true, env = "CHRONOS_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a new .chronos directory with config file
    Init {
        /// Force overwrite existing config
        #[arg(long)]
        force: bool,
    },

    /// Run a command and record its wall time as a measure
    Exec {
        /// Measure name (default: the program name)
        #[arg(long)]
        name: Option<String>,

        /// Target duration in milliseconds
        #[arg(long)]
        target: Option<f64>,

        /// Metadata entry as key=value; JSON values are parsed, anything else is a string
        #[arg(long = "meta", value_name = "KEY=VALUE")]
        meta: Vec<String>,

        /// Command and arguments to run
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },

    /// Dispatch JSON-lines measure actions from a file and flush the results
    Replay {
        /// File with one action per line
        file: PathBuf,

        /// Idle slice budget in milliseconds
        #[arg(long, default_value = "50", value_parser = clap::value_parser!(u64).range(1..))]
        budget_ms: u64,
    },
}

fn env_filter(verbose: bool) -> EnvFilter {
    if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    }
}

/// Initialize logging to stderr, keeping stdout for records.
fn init_logging(verbose: bool) {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(env_filter(verbose))
        .init();
}

/// Initialize logging to daily-rotated files in the configured log directory.
fn init_file_logging(logs_dir: &Path, verbose: bool) {
    if let Err(e) = std::fs::create_dir_all(logs_dir) {
        eprintln!("Warning: Failed to create logs directory: {}", e);
        init_logging(verbose);
        return;
    }

    let file_appender = RollingFileAppender::new(Rotation::DAILY, logs_dir, "chronos.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    // Dropping the guard stops the writer thread
    static GUARD: std::sync::OnceLock<tracing_appender::non_blocking::WorkerGuard> =
        std::sync::OnceLock::new();
    let _ = GUARD.set(guard);

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
        .with(env_filter(verbose))
        .init();
}

/// Load config from an explicit path or auto-discover `.chronos/config.toml`.
///
/// Returns the config and the `.chronos` directory, if one was found.
fn load_config(override_path: Option<&PathBuf>) -> Result<(Config, Option<PathBuf>)> {
    if let Some(path) = override_path {
        // Explicit override: a .chronos directory or a config file
        let config_file = if path.is_dir() {
            path.join(config::CONFIG_FILE)
        } else {
            path.clone()
        };
        let chronos_dir = config_file.parent().unwrap_or(path).to_path_buf();
        let config = Config::from_file(&config_file)?;
        return Ok((config, Some(chronos_dir)));
    }

    match Config::find_and_load()? {
        Some((config, chronos_dir)) => Ok((config, Some(chronos_dir))),
        None => Ok((Config::default(), None)),
    }
}

/// Parse `key=value` pairs into measure metadata.
fn parse_meta(entries: &[String]) -> Result<Metadata> {
    let mut metadata = Metadata::new();
    for entry in entries {
        let (key, raw) = entry
            .split_once('=')
            .with_context(|| format!("Invalid metadata '{}', expected KEY=VALUE", entry))?;
        if key.is_empty() {
            anyhow::bail!("Invalid metadata '{}', key cannot be empty", entry);
        }
        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        metadata.insert(key.to_string(), value);
    }
    Ok(metadata)
}

/// Default measure name for a command: its program file name.
fn program_name(program: &str) -> String {
    Path::new(program)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| program.to_string())
}

/// Build an instance writing records to the configured output.
fn build_chronos(
    config: &Config,
    chronos_dir: Option<&Path>,
    scheduler: SharedIdleScheduler,
) -> Result<Chronos> {
    let builder = ChronosBuilder::new(config.chronos.clone()).with_scheduler(scheduler);
    let builder = match config.resolve_output_path(chronos_dir) {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .with_context(|| format!("Failed to open output file: {}", path.display()))?;
            info!("Writing records to {}", path.display());
            builder.with_sink(JsonLinesSink::new(file))
        }
        None => builder.with_sink(JsonLinesSink::stdout()),
    };
    Ok(builder.build())
}

/// Time a child process. Returns the child's exit code.
async fn run_exec(
    chronos: &Chronos,
    name: Option<String>,
    target: Option<f64>,
    meta: &[String],
    command: &[String],
) -> Result<i32> {
    let Some((program, args)) = command.split_first() else {
        anyhow::bail!("No command given");
    };
    let name = name.unwrap_or_else(|| program_name(program));

    let mut metadata = parse_meta(meta)?;
    metadata
        .entry("command")
        .or_insert_with(|| Value::String(command.join(" ")));

    let started = match target {
        Some(target) => chronos.start_with_target(&name, target, Some(metadata)),
        None => chronos.start(&name, Some(metadata)),
    };
    if !started {
        tracing::warn!(measure = %name, "Clock unavailable, running without a measure");
    }

    let status = tokio::process::Command::new(program)
        .args(args)
        .status()
        .await
        .with_context(|| format!("Failed to run {}", program))?;

    if started && chronos.stop(&name) {
        chronos.save_to_store()?;
    }
    tracing::debug!(measure = %name, %status, "Command finished");

    Ok(status.code().unwrap_or(1))
}

/// Counts from a replay run.
#[derive(Debug, Default, PartialEq)]
struct ReplayStats {
    applied: usize,
    skipped: usize,
}

/// Dispatch every action in `reader`, in order.
fn dispatch_actions(dispatcher: &ActionDispatcher, reader: impl BufRead) -> Result<ReplayStats> {
    let mut stats = ReplayStats::default();
    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let action: Action = serde_json::from_str(&line)
            .with_context(|| format!("Invalid action on line {}", index + 1))?;
        if dispatcher.dispatch(&action) {
            stats.applied += 1;
        } else {
            tracing::debug!(line = index + 1, action = ?action.action_type(), "Action skipped");
            stats.skipped += 1;
        }
    }
    Ok(stats)
}

/// Replay actions from a file and wait for the idle flush to finish.
///
/// Must run inside a `LocalSet`.
async fn run_replay(chronos: Chronos, file: &Path) -> Result<ReplayStats> {
    let reader = BufReader::new(
        std::fs::File::open(file)
            .with_context(|| format!("Failed to open actions file: {}", file.display()))?,
    );
    let dispatcher = ActionDispatcher::new(chronos.clone())?;
    let stats = dispatch_actions(&dispatcher, reader)?;

    chronos.save_to_store()?;
    while chronos.is_flush_scheduled() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    let remaining = chronos.pending_count();
    if remaining > 0 {
        tracing::warn!(remaining, "Flush stopped with measures still queued");
    }
    Ok(stats)
}

fn init_chronos_dir(force: bool) -> Result<()> {
    use config::{CHRONOS_DIR, CONFIG_FILE, DEFAULT_CONFIG};

    let chronos_dir = PathBuf::from(CHRONOS_DIR);
    let config_path = chronos_dir.join(CONFIG_FILE);

    if config_path.exists() && !force {
        anyhow::bail!(".chronos/config.toml already exists. Use --force to overwrite.");
    }

    if !chronos_dir.exists() {
        std::fs::create_dir_all(&chronos_dir)?;
        info!("Created {}/", chronos_dir.display());
    }

    std::fs::write(&config_path, DEFAULT_CONFIG)?;
    info!("Created {}", config_path.display());
    Ok(())
}

/// Load and validate config, then install logging as it directs.
fn prepare(cli_config: Option<&PathBuf>, verbose: bool) -> Result<(Config, Option<PathBuf>)> {
    let (config, chronos_dir) = load_config(cli_config)?;
    if config.logging.to_file {
        init_file_logging(&config.resolve_log_dir(chronos_dir.as_deref()), verbose);
    } else {
        init_logging(verbose);
    }
    match &chronos_dir {
        Some(dir) => info!("Found config at {}", dir.display()),
        None => tracing::debug!("No .chronos/config.toml found, using defaults"),
    }

    let errors = config.validate();
    if !errors.is_empty() {
        for error in &errors {
            tracing::error!("{}", error);
        }
        anyhow::bail!("Invalid configuration ({} errors)", errors.len());
    }
    Ok((config, chronos_dir))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        // Does not read the existing config, which --force may be replacing
        Commands::Init { force } => {
            init_logging(cli.verbose);
            init_chronos_dir(force)?;
        }

        Commands::Exec {
            name,
            target,
            meta,
            command,
        } => {
            let (config, chronos_dir) = prepare(cli.config.as_ref(), cli.verbose)?;
            let chronos = build_chronos(
                &config,
                chronos_dir.as_deref(),
                Rc::new(InlineIdleScheduler::unbounded()),
            )?;
            let code = run_exec(&chronos, name, target, &meta, &command).await?;
            if code != 0 {
                std::process::exit(code);
            }
        }

        Commands::Replay { file, budget_ms } => {
            let (config, chronos_dir) = prepare(cli.config.as_ref(), cli.verbose)?;
            let scheduler =
                LocalIdleScheduler::new().with_budget(Duration::from_millis(budget_ms));
            let chronos = build_chronos(&config, chronos_dir.as_deref(), Rc::new(scheduler))?;
            let local = tokio::task::LocalSet::new();
            let stats = local.run_until(run_replay(chronos, &file)).await?;
            info!(
                applied = stats.applied,
                skipped = stats.skipped,
                "Replay finished"
            );
        }
    }

    Ok(())
}
