//! Top-level CLI definition and dispatch.

use std::io::{self, IsTerminal, Write};
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use serde_json::{Value, json};
use thiserror::Error;

use gridguard::core::config::Config;
use gridguard::core::errors::GridError;
use gridguard::daemon::loop_main::NodeDaemon;
use gridguard::daemon::signals::SignalHandler;

/// gridguard: memory-pressure monitor and admission control for a grid member.
#[derive(Debug, Parser)]
#[command(
    name = "gridguard",
    author,
    version,
    about = "Memory-pressure monitor and cluster admission control",
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
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// Run one member until SIGINT/SIGTERM. SIGHUP reloads thresholds.
    Run(RunArgs),
    /// Load and validate configuration, then print it with its hash.
    CheckConfig,
    /// Show version.
    Version,
}

#[derive(Debug, Clone, Args, Default)]
struct RunArgs {
    /// Member identity; overrides config and GRIDGUARD_MEMBER_ID.
    #[arg(long, value_name = "ID")]
    member_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputMode {
    Human,
    Json,
}

/// CLI error type with explicit exit-code mapping.
#[derive(Debug, Error)]
pub enum CliError {
    /// Configuration rejected.
    #[error("{0}")]
    Config(GridError),
    /// Environment/runtime failure.
    #[error("{0}")]
    Runtime(GridError),
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
            Self::Config(_) => 1,
            Self::Runtime(_) | Self::Io(_) => 2,
            Self::Json(_) => 3,
        }
    }
}

impl From<GridError> for CliError {
    fn from(err: GridError) -> Self {
        match err {
            GridError::InvalidConfig { .. }
            | GridError::MissingConfig { .. }
            | GridError::ConfigParse { .. } => Self::Config(err),
            other => Self::Runtime(other),
        }
    }
}

pub fn run(cli: &Cli) -> Result<(), CliError> {
    match &cli.command {
        Command::Run(args) => run_member(cli, args),
        Command::CheckConfig => check_config(cli),
        Command::Version => emit_version(cli),
    }
}

fn run_member(cli: &Cli, args: &RunArgs) -> Result<(), CliError> {
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(id) = &args.member_id {
        config.member.id = Some(id.clone());
    }
    let daemon = NodeDaemon::init(config, SignalHandler::new())?;
    daemon.run()?;
    Ok(())
}

fn check_config(cli: &Cli) -> Result<(), CliError> {
    let config = Config::load(cli.config.as_deref())?;
    let hash = config.stable_hash()?;
    let source = config
        .source_path
        .as_ref()
        .map_or_else(|| "(defaults)".to_string(), |p| p.display().to_string());

    match output_mode(cli) {
        OutputMode::Human => {
            println!("Configuration is valid.");
            println!("  Source: {source}");
            println!("  Member: {}", config.member_id());
            println!("  Hash: {hash}");
            println!();
            println!("{}", config.to_toml_string()?);
        }
        OutputMode::Json => {
            let payload = json!({
                "command": "check-config",
                "valid": true,
                "source": source,
                "member": config.member_id().to_string(),
                "hash": hash,
                "config": serde_json::to_value(&config)?,
            });
            write_json_line(&payload)?;
        }
    }
    Ok(())
}

fn emit_version(cli: &Cli) -> Result<(), CliError> {
    let version = env!("CARGO_PKG_VERSION");
    match output_mode(cli) {
        OutputMode::Human => println!("gridguard {version}"),
        OutputMode::Json => write_json_line(&json!({
            "binary": "gridguard",
            "version": version,
            "package": env!("CARGO_PKG_NAME"),
        }))?,
    }
    Ok(())
}

fn write_json_line(payload: &Value) -> Result<(), CliError> {
    let mut stdout = io::stdout().lock();
    serde_json::to_writer(&mut stdout, payload)?;
    writeln!(stdout)?;
    Ok(())
}

fn output_mode(cli: &Cli) -> OutputMode {
    let env_mode = std::env::var("GRIDGUARD_OUTPUT_FORMAT").ok();
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
