use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use testuniverse::config::ENV_LOG_LEVEL;
use testuniverse::error::classify;

mod cli;

#[derive(Parser)]
#[command(name = "aiciv")]
#[command(about = "TestUniverse kernel - governed, sandboxed test orchestration with quality gates")]
#[command(version)]
struct Cli {
    /// Kernel settings file (defaults to ./aiciv.toml, then ~/.testuniverse/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a test plan against an authorized target
    Run(cli::run::RunArgs),

    /// Inspect installed plugins and validate plugin manifests
    Plugins {
        #[command(subcommand)]
        command: cli::plugins::PluginsCommand,
    },

    /// Print records from a run's audit log
    Logs {
        /// Path to an audit.jsonl file
        path: PathBuf,

        /// Minimum level (debug, info, warn, error, critical)
        #[arg(long)]
        level: Option<String>,

        /// Only show this event
        #[arg(long)]
        event: Option<String>,

        /// Print raw JSON lines
        #[arg(long)]
        json: bool,
    },

    /// Validate findings against the universal Finding schema
    Validate {
        /// JSON file holding one finding, an array, or {"findings": [...]}
        path: PathBuf,
    },
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .ok()
        .or_else(|| {
            std::env::var(ENV_LOG_LEVEL)
                .ok()
                .filter(|v| !v.trim().is_empty())
                .and_then(|v| EnvFilter::try_new(v).ok())
        })
        .unwrap_or_else(|| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn dispatch(cli: Cli) -> Result<i32> {
    let config = cli.config.as_deref();
    match cli.command {
        Commands::Run(args) => cli::run::run_command(args, config).await,
        Commands::Plugins { command } => cli::plugins::plugins_command(command, config),
        Commands::Logs {
            path,
            level,
            event,
            json,
        } => cli::logs::logs_command(&path, level.as_deref(), event, json),
        Commands::Validate { path } => cli::validate::validate_command(&path),
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let code = match dispatch(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            classify(&e).code()
        }
    };
    std::process::exit(code);
}
