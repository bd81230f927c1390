//! batchflow CLI - run simulated batch workloads through the orchestrator

use anyhow::{Context, Result};
use batchflow_core::Config;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

mod commands;
mod logging;

use commands::{RunArgs, cmd_config_init, cmd_config_path, cmd_config_show, cmd_run};
use logging::init_logging;

#[derive(Parser)]
#[command(name = "batchflow")]
#[command(about = "Admission-controlled batch dispatch with timeouts and retries")]
#[command(after_help = "\
QUICK START:
  batchflow run --items 1000            # Run a simulated workload
  batchflow run --fail-every 7 --json   # Inject failures, print JSON summary
  batchflow config init                 # Create .batchflow/config.toml")]
struct Cli {
  /// Config file to use instead of the project or user config
  #[arg(long, global = true, value_name = "PATH")]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Commands,
}

/// Subcommands for `batchflow config`
#[derive(Subcommand)]
pub enum ConfigCommand {
  /// Show the effective configuration
  Show,
  /// Create a project config file with defaults
  Init {
    /// Overwrite an existing file
    #[arg(long)]
    force: bool,
  },
  /// Print the config file locations that are searched
  Path,
}

#[derive(Subcommand)]
enum Commands {
  /// Run a simulated workload through the orchestrator
  Run(RunArgs),
  /// Configuration management
  Config {
    #[command(subcommand)]
    command: ConfigCommand,
  },
}

/// Resolve the effective config: explicit path, then project, then user, then defaults
fn load_config(explicit: Option<&Path>) -> Result<Config> {
  match explicit {
    Some(path) => Config::load_from_path(path).with_context(|| format!("Failed to load config from {:?}", path)),
    None => {
      let cwd = std::env::current_dir().context("Failed to read current directory")?;
      Ok(Config::load_for_project(&cwd))
    }
  }
}

#[tokio::main]
async fn main() -> Result<()> {
  let cli = Cli::parse();
  let config = load_config(cli.config.as_deref())?;

  // Keep the guard alive so buffered file logs are flushed on exit
  let _guard = init_logging(&config.logging);

  match cli.command {
    Commands::Run(args) => cmd_run(config, args).await,
    Commands::Config { command } => match command {
      ConfigCommand::Show => cmd_config_show(&config, cli.config.as_deref()),
      ConfigCommand::Init { force } => cmd_config_init(force),
      ConfigCommand::Path => cmd_config_path(),
    },
  }
}
