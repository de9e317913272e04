//! # Stagegate CLI Module
//!
//! This module implements the CLI interface for stagegate.
//!
//! ## Available Commands
//!
//! - `serve` - Run the coordinator (the persistent worker)
//! - `start <stage>` - Shim: request a stage and exit with its status
//! - `stages` - List the stage registry
//! - `status` - Show which gate endpoints are live

mod commands;

use crate::config::Config;
use clap::{Parser, Subcommand};
use stagegate_core::{GateError, Stage};
use std::path::PathBuf;

pub use commands::*;

// =============================================================================
// CLI STRUCTURE
// =============================================================================

/// Stagegate - boot stage gate
///
/// One coordinator runs every boot stage; the supervisor runs one
/// `stagegate start <stage>` per stage and waits for it to exit.
#[derive(Parser, Debug)]
#[command(name = "stagegate")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to the configuration file
    #[arg(short = 'c', long, global = true)]
    pub config: Option<PathBuf>,

    /// Directory holding the gate sockets (overrides config and environment)
    #[arg(long, global = true)]
    pub run_dir: Option<PathBuf>,

    /// Output in JSON format (for programmatic access)
    #[arg(long, global = true)]
    pub json_mode: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the coordinator and serve all stage gates
    Serve {
        /// Keep serving after every stage has completed
        #[arg(long)]
        no_exit: bool,
    },

    /// Request a stage and exit with its status (run by the supervisor)
    Start {
        /// Stage to start (local, network, config, final)
        stage: Stage,
    },

    /// List the known stages in boot order
    Stages,

    /// Show which gate endpoints exist and accept connections
    Status,
}

// =============================================================================
// COMMAND EXECUTION
// =============================================================================

/// Execute the CLI with parsed arguments.
///
/// Returns the process exit status.
pub async fn execute(cli: Cli) -> Result<u8, GateError> {
    let config = Config::load(cli.config.as_deref())?.with_run_dir(cli.run_dir);
    let json_mode = cli.json_mode;

    match cli.command {
        Commands::Serve { no_exit } => cmd_serve(config, no_exit, json_mode).await,
        Commands::Start { stage } => Ok(cmd_start(&config, stage).await),
        Commands::Stages => cmd_stages(&config, json_mode),
        Commands::Status => cmd_status(&config, json_mode).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_start_stage() {
        let cli = Cli::try_parse_from(["stagegate", "start", "network"]).expect("parse");
        assert!(matches!(
            cli.command,
            Commands::Start {
                stage: Stage::Network
            }
        ));
    }

    #[test]
    fn rejects_unknown_stage() {
        assert!(Cli::try_parse_from(["stagegate", "start", "init-local"]).is_err());
    }

    #[test]
    fn global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["stagegate", "serve", "--run-dir", "/tmp/g", "--no-exit"])
            .expect("parse");
        assert_eq!(cli.run_dir, Some(PathBuf::from("/tmp/g")));
        assert!(matches!(cli.command, Commands::Serve { no_exit: true }));
    }

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
