//! # Stagegate - Boot Stage Gate
//!
//! The main binary: coordinator, shim and inspection commands.
//!
//! ## Usage
//!
//! ```bash
//! # Early in boot: start the persistent worker
//! stagegate serve
//!
//! # From each stage unit (ExecStart, oneshot, no timeout)
//! stagegate start local
//! stagegate start network
//!
//! # Inspection
//! stagegate stages --json-mode
//! stagegate status
//! ```
//!
//! Logging: `RUST_LOG` sets the filter (default `stagegate=info`),
//! `STAGEGATE_LOG_FORMAT=json` switches to machine-parseable output.

use clap::Parser;
use stagegate::cli;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

// =============================================================================
// APPLICATION ENTRY POINT
// =============================================================================

#[tokio::main]
async fn main() {
    // Parse CLI arguments
    let cli = cli::Cli::parse();

    init_tracing(cli.verbose);

    // Execute command
    match cli::execute(cli).await {
        Ok(code) => std::process::exit(i32::from(code)),
        Err(e) => {
            tracing::error!("Error: {}", e);
            std::process::exit(1);
        }
    }
}

/// Logs go to stderr: a shim's stdout carries only the stage message.
fn init_tracing(verbose: bool) {
    let log_format = std::env::var("STAGEGATE_LOG_FORMAT").unwrap_or_else(|_| "text".to_string());

    let default_filter = if verbose { "stagegate=debug" } else { "stagegate=info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| default_filter.into());

    match log_format.as_str() {
        "json" => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
}
