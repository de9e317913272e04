//! # CLI Command Implementations
//!
//! This module contains the actual implementations of CLI commands.
//!
//! Only `start` writes the stage message to stdout; the supervisor forwards
//! it to the journal. Logs always go to stderr.

use crate::config::Config;
use crate::coordinator::Coordinator;
use crate::gate;
use crate::notify::Notifier;
use crate::runner::{CommandHandler, StageRunner};
use crate::shim;
use stagegate_core::{GatePaths, GateError, Stage, StageRegistry};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// How long `status` waits for a gate to accept a probe.
const PROBE_TIMEOUT: Duration = Duration::from_millis(200);

// =============================================================================
// SERVE COMMAND
// =============================================================================

/// Run the coordinator until shutdown or until every stage has completed.
pub async fn cmd_serve(mut config: Config, no_exit: bool, json_mode: bool) -> Result<u8, GateError> {
    if no_exit {
        config.exit_when_complete = false;
    }

    let runner = StageRunner::new(Arc::new(CommandHandler::from_config(&config)));
    let notifier = Notifier::from_env(config.notify);
    let coordinator = Coordinator::open(&config, runner, notifier)?;

    tracing::info!(
        run_dir = %config.run_dir.display(),
        exit_when_complete = config.exit_when_complete,
        "Stage gates open"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    let report = coordinator.serve(shutdown_rx).await?;

    if json_mode {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).unwrap_or_default()
        );
        return Ok(0);
    }

    for stage in &report.stages {
        let outcome = match &stage.result {
            Some(result) => format!("exit {} ({})", result.exit_code, result.message),
            None => "not run".to_string(),
        };
        tracing::info!(
            stage = %stage.stage,
            state = %stage.state,
            rejected = stage.rejected,
            "{}",
            outcome
        );
    }

    Ok(0)
}

/// Resolve on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "Cannot listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}

// =============================================================================
// START COMMAND (SHIM)
// =============================================================================

/// Request `stage`, print its message, return its exit status.
pub async fn cmd_start(config: &Config, stage: Stage) -> u8 {
    let outcome = shim::run_shim(config, stage).await;
    println!("{}", outcome.message);
    outcome.exit_code
}

// =============================================================================
// STAGES COMMAND
// =============================================================================

/// Print the stage registry with the effective commands.
pub fn cmd_stages(config: &Config, json_mode: bool) -> Result<u8, GateError> {
    if json_mode {
        let stages: Vec<_> = StageRegistry::stages_in_order()
            .iter()
            .map(|stage| {
                serde_json::json!({
                    "rank": stage.rank(),
                    "name": stage.name(),
                    "milestone": stage.milestone(),
                    "command": config.command_for(*stage),
                    "completion": config.completion_for(*stage),
                })
            })
            .collect();
        println!(
            "{}",
            serde_json::to_string_pretty(&stages).unwrap_or_default()
        );
        return Ok(0);
    }

    println!("Boot Stages");
    println!("===========");
    for stage in StageRegistry::stages_in_order() {
        println!(
            "{}. {:<8} after: {:<27} run: {}",
            stage.rank(),
            stage.name(),
            stage.milestone(),
            config.command_for(*stage).join(" ")
        );
    }
    Ok(0)
}

// =============================================================================
// STATUS COMMAND
// =============================================================================

/// Show, per stage, whether the gate sockets exist and are served.
pub async fn cmd_status(config: &Config, json_mode: bool) -> Result<u8, GateError> {
    let mut rows = Vec::new();
    for stage in StageRegistry::stages_in_order() {
        let paths = GatePaths::for_stage(&config.run_dir, *stage);
        let listening = paths.ret.exists() && gate::probe(&paths.ret, PROBE_TIMEOUT).await;
        rows.push((paths, listening));
    }

    if json_mode {
        let output: Vec<_> = rows
            .iter()
            .map(|(paths, listening)| {
                serde_json::json!({
                    "stage": paths.stage.name(),
                    "request": paths.request.to_string_lossy(),
                    "request_exists": paths.request.exists(),
                    "return": paths.ret.to_string_lossy(),
                    "return_exists": paths.ret.exists(),
                    "listening": listening,
                })
            })
            .collect();
        println!(
            "{}",
            serde_json::to_string_pretty(&output).unwrap_or_default()
        );
        return Ok(0);
    }

    println!("Stage Gates");
    println!("===========");
    println!("Run dir: {}", config.run_dir.display());
    println!();
    for (paths, listening) in &rows {
        let state = match (paths.request.exists(), paths.ret.exists(), listening) {
            (true, true, true) => "listening",
            (false, false, _) => "absent",
            (_, _, false) => "stale",
            _ => "partial",
        };
        println!("{:<8} {}", paths.stage.name(), state);
    }
    Ok(0)
}
