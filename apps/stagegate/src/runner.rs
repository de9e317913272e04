//! # Stage Runner
//!
//! Bridges the injected stage logic and the gate protocol.
//!
//! [`StageRunner::run`] turns every handler outcome into a [`StageResult`].
//! Errors and panics included, so a shim waiting on the gate always gets an
//! answer.

use crate::config::Config;
use async_trait::async_trait;
use stagegate_core::{EXIT_FAILURE, GateError, Stage, StageResult};
use std::any::Any;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::process::Command;
use tokio::task::AbortHandle;

// =============================================================================
// HANDLER TRAIT
// =============================================================================

/// The stage logic itself, supplied by the surrounding system.
#[async_trait]
pub trait StageHandler: Send + Sync {
    /// Run `stage` to completion.
    ///
    /// `Ok` carries the stage's own verdict (including nonzero exit codes);
    /// `Err` means the stage could not be carried out at all.
    async fn run(&self, stage: Stage) -> Result<StageResult, GateError>;
}

// =============================================================================
// COMMAND HANDLER
// =============================================================================

/// Runs one configured command per stage.
///
/// The child inherits stdout/stderr, so its output lands in the
/// coordinator's journal.
#[derive(Debug, Clone)]
pub struct CommandHandler {
    commands: BTreeMap<Stage, Vec<String>>,
    completions: BTreeMap<Stage, String>,
}

impl CommandHandler {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        let mut commands = BTreeMap::new();
        let mut completions = BTreeMap::new();
        for stage in stagegate_core::StageRegistry::stages_in_order() {
            commands.insert(*stage, config.command_for(*stage));
            completions.insert(*stage, config.completion_for(*stage));
        }
        Self {
            commands,
            completions,
        }
    }
}

#[async_trait]
impl StageHandler for CommandHandler {
    async fn run(&self, stage: Stage) -> Result<StageResult, GateError> {
        let argv = self
            .commands
            .get(&stage)
            .ok_or_else(|| GateError::Config(format!("no command for {} stage", stage)))?;
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| GateError::Config(format!("empty command for {} stage", stage)))?;

        tracing::info!(stage = %stage, command = ?argv, "Running stage command");

        let status = Command::new(program)
            .args(args)
            .kill_on_drop(true)
            .status()
            .await
            .map_err(|e| {
                GateError::StageExecutionFailure(format!("cannot start '{}': {}", program, e))
            })?;

        let result = match status.code() {
            Some(0) => StageResult::success(
                self.completions
                    .get(&stage)
                    .map(String::as_str)
                    .unwrap_or(stage.default_completion()),
            ),
            Some(code) => StageResult::failure(
                format!("{} stage failed: {} exited with status {}", stage, program, code),
                code,
            ),
            None => StageResult::failure(
                format!("{} stage failed: {} was terminated by a signal", stage, program),
                EXIT_FAILURE,
            ),
        };
        Ok(result)
    }
}

// =============================================================================
// STAGE RUNNER
// =============================================================================

/// Runs a handler in its own task and turns every outcome into a result.
#[derive(Clone)]
pub struct StageRunner {
    handler: Arc<dyn StageHandler>,
}

/// Aborts the handler task if the run is abandoned (coordinator shutdown).
struct AbortOnDrop(AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

impl StageRunner {
    #[must_use]
    pub fn new(handler: Arc<dyn StageHandler>) -> Self {
        Self { handler }
    }

    /// Run `stage` once. Never fails and never panics.
    pub async fn run(&self, stage: Stage) -> StageResult {
        let handler = Arc::clone(&self.handler);
        let task = tokio::spawn(async move { handler.run(stage).await });
        let _guard = AbortOnDrop(task.abort_handle());

        match task.await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                tracing::warn!(stage = %stage, error = %e, "Stage handler failed");
                StageResult::failure(format!("{} stage failed: {}", stage, e), EXIT_FAILURE)
            }
            Err(join) if join.is_panic() => {
                let reason = panic_message(join.into_panic());
                tracing::error!(stage = %stage, reason = %reason, "Stage handler panicked");
                StageResult::internal_fault(format!(
                    "internal error running {} stage: {}",
                    stage, reason
                ))
            }
            Err(_) => StageResult::internal_fault(format!("{} stage was cancelled", stage)),
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

// =============================================================================
// TESTS
// =============================================================================
