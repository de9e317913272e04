//! # Shim Adapter
//!
//! The oneshot command a supervisor runs for each stage.
//!
//! The supervisor expects a foreground process that blocks until the stage
//! is over, prints something for the journal, and exits with the stage's
//! status. The shim does exactly that against the coordinator's gate and
//! adds no timeout of its own.

use crate::config::{Config, MAX_CONNECT_BACKOFF};
use crate::gate::{GateClient, RetryPolicy};
use stagegate_core::{CorrelationId, EXIT_FAILURE, GateError, Stage, StageResult};
use std::sync::atomic::{AtomicU32, Ordering};

/// What the shim prints and how it exits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShimOutcome {
    pub message: String,
    pub exit_code: u8,
}

impl ShimOutcome {
    fn from_result(result: &StageResult) -> Self {
        Self {
            message: result.message.clone(),
            exit_code: result.process_exit_code(),
        }
    }

    fn from_error(stage: Stage, error: &GateError) -> Self {
        let message = match error {
            GateError::EndpointUnavailable(_) => format!(
                "{} stage gate is not available: the coordinator is not running, \
                 or it already finished boot and closed its gates ({})",
                stage, error
            ),
            GateError::ConnectionReset(_) | GateError::MalformedMessage(_) => format!(
                "{} stage gate closed before reporting a result, the coordinator may have stopped or restarted ({})",
                stage, error
            ),
            _ => format!("{} stage request failed: {}", stage, error),
        };
        Self {
            message,
            exit_code: EXIT_FAILURE as u8,
        }
    }
}

/// Request `stage` from the coordinator and wait for its outcome.
///
/// Every error becomes a failing outcome: the supervisor only sees the exit
/// code, and a reset is never retried because the stage may have run.
pub async fn run_shim(config: &Config, stage: Stage) -> ShimOutcome {
    match request_stage(config, stage).await {
        Ok(result) => ShimOutcome::from_result(&result),
        Err(e) => {
            tracing::error!(stage = %stage, error = %e, "Stage request failed");
            ShimOutcome::from_error(stage, &e)
        }
    }
}

/// Send the start token and block for the result.
pub async fn request_stage(config: &Config, stage: Stage) -> Result<StageResult, GateError> {
    let retry = RetryPolicy {
        attempts: config.connect_attempts,
        initial_backoff: config.connect_backoff(),
        max_backoff: MAX_CONNECT_BACKOFF,
    };

    let mut client = GateClient::connect(&config.run_dir, stage, Some(correlation_id()?), &retry).await?;
    let token = client.start_token();
    client.send_token(&token).await?;
    tracing::debug!(stage = %stage, "Start token sent, waiting for stage");

    client.receive_result().await
}

/// `<pid>-<sequence>`: unique per request within a boot.
fn correlation_id() -> Result<CorrelationId, GateError> {
    static SEQUENCE: AtomicU32 = AtomicU32::new(0);
    let seq = SEQUENCE.fetch_add(1, Ordering::Relaxed);
    CorrelationId::new(format!("{}-{}", std::process::id(), seq))
}
