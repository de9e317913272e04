//! # Core Type Definitions
//!
//! This module contains the message and error types exchanged over a gate:
//! - Start requests (`StartToken`, `CorrelationId`)
//! - Stage outcomes (`StageResult`)
//! - Reserved exit codes
//! - Error types (`GateError`)

use serde::{Deserialize, Serialize};
use thiserror::Error;

// =============================================================================
// EXIT CODES
// =============================================================================

/// The stage completed successfully.
pub const EXIT_SUCCESS: i32 = 0;

/// Generic stage failure. Also used by the shim when the gate is unreachable
/// or closes before a result arrives.
pub const EXIT_FAILURE: i32 = 1;

/// Duplicate or malformed start request.
pub const EXIT_PROTOCOL_VIOLATION: i32 = 2;

/// The stage handler panicked or the coordinator hit an internal fault
/// (matches `EX_SOFTWARE` from sysexits.h).
pub const EXIT_INTERNAL_FAULT: i32 = 70;

/// Default completion word reported by a successful stage.
pub const DEFAULT_COMPLETION: &str = "done";

/// Maximum length of a correlation id, in bytes.
pub const MAX_CORRELATION_ID_LEN: usize = 64;

// =============================================================================
// CORRELATION ID
// =============================================================================

/// Identifier tying a start request to the return connection that waits for
/// its result.
///
/// Only printable, non-whitespace ASCII is allowed so the id fits on a single
/// protocol line.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Validate and wrap a correlation id.
    pub fn new(id: impl Into<String>) -> Result<Self, GateError> {
        let id = id.into();
        if id.is_empty() || id.len() > MAX_CORRELATION_ID_LEN {
            return Err(GateError::MalformedMessage(format!(
                "correlation id must be 1..={} bytes, got {}",
                MAX_CORRELATION_ID_LEN,
                id.len()
            )));
        }
        if !id.bytes().all(|b| b.is_ascii_graphic()) {
            return Err(GateError::MalformedMessage(
                "correlation id must be printable ASCII without whitespace".to_string(),
            ));
        }
        Ok(Self(id))
    }

    /// Get the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// =============================================================================
// START TOKEN
// =============================================================================

/// The request a shim sends to ask for a stage to run.
///
/// The base protocol carries only the literal `start`. A correlation id may
/// follow it so the coordinator can pick the right return connection when
/// more than one is pending.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct StartToken {
    pub correlation: Option<CorrelationId>,
}

impl StartToken {
    /// The literal that opens every start request.
    pub const LITERAL: &'static str = "start";

    /// A bare `start` token.
    #[must_use]
    pub fn anonymous() -> Self {
        Self { correlation: None }
    }

    /// A token carrying a correlation id.
    #[must_use]
    pub fn with_correlation(id: CorrelationId) -> Self {
        Self {
            correlation: Some(id),
        }
    }
}

// =============================================================================
// STAGE RESULT
// =============================================================================

/// Outcome of running one stage.
///
/// Exactly one `StageResult` is produced for every accepted start token.
/// Only `exit_code` distinguishes success from failure; `message` is the
/// human readable text the shim prints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageResult {
    pub message: String,
    pub exit_code: i32,
}

impl StageResult {
    /// Create a result from its parts.
    #[must_use]
    pub fn new(message: impl Into<String>, exit_code: i32) -> Self {
        Self {
            message: message.into(),
            exit_code,
        }
    }

    /// A successful result carrying the given completion word.
    #[must_use]
    pub fn success(message: impl Into<String>) -> Self {
        Self::new(message, EXIT_SUCCESS)
    }

    /// The default successful result: `"done"`, exit code 0.
    #[must_use]
    pub fn done() -> Self {
        Self::success(DEFAULT_COMPLETION)
    }

    /// A failed result. A zero `exit_code` is promoted to [`EXIT_FAILURE`]
    /// so that a failure can never be reported as success.
    #[must_use]
    pub fn failure(message: impl Into<String>, exit_code: i32) -> Self {
        let exit_code = if exit_code == EXIT_SUCCESS {
            EXIT_FAILURE
        } else {
            exit_code
        };
        Self::new(message, exit_code)
    }

    /// Result returned for a request the protocol does not allow.
    #[must_use]
    pub fn protocol_violation(message: impl Into<String>) -> Self {
        Self::new(message, EXIT_PROTOCOL_VIOLATION)
    }

    /// Result returned when the stage logic faulted instead of returning.
    #[must_use]
    pub fn internal_fault(message: impl Into<String>) -> Self {
        Self::new(message, EXIT_INTERNAL_FAULT)
    }

    /// Whether the stage succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.exit_code == EXIT_SUCCESS
    }

    /// Map the exit code onto a process exit status.
    ///
    /// Codes in `0..=255` pass through. Anything else would be truncated by
    /// the OS (possibly to 0), so it becomes [`EXIT_FAILURE`].
    #[must_use]
    pub fn process_exit_code(&self) -> u8 {
        u8::try_from(self.exit_code).unwrap_or(EXIT_FAILURE as u8)
    }
}

impl Default for StageResult {
    fn default() -> Self {
        Self::done()
    }
}

// =============================================================================
// ERROR TYPES
// =============================================================================

/// Errors that can occur anywhere in the stage-gate protocol.
///
/// Only [`GateError::EndpointUnavailable`] is retryable. Everything else is
/// terminal for the current request: retrying after a reset could run a
/// stage with side effects twice.
#[derive(Debug, Error)]
pub enum GateError {
    /// The coordinator is not listening on the gate yet.
    #[error("Gate endpoint unavailable: {0}")]
    EndpointUnavailable(String),

    /// The gate closed before a complete exchange (coordinator restarted or
    /// shutting down).
    #[error("Gate connection reset: {0}")]
    ConnectionReset(String),

    /// A payload on the gate could not be decoded.
    #[error("Malformed gate message: {0}")]
    MalformedMessage(String),

    /// A request the protocol forbids, e.g. a second start for a completed stage.
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// The stage logic reported a failure.
    #[error("Stage execution failed: {0}")]
    StageExecutionFailure(String),

    /// A stage name that is not in the registry.
    #[error("Unknown stage: {0}")]
    UnknownStage(String),

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(String),
}

impl GateError {
    /// Whether the caller may retry the operation that produced this error.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, GateError::EndpointUnavailable(_))
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_never_reports_success() {
        let result = StageResult::failure("broken", EXIT_SUCCESS);
        assert_eq!(result.exit_code, EXIT_FAILURE);
        assert!(!result.is_success());
    }

    #[test]
    fn process_exit_code_clamps_out_of_range() {
        assert_eq!(StageResult::new("x", 3).process_exit_code(), 3);
        assert_eq!(StageResult::new("x", 255).process_exit_code(), 255);
        assert_eq!(StageResult::new("x", 256).process_exit_code(), 1);
        assert_eq!(StageResult::new("x", -1).process_exit_code(), 1);
    }

    #[test]
    fn default_result_is_done() {
        let result = StageResult::default();
        assert_eq!(result.message, "done");
        assert!(result.is_success());
    }

    #[test]
    fn correlation_id_validation() {
        assert!(CorrelationId::new("shim-42").is_ok());
        assert!(CorrelationId::new("").is_err());
        assert!(CorrelationId::new("has space").is_err());
        assert!(CorrelationId::new("a".repeat(MAX_CORRELATION_ID_LEN + 1)).is_err());
    }

    #[test]
    fn only_unavailable_is_retryable() {
        assert!(GateError::EndpointUnavailable("x".into()).is_retryable());
        assert!(!GateError::ConnectionReset("x".into()).is_retryable());
        assert!(!GateError::MalformedMessage("x".into()).is_retryable());
    }
}
