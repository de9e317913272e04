//! # Stage Lifecycle
//!
//! Per-stage state machine enforcing at-most-once execution.
//!
//! ```text
//! Idle --listen--> Listening --begin--> Running --complete--> Completed
//! ```
//!
//! `Completed` is terminal for the lifetime of a coordinator. A start request
//! that arrives for a completed stage is rejected, never re-run. Whether the
//! stage succeeded is recorded in the stored [`StageResult`], not in the
//! state: a failed stage is still `Completed`.

use crate::stage::Stage;
use crate::types::{GateError, StageResult};
use serde::{Deserialize, Serialize};

/// Where a stage is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageState {
    Idle,
    Listening,
    Running,
    Completed,
}

impl std::fmt::Display for StageState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            StageState::Idle => "idle",
            StageState::Listening => "listening",
            StageState::Running => "running",
            StageState::Completed => "completed",
        };
        f.write_str(name)
    }
}

/// Lifecycle of a single stage, owned by that stage's listener.
#[derive(Debug, Clone)]
pub struct StageLifecycle {
    stage: Stage,
    state: StageState,
    result: Option<StageResult>,
    rejected: u32,
}

impl StageLifecycle {
    /// A fresh lifecycle in the `Idle` state.
    #[must_use]
    pub fn new(stage: Stage) -> Self {
        Self {
            stage,
            state: StageState::Idle,
            result: None,
            rejected: 0,
        }
    }

    #[must_use]
    pub fn stage(&self) -> Stage {
        self.stage
    }

    #[must_use]
    pub fn state(&self) -> StageState {
        self.state
    }

    /// The result of the single run, once completed.
    #[must_use]
    pub fn result(&self) -> Option<&StageResult> {
        self.result.as_ref()
    }

    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.state == StageState::Completed
    }

    /// Number of start requests rejected so far.
    #[must_use]
    pub fn rejected(&self) -> u32 {
        self.rejected
    }

    /// `Idle -> Listening`: the gate for this stage is open.
    pub fn listen(&mut self) -> Result<(), GateError> {
        match self.state {
            StageState::Idle => {
                self.state = StageState::Listening;
                Ok(())
            }
            other => Err(self.violation(format!("cannot open gate while {}", other))),
        }
    }

    /// `Listening -> Running`: a start token was accepted.
    ///
    /// Any other state rejects the request and counts it.
    pub fn begin(&mut self) -> Result<(), GateError> {
        match self.state {
            StageState::Listening => {
                self.state = StageState::Running;
                Ok(())
            }
            StageState::Completed => {
                self.rejected = self.rejected.saturating_add(1);
                Err(self.violation("already completed during this boot".to_string()))
            }
            other => {
                self.rejected = self.rejected.saturating_add(1);
                Err(self.violation(format!("start request while {}", other)))
            }
        }
    }

    /// Count a request that was rejected before reaching [`Self::begin`],
    /// e.g. a malformed token.
    pub fn reject(&mut self) {
        self.rejected = self.rejected.saturating_add(1);
    }

    /// `Running -> Completed`: the runner produced its result.
    pub fn complete(&mut self, result: StageResult) -> Result<(), GateError> {
        match self.state {
            StageState::Running => {
                self.state = StageState::Completed;
                self.result = Some(result);
                Ok(())
            }
            other => Err(self.violation(format!("completion while {}", other))),
        }
    }

    fn violation(&self, detail: String) -> GateError {
        GateError::ProtocolViolation(format!("{} stage: {}", self.stage, detail))
    }
}

// =============================================================================
// TESTS
// =============================================================================
