//! # Stage Registry
//!
//! The fixed, ordered set of boot stages served by one coordinator.
//!
//! ## Stage Definitions
//!
//! | Rank | Stage | Waits For | Default Command |
//! |------|-------|-----------|-----------------|
//! | 0 | `local` | local filesystems | `cloud-init init --local` |
//! | 1 | `network` | network online | `cloud-init init` |
//! | 2 | `config` | network stage done | `cloud-init modules --mode=config` |
//! | 3 | `final` | multi-user target | `cloud-init modules --mode=final` |
//!
//! The registry only makes identity and ordering explicit. Ordering between
//! stages is enforced by the supervisor's dependency graph, not here.

use crate::types::{DEFAULT_COMPLETION, GateError};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

// =============================================================================
// STAGE ENUM
// =============================================================================

/// One ordered phase of boot-time initialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    /// Runs before networking is configured.
    Local,
    /// Runs once the network is up.
    Network,
    /// Applies configuration modules.
    Config,
    /// Last stage of boot, user scripts.
    Final,
}

impl Stage {
    /// Get the stage name as used on the wire and in endpoint paths.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Stage::Local => "local",
            Stage::Network => "network",
            Stage::Config => "config",
            Stage::Final => "final",
        }
    }

    /// Get the ordering rank (0 = first).
    #[must_use]
    pub fn rank(&self) -> u8 {
        match self {
            Stage::Local => 0,
            Stage::Network => 1,
            Stage::Config => 2,
            Stage::Final => 3,
        }
    }

    /// Get the next stage, if any.
    #[must_use]
    pub fn next(&self) -> Option<Stage> {
        match self {
            Stage::Local => Some(Stage::Network),
            Stage::Network => Some(Stage::Config),
            Stage::Config => Some(Stage::Final),
            Stage::Final => None,
        }
    }

    /// Get the previous stage, if any.
    #[must_use]
    pub fn previous(&self) -> Option<Stage> {
        match self {
            Stage::Local => None,
            Stage::Network => Some(Stage::Local),
            Stage::Config => Some(Stage::Network),
            Stage::Final => Some(Stage::Config),
        }
    }

    /// Check if this is the last stage of boot.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Stage::Final)
    }

    /// The system milestone the supervisor waits for before starting this stage.
    #[must_use]
    pub fn milestone(&self) -> &'static str {
        match self {
            Stage::Local => "local filesystems mounted",
            Stage::Network => "network online",
            Stage::Config => "network stage complete",
            Stage::Final => "multi-user target reached",
        }
    }

    /// The command run for this stage when no override is configured.
    #[must_use]
    pub fn default_command(&self) -> &'static [&'static str] {
        match self {
            Stage::Local => &["cloud-init", "init", "--local"],
            Stage::Network => &["cloud-init", "init"],
            Stage::Config => &["cloud-init", "modules", "--mode=config"],
            Stage::Final => &["cloud-init", "modules", "--mode=final"],
        }
    }

    /// The message reported when the stage succeeds.
    #[must_use]
    pub fn default_completion(&self) -> &'static str {
        DEFAULT_COMPLETION
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Stage {
    type Err = GateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StageRegistry::lookup(s)
    }
}

// =============================================================================
// STAGE REGISTRY
// =============================================================================

/// Static, read-only view of the known stages.
pub struct StageRegistry;

impl StageRegistry {
    const ORDER: [Stage; 4] = [Stage::Local, Stage::Network, Stage::Config, Stage::Final];

    /// All stages, first to last.
    #[must_use]
    pub fn stages_in_order() -> &'static [Stage] {
        &Self::ORDER
    }

    /// Find a stage by name.
    pub fn lookup(name: &str) -> Result<Stage, GateError> {
        Self::ORDER
            .iter()
            .copied()
            .find(|stage| stage.name() == name)
            .ok_or_else(|| GateError::UnknownStage(name.to_string()))
    }

    /// Number of registered stages.
    #[must_use]
    pub fn len() -> usize {
        Self::ORDER.len()
    }
}

// =============================================================================
// TESTS
// =============================================================================
