//! Gate endpoint naming.
//!
//! Every stage owns exactly two rendezvous points inside the run directory:
//! `<stage>.sock` (requests) and `<stage>-return.sock` (results).

use crate::stage::Stage;
use std::path::{Path, PathBuf};

/// Default directory for gate endpoints. Runtime-only, gone after reboot.
pub const DEFAULT_RUN_DIR: &str = "/run/stagegate/share";

/// The request / return endpoint pair of one stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatePaths {
    pub stage: Stage,
    pub request: PathBuf,
    pub ret: PathBuf,
}

impl GatePaths {
    /// Derive the endpoint pair of `stage` under `run_dir`.
    #[must_use]
    pub fn for_stage(run_dir: &Path, stage: Stage) -> Self {
        Self {
            stage,
            request: run_dir.join(format!("{}.sock", stage.name())),
            ret: run_dir.join(format!("{}-return.sock", stage.name())),
        }
    }

    /// Both paths, request first.
    #[must_use]
    pub fn both(&self) -> [&Path; 2] {
        [&self.request, &self.ret]
    }
}
