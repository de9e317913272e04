//! # Configuration
//!
//! TOML configuration for both the coordinator and the shim.
//!
//! ## Sources (later wins)
//!
//! 1. Built-in defaults
//! 2. Config file (`/etc/stagegate/stagegate.toml` unless `--config` is given;
//!    a missing default file is not an error)
//! 3. `STAGEGATE_RUN_DIR` environment variable
//! 4. `--run-dir` command line flag
//!
//! ## Example
//!
//! ```toml
//! run_dir = "/run/stagegate/share"
//! token_timeout_ms = 5000
//! connect_attempts = 10
//! connect_backoff_ms = 50
//! exit_when_complete = true
//! notify = true
//!
//! [stages.network]
//! command = ["/usr/lib/boot/network-stage", "--dhcp"]
//! completion = "network up"
//! ```

use serde::Deserialize;
use stagegate_core::{DEFAULT_RUN_DIR, GateError, Stage, StageRegistry};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default config file location.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/stagegate/stagegate.toml";

/// Environment variable overriding the run directory.
pub const RUN_DIR_ENV: &str = "STAGEGATE_RUN_DIR";

/// Upper bound for a single backoff sleep between connect attempts.
pub const MAX_CONNECT_BACKOFF: Duration = Duration::from_secs(2);

// =============================================================================
// CONFIG STRUCTURE
// =============================================================================

/// Per-stage overrides.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct StageConfig {
    /// Command to run instead of the registry default.
    pub command: Option<Vec<String>>,
    /// Message reported on success instead of "done".
    pub completion: Option<String>,
}

/// Complete stagegate configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Directory holding the gate endpoints.
    pub run_dir: PathBuf,
    /// How long the coordinator waits for a token line or a return hello
    /// once a connection is accepted.
    pub token_timeout_ms: u64,
    /// How many times the shim tries to reach a gate before giving up.
    pub connect_attempts: u32,
    /// First backoff between connect attempts; doubles each time.
    pub connect_backoff_ms: u64,
    /// Stop the coordinator once every stage has completed.
    pub exit_when_complete: bool,
    /// Send readiness and status to `$NOTIFY_SOCKET`.
    pub notify: bool,
    /// Overrides keyed by stage name.
    pub stages: BTreeMap<String, StageConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            run_dir: PathBuf::from(DEFAULT_RUN_DIR),
            token_timeout_ms: 5_000,
            connect_attempts: 10,
            connect_backoff_ms: 50,
            exit_when_complete: true,
            notify: true,
            stages: BTreeMap::new(),
        }
    }
}

impl Config {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(text: &str) -> Result<Self, GateError> {
        let config: Config =
            toml::from_str(text).map_err(|e| GateError::Config(format!("{}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from `path`, or from the default location.
    ///
    /// An explicitly given path must exist; the default path may be absent.
    pub fn load(path: Option<&Path>) -> Result<Self, GateError> {
        let (path, required) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => (PathBuf::from(DEFAULT_CONFIG_PATH), false),
        };

        let mut config = match std::fs::read_to_string(&path) {
            Ok(text) => Self::from_toml_str(&text).map_err(|e| {
                GateError::Config(format!("{}: {}", path.display(), e))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && !required => Self::default(),
            Err(e) => {
                return Err(GateError::Config(format!(
                    "Cannot read config '{}': {}",
                    path.display(),
                    e
                )));
            }
        };

        if let Ok(dir) = std::env::var(RUN_DIR_ENV)
            && !dir.is_empty()
        {
            config.run_dir = PathBuf::from(dir);
        }

        Ok(config)
    }

    /// Apply a command line override of the run directory.
    #[must_use]
    pub fn with_run_dir(mut self, run_dir: Option<PathBuf>) -> Self {
        if let Some(dir) = run_dir {
            self.run_dir = dir;
        }
        self
    }

    fn validate(&self) -> Result<(), GateError> {
        for (name, stage) in &self.stages {
            StageRegistry::lookup(name)
                .map_err(|_| GateError::Config(format!("unknown stage '{}' in [stages]", name)))?;
            if let Some(command) = &stage.command
                && command.is_empty()
            {
                return Err(GateError::Config(format!(
                    "stages.{}.command must not be empty",
                    name
                )));
            }
        }
        if self.connect_attempts == 0 {
            return Err(GateError::Config(
                "connect_attempts must be at least 1".to_string(),
            ));
        }
        if self.token_timeout_ms == 0 {
            return Err(GateError::Config(
                "token_timeout_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }

    #[must_use]
    pub fn token_timeout(&self) -> Duration {
        Duration::from_millis(self.token_timeout_ms)
    }

    #[must_use]
    pub fn connect_backoff(&self) -> Duration {
        Duration::from_millis(self.connect_backoff_ms)
    }

    /// The argv to run for `stage`.
    #[must_use]
    pub fn command_for(&self, stage: Stage) -> Vec<String> {
        self.stages
            .get(stage.name())
            .and_then(|s| s.command.clone())
            .unwrap_or_else(|| {
                stage
                    .default_command()
                    .iter()
                    .map(|s| (*s).to_string())
                    .collect()
            })
    }

    /// The success message for `stage`.
    #[must_use]
    pub fn completion_for(&self, stage: Stage) -> String {
        self.stages
            .get(stage.name())
            .and_then(|s| s.completion.clone())
            .unwrap_or_else(|| stage.default_completion().to_string())
    }
}

// =============================================================================
// TESTS
// =============================================================================
