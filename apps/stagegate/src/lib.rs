//! # stagegate
//!
//! The OS-facing half of the stagegate boot-stage protocol.
//!
//! ```text
//!  supervisor ──runs──▶ stagegate start <stage>  (shim)
//!                              │  <stage>-return.sock, <stage>.sock
//!                              ▼
//!                      stagegate serve  (coordinator)
//!                              │
//!                              ▼
//!                        StageHandler  (stage logic)
//! ```
//!
//! - `gate` → Unix socket transport for one stage's request/return pair
//! - `runner` → the injected stage logic and its fault containment
//! - `coordinator` → the persistent worker serving every gate
//! - `shim` → the oneshot client the supervisor runs
//! - `notify` → readiness / status reporting to the supervisor
//! - `config` → TOML configuration
//! - `cli` → command line entry points

pub mod cli;
pub mod config;
pub mod coordinator;
pub mod gate;
pub mod notify;
pub mod runner;
pub mod shim;

pub use config::Config;
pub use coordinator::{Coordinator, CoordinatorReport, StageReport};
pub use gate::{GateClient, GateListener, GateRequest, RetryPolicy, ReturnHandle};
pub use notify::Notifier;
pub use runner::{CommandHandler, StageHandler, StageRunner};
pub use shim::{ShimOutcome, request_stage, run_shim};
