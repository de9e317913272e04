//! # stagegate-core
//!
//! The pure half of the stagegate boot-stage protocol.
//!
//! A persistent coordinator runs every boot stage; a short-lived shim per
//! stage asks for the stage to start and relays its outcome to the process
//! supervisor. This crate holds everything both sides must agree on:
//!
//! - `stage` → the ordered stage registry
//! - `types` → start tokens, stage results, exit codes, `GateError`
//! - `wire` → line framing of the request / return channels
//! - `endpoint` → where each stage's gate lives on disk
//! - `lifecycle` → the per-stage at-most-once state machine
//!
//! ## Architectural Constraints
//!
//! - NO async, NO sockets, NO logging: the OS-facing half lives in the
//!   `stagegate` application crate
//! - Every fallible operation returns `Result<T, GateError>`

// =============================================================================
// MODULES
// =============================================================================

pub mod endpoint;
pub mod lifecycle;
pub mod stage;
pub mod types;
pub mod wire;

// =============================================================================
// RE-EXPORTS: Core Types
// =============================================================================

pub use types::{
    CorrelationId, DEFAULT_COMPLETION, EXIT_FAILURE, EXIT_INTERNAL_FAULT,
    EXIT_PROTOCOL_VIOLATION, EXIT_SUCCESS, GateError, StageResult, StartToken,
};

// =============================================================================
// RE-EXPORTS: Registry, Endpoints, Lifecycle
// =============================================================================

pub use endpoint::{DEFAULT_RUN_DIR, GatePaths};
pub use lifecycle::{StageLifecycle, StageState};
pub use stage::{Stage, StageRegistry};

// =============================================================================
// RE-EXPORTS: Wire Codec
// =============================================================================

pub use wire::{
    MAX_LINE_LEN, MAX_RESULT_LEN, decode_hello, decode_result, decode_token, encode_hello,
    encode_result, encode_token,
};
