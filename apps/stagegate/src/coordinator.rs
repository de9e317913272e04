//! # Stage Coordinator
//!
//! The persistent worker: owns every gate and runs every stage.
//!
//! ## Task Layout
//!
//! ```text
//!                 ┌──────────────── Coordinator::serve ───────────────┐
//!                 │  reports, notifier, shutdown, exit-when-complete  │
//!                 └───────▲──────────▲──────────▲──────────▲─────────┘
//!                         │ events   │          │          │  (mpsc)
//!                   ┌─────┴──┐  ┌────┴───┐  ┌───┴────┐  ┌──┴─────┐
//!                   │ local  │  │network │  │ config │  │ final  │  one task each
//!                   │ gate + │  │ gate + │  │ gate + │  │ gate + │
//!                   │lifecyc.│  │lifecyc.│  │lifecyc.│  │lifecyc.│
//!                   └────────┘  └────────┘  └────────┘  └────────┘
//! ```
//!
//! Each stage task exclusively owns its gate and its [`StageLifecycle`];
//! nothing mutable is shared between stages. Tasks report to the coordinator
//! over a channel. Shutdown aborts the tasks, which drops the listeners and
//! any accepted return connection, so a waiting shim sees the gate close.

use crate::config::Config;
use crate::gate::{GateListener, GateRequest};
use crate::notify::Notifier;
use crate::runner::StageRunner;
use serde::Serialize;
use stagegate_core::{
    GateError, Stage, StageLifecycle, StageRegistry, StageResult, StageState,
};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::{Id, JoinSet};
use tokio::time::Instant;

/// Pause after an accept error so a persistent failure (e.g. fd exhaustion)
/// does not spin.
const ACCEPT_ERROR_PAUSE: Duration = Duration::from_millis(100);

// =============================================================================
// REPORTING
// =============================================================================

/// What happened to one stage during a coordinator run.
#[derive(Debug, Clone, Serialize)]
pub struct StageReport {
    pub stage: Stage,
    pub state: StageState,
    pub result: Option<StageResult>,
    pub rejected: u32,
}

/// Final view of all stages when the coordinator stops.
#[derive(Debug, Clone, Serialize)]
pub struct CoordinatorReport {
    pub stages: Vec<StageReport>,
}

impl CoordinatorReport {
    #[must_use]
    pub fn stage(&self, stage: Stage) -> Option<&StageReport> {
        self.stages.iter().find(|r| r.stage == stage)
    }

    #[must_use]
    pub fn all_completed(&self) -> bool {
        self.stages.iter().all(|r| r.state == StageState::Completed)
    }
}

/// Messages from stage tasks to the coordinator.
#[derive(Debug)]
enum StageEvent {
    Started(Stage),
    Completed(Stage, StageResult),
    Rejected(Stage, GateError),
}

// =============================================================================
// COORDINATOR
// =============================================================================

/// Owns the gates of all registered stages.
pub struct Coordinator {
    gates: Vec<GateListener>,
    runner: StageRunner,
    notifier: Notifier,
    exit_when_complete: bool,
}

impl Coordinator {
    /// Bind every stage gate.
    ///
    /// All endpoints exist once this returns, so shims started afterwards
    /// never race the coordinator. On failure, gates bound so far are removed.
    pub fn open(config: &Config, runner: StageRunner, notifier: Notifier) -> Result<Self, GateError> {
        let gates = StageRegistry::stages_in_order()
            .iter()
            .map(|stage| GateListener::open(&config.run_dir, *stage, config.token_timeout()))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            gates,
            runner,
            notifier,
            exit_when_complete: config.exit_when_complete,
        })
    }

    /// Serve start requests until shutdown, or until every stage has
    /// completed when `exit_when_complete` is set.
    ///
    /// A shutdown is a `true` on the watch channel or the sender going away.
    pub async fn serve(self, mut shutdown: watch::Receiver<bool>) -> Result<CoordinatorReport, GateError> {
        let Coordinator {
            gates,
            runner,
            notifier,
            exit_when_complete,
        } = self;

        let mut reports: BTreeMap<Stage, StageReport> = BTreeMap::new();
        let mut task_stages: HashMap<Id, Stage> = HashMap::new();
        let mut tasks = JoinSet::new();
        let (events_tx, mut events_rx) = mpsc::channel::<StageEvent>(32);

        for gate in gates {
            let stage = gate.stage();
            reports.insert(
                stage,
                StageReport {
                    stage,
                    state: StageState::Listening,
                    result: None,
                    rejected: 0,
                },
            );
            let handle = tasks.spawn(stage_loop(gate, runner.clone(), events_tx.clone()));
            task_stages.insert(handle.id(), stage);
        }
        drop(events_tx);

        let names: Vec<&str> = reports.keys().map(|s| s.name()).collect();
        tracing::info!(stages = ?names, "Coordinator ready");
        notifier.ready(&format!("Waiting for start requests: {}", names.join(", ")));

        loop {
            if tasks.is_empty() {
                tracing::error!("No stage gates left to serve");
                break;
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        tracing::info!("Shutdown requested, closing gates");
                        break;
                    }
                }
                Some(event) = events_rx.recv() => {
                    apply_event(&mut reports, &notifier, event);
                    if exit_when_complete
                        && reports.values().all(|r| r.state == StageState::Completed)
                    {
                        tracing::info!("All stages completed");
                        break;
                    }
                }
                Some(joined) = tasks.join_next_with_id() => {
                    let (id, outcome) = match joined {
                        Ok((id, ())) => (id, "exited".to_string()),
                        Err(e) => (e.id(), e.to_string()),
                    };
                    let stage = task_stages.get(&id).map(|s| s.name()).unwrap_or("unknown");
                    // Handler panics are contained by StageRunner, and stage_loop
                    // only returns if a fresh lifecycle refuses to listen, so this
                    // arm does not fire in practice. The stage's gate is gone with
                    // its task; the other stages keep being served.
                    tracing::error!(stage = stage, outcome = %outcome, "Stage task ended unexpectedly");
                }
            }
        }

        notifier.stopping();
        tasks.shutdown().await;

        // Drain events sent before the tasks were stopped.
        while let Ok(event) = events_rx.try_recv() {
            apply_event(&mut reports, &notifier, event);
        }

        Ok(CoordinatorReport {
            stages: reports.into_values().collect(),
        })
    }
}

fn apply_event(reports: &mut BTreeMap<Stage, StageReport>, notifier: &Notifier, event: StageEvent) {
    match event {
        StageEvent::Started(stage) => {
            if let Some(report) = reports.get_mut(&stage) {
                report.state = StageState::Running;
            }
            notifier.status(&format!("Running {} stage", stage));
        }
        StageEvent::Completed(stage, result) => {
            notifier.status(&format!(
                "{} stage finished with exit code {}",
                stage, result.exit_code
            ));
            if let Some(report) = reports.get_mut(&stage) {
                report.state = StageState::Completed;
                report.result = Some(result);
            }
        }
        StageEvent::Rejected(stage, error) => {
            tracing::warn!(stage = %stage, error = %error, "Rejected start request");
            if let Some(report) = reports.get_mut(&stage) {
                report.rejected = report.rejected.saturating_add(1);
            }
        }
    }
}

// =============================================================================
// STAGE TASK
// =============================================================================

/// Serve one stage gate forever: receive, run at most once, respond.
async fn stage_loop(mut gate: GateListener, runner: StageRunner, events: mpsc::Sender<StageEvent>) {
    let stage = gate.stage();
    let mut lifecycle = StageLifecycle::new(stage);
    if let Err(e) = lifecycle.listen() {
        tracing::error!(stage = %stage, error = %e, "Gate lifecycle out of order");
        return;
    }

    loop {
        let GateRequest { token, reply } = match gate.receive_token().await {
            Ok(request) => request,
            Err(e) => {
                if matches!(e, GateError::Io(_)) {
                    tracing::error!(stage = %stage, error = %e, "Gate accept failed");
                    tokio::time::sleep(ACCEPT_ERROR_PAUSE).await;
                } else {
                    lifecycle.reject();
                    let _ = events.send(StageEvent::Rejected(stage, e)).await;
                }
                continue;
            }
        };

        let token = match token.and_then(|t| lifecycle.begin().map(|()| t)) {
            Ok(token) => token,
            Err(e) => {
                if !matches!(e, GateError::ProtocolViolation(_)) {
                    lifecycle.reject();
                }
                let result = StageResult::protocol_violation(e.to_string());
                if let Err(send_err) = reply.send_result(&result).await {
                    tracing::warn!(stage = %stage, error = %send_err, "Could not deliver rejection");
                }
                let _ = events.send(StageEvent::Rejected(stage, e)).await;
                continue;
            }
        };

        tracing::info!(
            stage = %stage,
            correlation = ?token.correlation.as_ref().map(|c| c.as_str()),
            "Start request accepted"
        );
        let _ = events.send(StageEvent::Started(stage)).await;

        let started = Instant::now();
        let result = runner.run(stage).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        if let Err(e) = lifecycle.complete(result.clone()) {
            tracing::error!(stage = %stage, error = %e, "Gate lifecycle out of order");
        }

        if result.is_success() {
            tracing::info!(stage = %stage, elapsed_ms, "Stage completed");
        } else {
            tracing::warn!(
                stage = %stage,
                exit_code = result.exit_code,
                message = %result.message,
                elapsed_ms,
                "Stage failed"
            );
        }

        if let Err(e) = reply.send_result(&result).await {
            tracing::warn!(stage = %stage, error = %e, "Could not deliver stage result");
        }
        let _ = events.send(StageEvent::Completed(stage, result)).await;
    }
}
