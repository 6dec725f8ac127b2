//! Scan task lifecycle for one experiment.
//!
//! [`ScanRunner::start`] prepares the plan on the caller's task, leases the
//! plan's devices and spawns the driver. The driver runs the protocol, then
//! its cleanup on every exit path (panics included), and sends exactly one
//! [`ScanEvent::Finished`]. The controller calls [`ScanRunner::finish`] when
//! that event arrives to join the task and return to [`ScanState::Idle`].

use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{StageConfig, TimingConfig};
use crate::error::{AppResult, DaqError};
use crate::experiment::context::ScanContext;
use crate::experiment::events::{ScanEvent, ScanMessage, ScanOutcome, ScanSummary};
use crate::experiment::protocols::ScanProtocol;
use crate::experiment::state::ScanState;
use crate::experiment::Experiment;
use crate::hardware::cancel::CancelToken;
use crate::hardware::registry::{DeviceLeases, LeaseGuard};

/// Caption of the start control while a scan runs.
pub const STOP_CAPTION: &str = "STOP";

/// Result of a start request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// A new task was spawned
    Started(Uuid),
    /// A task is still alive; nothing was done
    AlreadyRunning,
}

/// Owns the cancel and join handles of one experiment's scan task.
pub struct ScanRunner {
    experiment: String,
    events: mpsc::Sender<ScanMessage>,
    timing: TimingConfig,
    stage: StageConfig,
    state: ScanState,
    run_id: Option<Uuid>,
    cancel: Option<CancelToken>,
    task: Option<JoinHandle<()>>,
    /// Start control caption to restore after the run
    caption: Option<String>,
}

impl ScanRunner {
    /// Idle runner for the experiment registered as `experiment`.
    pub fn new(
        experiment: impl Into<String>,
        events: mpsc::Sender<ScanMessage>,
        timing: TimingConfig,
        stage: StageConfig,
    ) -> Self {
        Self {
            experiment: experiment.into(),
            events,
            timing,
            stage,
            state: ScanState::Idle,
            run_id: None,
            cancel: None,
            task: None,
            caption: None,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ScanState {
        self.state
    }

    /// Identifier of the current or last run.
    pub fn run_id(&self) -> Option<Uuid> {
        self.run_id
    }

    /// Whether a task may still be alive.
    pub fn is_active(&self) -> bool {
        self.state.is_active()
    }

    /// Prepare, lease and spawn.
    ///
    /// A second start while a task exists is a no-op. Prepare and lease
    /// errors leave the runner idle and nothing is spawned.
    pub fn start(
        &mut self,
        experiment: &Arc<dyn Experiment>,
        leases: &DeviceLeases,
    ) -> AppResult<StartOutcome> {
        if !self.state.can_start() || self.task.is_some() {
            debug!(experiment = %self.experiment, state = %self.state, "start ignored");
            return Ok(StartOutcome::AlreadyRunning);
        }
        self.state = ScanState::Starting;

        let launched = self.launch(experiment, leases);
        if launched.is_err() {
            self.state = ScanState::Idle;
        }
        launched
    }

    fn launch(
        &mut self,
        experiment: &Arc<dyn Experiment>,
        leases: &DeviceLeases,
    ) -> AppResult<StartOutcome> {
        let plan = experiment.prepare()?;
        let lease = leases.acquire(&self.experiment, &plan.devices)?;

        let control = experiment.start_control().to_string();
        let properties = experiment.properties();
        if properties.has(&control) {
            let caption = properties.value(&control)?.as_text();
            properties.set_value(&control, STOP_CAPTION)?;
            self.caption = Some(caption);
        }

        let run_id = Uuid::new_v4();
        let cancel = CancelToken::new();
        let ctx = ScanContext::new(
            run_id,
            self.experiment.clone(),
            cancel.clone(),
            self.events.clone(),
            self.timing.clone(),
            self.stage.clone(),
        );
        info!(
            experiment = %self.experiment,
            %run_id,
            devices = ?lease.devices(),
            "scan starting"
        );

        self.task = Some(tokio::spawn(drive(ctx, plan.protocol, lease)));
        self.cancel = Some(cancel);
        self.run_id = Some(run_id);
        self.state = ScanState::Running;
        Ok(StartOutcome::Started(run_id))
    }

    /// Request cancellation; returns whether a running task was signalled.
    pub fn stop(&mut self) -> bool {
        if !self.state.can_stop() {
            return false;
        }
        if let Some(cancel) = &self.cancel {
            cancel.cancel();
        }
        self.state = ScanState::Stopping;
        info!(experiment = %self.experiment, run_id = ?self.run_id, "scan stop requested");
        true
    }

    /// Join the finished task and restore the start control.
    pub async fn finish(&mut self, experiment: &dyn Experiment) -> AppResult<()> {
        self.state = ScanState::Finished;
        let joined = match self.task.take() {
            Some(task) => task
                .await
                .map_err(|e| DaqError::ScanTask(format!("scan task join failed: {e}"))),
            None => Ok(()),
        };
        self.cancel = None;

        if let Some(caption) = self.caption.take() {
            experiment
                .properties()
                .set_value(experiment.start_control(), caption)?;
        }
        self.state = ScanState::Idle;
        debug!(experiment = %self.experiment, "scan task joined");
        joined
    }
}

impl std::fmt::Debug for ScanRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanRunner")
            .field("experiment", &self.experiment)
            .field("state", &self.state)
            .field("run_id", &self.run_id)
            .finish_non_exhaustive()
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "scan task panicked".to_string()
    }
}

/// Body of the scan task.
async fn drive(ctx: ScanContext, mut protocol: Box<dyn ScanProtocol>, lease: LeaseGuard) {
    let run_id = ctx.run_id();
    if let Err(e) = ctx.emit(ScanEvent::Started { run_id }).await {
        warn!(experiment = ctx.experiment(), error = %e, "could not report scan start");
    }

    let ran = AssertUnwindSafe(protocol.run(&ctx)).catch_unwind().await;
    let mut outcome = match ran {
        Ok(Ok(())) if ctx.is_cancelled() => ScanOutcome::Cancelled,
        Ok(Ok(())) => ScanOutcome::Completed,
        Ok(Err(e)) => {
            error!(experiment = ctx.experiment(), %run_id, error = %e, "scan failed");
            ScanOutcome::Failed(e.to_string())
        }
        Err(payload) => {
            let reason = panic_message(payload);
            error!(experiment = ctx.experiment(), %run_id, %reason, "scan panicked");
            ScanOutcome::Failed(reason)
        }
    };

    let cleaned = AssertUnwindSafe(protocol.cleanup(&ctx)).catch_unwind().await;
    let cleanup_failure = match cleaned {
        Ok(Ok(())) => None,
        Ok(Err(e)) => Some(e.to_string()),
        Err(payload) => Some(panic_message(payload)),
    };
    if let Some(reason) = cleanup_failure {
        error!(experiment = ctx.experiment(), %run_id, %reason, "scan cleanup failed");
        if !matches!(outcome, ScanOutcome::Failed(_)) {
            outcome = ScanOutcome::Failed(format!("cleanup: {reason}"));
        }
    }
    drop(lease);

    let summary = ScanSummary {
        run_id,
        outcome,
        completed_sets: protocol.completed_sets(),
        reference: protocol.reference(),
    };
    info!(
        experiment = ctx.experiment(),
        %run_id,
        outcome = ?summary.outcome,
        completed_sets = summary.completed_sets,
        "scan finished"
    );
    if let Err(e) = ctx.emit(ScanEvent::Finished(summary)).await {
        warn!(experiment = ctx.experiment(), error = %e, "could not report scan end");
    }
}
