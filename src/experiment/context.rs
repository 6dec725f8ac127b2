//! Per-run execution context handed to a scan protocol.
//!
//! Bundles the cancel token, the event sender and the timing policy so
//! protocols never wait or report without observing cancellation.

use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::{StageConfig, TimingConfig};
use crate::error::{AppResult, DaqError};
use crate::experiment::events::{ScanEvent, ScanMessage, ScanUpdate};
use crate::hardware::cancel::CancelToken;
use crate::hardware::capabilities::Axis;

/// Bound on the uncancellable wait used when returning the axis during
/// cleanup, as a multiple of the travel estimate.
const RETURN_WAIT_FACTOR: u32 = 4;

/// Live context of one scan task.
#[derive(Debug, Clone)]
pub struct ScanContext {
    run_id: Uuid,
    experiment: String,
    cancel: CancelToken,
    events: mpsc::Sender<ScanMessage>,
    timing: TimingConfig,
    stage: StageConfig,
}

impl ScanContext {
    /// Create the context for run `run_id` of `experiment`.
    pub fn new(
        run_id: Uuid,
        experiment: impl Into<String>,
        cancel: CancelToken,
        events: mpsc::Sender<ScanMessage>,
        timing: TimingConfig,
        stage: StageConfig,
    ) -> Self {
        Self {
            run_id,
            experiment: experiment.into(),
            cancel,
            events,
            timing,
            stage,
        }
    }

    /// Run identifier.
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Registry label of the experiment.
    pub fn experiment(&self) -> &str {
        &self.experiment
    }

    /// Token observed by every wait.
    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Whether a stop was requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Pacing policy.
    pub fn timing(&self) -> &TimingConfig {
        &self.timing
    }

    /// Stage travel heuristic.
    pub fn stage(&self) -> &StageConfig {
        &self.stage
    }

    /// Cancellable sleep; `true` if the full duration elapsed.
    pub async fn sleep(&self, duration: Duration) -> bool {
        if duration.is_zero() {
            return !self.cancel.is_cancelled();
        }
        self.cancel.sleep(duration).await
    }

    /// Send an event to the controller.
    ///
    /// A closed channel means nobody is listening any more; the run is
    /// cancelled so the protocol unwinds through its cleanup.
    pub async fn emit(&self, event: ScanEvent) -> AppResult<()> {
        let message = ScanMessage {
            experiment: self.experiment.clone(),
            event,
        };
        self.events.send(message).await.map_err(|_| {
            self.cancel.cancel();
            DaqError::ScanTask("controller event channel closed".to_string())
        })
    }

    /// Send an acquisition update.
    pub async fn update(&self, update: ScanUpdate) -> AppResult<()> {
        self.emit(ScanEvent::Update(update)).await
    }

    /// Send a status line.
    pub async fn status(&self, text: impl Into<String>) -> AppResult<()> {
        self.emit(ScanEvent::Status { text: text.into() }).await
    }

    /// Command a move and wait for the axis to settle.
    ///
    /// Returns `false` if cancelled while waiting. The travel estimate is a
    /// soft bound: exceeding it is logged once, completion is only ever
    /// confirmed by `is_moving()`.
    pub async fn move_axis(&self, axis: &dyn Axis, target: f64) -> AppResult<bool> {
        let from = axis.pos().await?;
        axis.goto(target).await?;
        let estimate = self.stage.travel_estimate(target - from);
        debug!(experiment = %self.experiment, from, target, ?estimate, "axis move");
        self.wait_settled(axis, target, estimate, true).await
    }

    /// Return the axis during cleanup.
    ///
    /// Ignores cancellation (cleanup runs after a stop) but gives up after a
    /// bounded multiple of the travel estimate.
    pub async fn return_axis(&self, axis: &dyn Axis, target: f64) -> AppResult<()> {
        let from = axis.pos().await?;
        axis.goto(target).await?;
        let estimate = self.stage.travel_estimate(target - from);
        self.wait_settled(axis, target, estimate, false).await?;
        Ok(())
    }

    async fn wait_settled(
        &self,
        axis: &dyn Axis,
        target: f64,
        estimate: Duration,
        cancellable: bool,
    ) -> AppResult<bool> {
        let started = Instant::now();
        let limit = estimate * RETURN_WAIT_FACTOR + Duration::from_secs(1);
        let mut warned = false;

        loop {
            if !axis.is_moving().await? {
                return Ok(true);
            }

            let elapsed = started.elapsed();
            if !warned && elapsed > estimate {
                warn!(
                    experiment = %self.experiment,
                    target,
                    ?estimate,
                    "axis still moving after its travel estimate"
                );
                warned = true;
            }

            if cancellable {
                if !self.cancel.sleep(self.timing.poll_interval()).await {
                    return Ok(false);
                }
            } else {
                if elapsed > limit {
                    warn!(experiment = %self.experiment, target, "gave up waiting for axis");
                    return Ok(false);
                }
                tokio::time::sleep(self.timing.poll_interval()).await;
            }
        }
    }
}

/// Cycling progress-bar sequence.
///
/// Each call to [`ProgressCycle::advance`] yields the next value and wraps
/// around at the end, so repeated sets keep the bar moving.
#[derive(Debug, Clone)]
pub struct ProgressCycle {
    values: Vec<f64>,
    next: usize,
}

impl ProgressCycle {
    /// `total` integer percentages evenly spread over `0..=100`.
    pub fn spread(total: usize) -> Self {
        let values = match total {
            0 => vec![100.0],
            1 => vec![0.0],
            n => (0..n)
                .map(|i| (i as f64 * 100.0 / (n - 1) as f64).trunc())
                .collect(),
        };
        Self { values, next: 0 }
    }

    /// `0, 100/total, ..., 100` in integer percent; the leading zero is
    /// consumed when the bar is reset at scan start.
    pub fn stepped(total: usize) -> Self {
        let total = total.max(1);
        let values = (0..=total).map(|i| (i * 100 / total) as f64).collect();
        Self { values, next: 0 }
    }

    /// Next value.
    pub fn advance(&mut self) -> f64 {
        let value = self.values[self.next % self.values.len()];
        self.next = (self.next + 1) % self.values.len();
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::DummyAxis;
    use crate::modules::Module;

    fn context(cancel: CancelToken) -> (ScanContext, mpsc::Receiver<ScanMessage>) {
        let (tx, rx) = mpsc::channel(8);
        let ctx = ScanContext::new(
            Uuid::new_v4(),
            "DAQ Scan",
            cancel,
            tx,
            TimingConfig::immediate(),
            StageConfig::default(),
        );
        (ctx, rx)
    }

    #[tokio::test]
    async fn test_emit_is_addressed() {
        let (ctx, mut rx) = context(CancelToken::new());
        ctx.status("moving").await.unwrap();
        let message = rx.recv().await.unwrap();
        assert_eq!(message.experiment, "DAQ Scan");
        assert_eq!(
            message.event,
            ScanEvent::Status {
                text: "moving".into()
            }
        );
    }

    #[tokio::test]
    async fn test_closed_channel_cancels_run() {
        let (ctx, rx) = context(CancelToken::new());
        drop(rx);
        assert!(ctx.status("nobody home").await.is_err());
        assert!(ctx.is_cancelled());
    }

    #[tokio::test]
    async fn test_move_axis_waits_until_settled() {
        let (ctx, _rx) = context(CancelToken::new());
        let axis = DummyAxis::new().unwrap();
        axis.properties().set_value("speed", 1i64).unwrap();

        assert!(ctx.move_axis(&axis, 200.0).await.unwrap());
        assert!(!axis.is_moving().await.unwrap());
        assert_eq!(axis.pos().await.unwrap(), 200.0);
    }

    #[tokio::test]
    async fn test_move_axis_observes_cancel() {
        let cancel = CancelToken::new();
        let (ctx, _rx) = context(cancel.clone());
        let axis = DummyAxis::new().unwrap();
        axis.properties().set_value("speed", 1i64).unwrap();

        cancel.cancel();
        // 100_000 units at the slow speed takes ten seconds
        let started = Instant::now();
        assert!(!ctx.move_axis(&axis, 100_000.0).await.unwrap());
        assert!(started.elapsed() < Duration::from_secs(2));

        // cleanup still gets the axis home despite the cancel
        axis.properties().set_value("speed", 0i64).unwrap();
        ctx.return_axis(&axis, 0.0).await.unwrap();
        assert_eq!(axis.pos().await.unwrap(), 0.0);
    }

    #[test]
    fn test_progress_spread_cycles() {
        let mut progress = ProgressCycle::spread(3);
        assert_eq!(progress.advance(), 0.0);
        assert_eq!(progress.advance(), 50.0);
        assert_eq!(progress.advance(), 100.0);
        assert_eq!(progress.advance(), 0.0);
    }

    #[test]
    fn test_progress_stepped_integer_percent() {
        let mut progress = ProgressCycle::stepped(3);
        let values: Vec<_> = (0..4).map(|_| progress.advance()).collect();
        assert_eq!(values, vec![0.0, 33.0, 66.0, 100.0]);
    }
}
