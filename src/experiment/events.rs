//! Messages sent from a scan task to the controller.
//!
//! The worker never writes controller-owned state. Everything it produces
//! travels as a [`ScanMessage`] over a bounded `tokio::sync::mpsc` channel and
//! is applied by the controller in arrival order.

use serde::Serialize;
use uuid::Uuid;

use crate::hardware::SpectrumFrame;

/// Shutter state during an acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ShutterState {
    /// Actinic pump blocked: ground state
    Closed,
    /// Actinic pump passing: excited state
    Open,
}

impl ShutterState {
    /// Output level commanding this state.
    pub fn is_open(self) -> bool {
        matches!(self, ShutterState::Open)
    }
}

/// Raw result of one acquisition.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Measurement {
    /// Camera burst
    Spectrum(SpectrumFrame),
    /// Scalar input reading
    Scalar {
        /// Reading
        value: f64,
    },
    /// Scalar reading at one point of a two-axis grid
    Grid {
        /// Setpoint of the first axis
        x: f64,
        /// Setpoint of the second axis
        y: f64,
        /// Reading
        value: f64,
    },
}

impl Measurement {
    /// Whether the value is a placeholder rather than data.
    pub fn is_degraded(&self) -> bool {
        match self {
            Measurement::Spectrum(frame) => frame.degraded,
            Measurement::Scalar { .. } | Measurement::Grid { .. } => false,
        }
    }
}

/// One acquired point.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScanUpdate {
    /// Set index, from 0
    pub set: usize,
    /// Index into the visiting order; `None` for acquisitions outside the
    /// point loop (ground state, background)
    pub point: Option<usize>,
    /// Stage position of the acquisition
    pub position: f64,
    /// Shutter state during the acquisition
    pub shutter: ShutterState,
    /// Acquired data
    pub measurement: Measurement,
    /// Progress bar value after this update, if it advances the bar
    pub progress: Option<f64>,
}

/// How a scan ended.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", content = "reason", rename_all = "lowercase")]
pub enum ScanOutcome {
    /// Every set ran to completion
    Completed,
    /// Stopped through the cancel token
    Cancelled,
    /// Aborted by an error or panic; cleanup still ran
    Failed(String),
}

/// Averaged auxiliary signal recorded alongside the main scan.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReferenceTrace {
    /// Positions in visiting order
    pub positions: Vec<f64>,
    /// Mean reading per position over completed sets
    pub values: Vec<f64>,
}

impl ReferenceTrace {
    /// `(position, value)` rows sorted by position.
    pub fn sorted_rows(&self) -> Vec<(f64, f64)> {
        let mut rows: Vec<_> = self
            .positions
            .iter()
            .copied()
            .zip(self.values.iter().copied())
            .collect();
        rows.sort_by(|a, b| a.0.total_cmp(&b.0));
        rows
    }
}

/// Final message of every scan task.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScanSummary {
    /// Run identifier
    pub run_id: Uuid,
    /// Termination path
    pub outcome: ScanOutcome,
    /// Number of sets that ran to completion
    pub completed_sets: usize,
    /// Reference signal, when one was recorded
    pub reference: Option<ReferenceTrace>,
}

/// Event emitted by a scan task.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum ScanEvent {
    /// The task entered its protocol
    Started {
        /// Run identifier
        run_id: Uuid,
    },
    /// One acquisition
    Update(ScanUpdate),
    /// Free-text status line
    Status {
        /// Message
        text: String,
    },
    /// The task is about to exit; exactly one per run
    Finished(ScanSummary),
}

/// A [`ScanEvent`] addressed to the experiment that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanMessage {
    /// Registry label of the experiment
    pub experiment: String,
    /// Payload
    pub event: ScanEvent,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_rows_sorted_by_position() {
        let trace = ReferenceTrace {
            positions: vec![300.0, -100.0, 50.0],
            values: vec![3.0, 1.0, 2.0],
        };
        assert_eq!(
            trace.sorted_rows(),
            vec![(-100.0, 1.0), (50.0, 2.0), (300.0, 3.0)]
        );
    }

    #[test]
    fn test_degraded_measurement() {
        let placeholder = Measurement::Spectrum(SpectrumFrame::placeholder(4));
        assert!(placeholder.is_degraded());
        assert!(!Measurement::Scalar { value: 0.0 }.is_degraded());
    }

    #[test]
    fn test_event_serializes_with_tag() {
        let event = ScanEvent::Status {
            text: "position 150fs, set 1/3".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "status");
        assert_eq!(json["text"], "position 150fs, set 1/3");
    }
}
