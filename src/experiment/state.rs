//! Scan lifecycle state.
//!
//! Each experiment module owns one [`ScanState`], advanced only by the
//! controller. The worker task never touches it.

use serde::{Deserialize, Serialize};

/// Lifecycle of one experiment's scan task.
///
/// # State Machine
///
/// ```text
/// Idle ──start──> Starting ──spawned──> Running ──task ends──> Finished ──joined──> Idle
///                    │                     │                       ▲
///                    │ prepare/lease error │ stop                  │
///                    ▼                     ▼                       │
///                   Idle                Stopping ──task ends───────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScanState {
    /// No task alive
    Idle,
    /// Parameters snapshotted, task being spawned
    Starting,
    /// Task executing its protocol
    Running,
    /// Cancellation requested, task not yet exited
    Stopping,
    /// Task exited, waiting for the controller to reconcile
    Finished,
}

impl std::fmt::Display for ScanState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScanState::Idle => write!(f, "Idle"),
            ScanState::Starting => write!(f, "Starting"),
            ScanState::Running => write!(f, "Running"),
            ScanState::Stopping => write!(f, "Stopping"),
            ScanState::Finished => write!(f, "Finished"),
        }
    }
}

impl ScanState {
    /// Check if a new scan may be started.
    pub fn can_start(&self) -> bool {
        matches!(self, ScanState::Idle)
    }

    /// Check if a stop request is meaningful.
    pub fn can_stop(&self) -> bool {
        matches!(self, ScanState::Starting | ScanState::Running)
    }

    /// Check if a task may still be alive.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            ScanState::Starting | ScanState::Running | ScanState::Stopping
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_predicates() {
        assert!(ScanState::Idle.can_start());
        assert!(!ScanState::Running.can_start());
        assert!(!ScanState::Finished.can_start());

        assert!(ScanState::Running.can_stop());
        assert!(!ScanState::Stopping.can_stop());

        assert!(ScanState::Stopping.is_active());
        assert!(!ScanState::Finished.is_active());
    }

    #[test]
    fn test_state_display() {
        assert_eq!(ScanState::Stopping.to_string(), "Stopping");
        assert_eq!(ScanState::Idle.to_string(), "Idle");
    }
}
