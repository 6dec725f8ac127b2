//! Experiment orchestration.
//!
//! An experiment is a [`Module`] that can turn its current property values
//! into a [`ScanPlan`]: a protocol that drives collaborators (camera, axis,
//! shutter, inputs) on a background task, plus the list of devices it needs
//! exclusive use of while running.
//!
//! ```text
//! Controller ──start──> ScanRunner ──prepare()──> ScanPlan
//!     ^                     │
//!     │                     └──spawn──> ScanProtocol::run(&ScanContext)
//!     │                                      │
//!     └────── mpsc ScanMessage ──────────────┘   (Started, Update*, Status*, Finished)
//! ```
//!
//! The task never touches controller-owned state. Updates travel over the
//! channel and are applied on the controller side through
//! [`Experiment::on_update`], [`Experiment::on_status`] and
//! [`Experiment::on_finished`].

pub mod context;
pub mod controller;
pub mod events;
pub mod points;
pub mod protocols;
pub mod runner;
pub mod safety;
pub mod state;

pub use context::{ProgressCycle, ScanContext};
pub use controller::Controller;
pub use events::{ScanEvent, ScanMessage, ScanOutcome, ScanSummary, ScanUpdate};
pub use points::{ScanPointSet, StageRange};
pub use protocols::ScanProtocol;
pub use runner::{ScanRunner, StartOutcome};
pub use state::ScanState;

use parking_lot::RwLock;
use std::fmt;

use crate::error::{AppResult, DaqError};
use crate::hardware::registry::Bound;
use crate::modules::Module;
use crate::property::PropertySet;

/// Event name of the start/stop button.
pub const START_EVENT: &str = "on_start";

/// A module that runs scans.
pub trait Experiment: Module {
    /// Snapshot the properties, resolve collaborators and build the protocol.
    ///
    /// Called on the controller before anything is spawned; an error here
    /// (empty point set, missing collaborator) leaves the experiment idle.
    /// Clears results of the previous run.
    fn prepare(&self) -> AppResult<ScanPlan>;

    /// Label fragment of the start/stop button.
    fn start_control(&self) -> &str {
        "start"
    }

    /// Apply one acquisition (controller side).
    fn on_update(&self, _update: &ScanUpdate) -> AppResult<()> {
        Ok(())
    }

    /// Show a status line; writes the "Status" property when there is one.
    fn on_status(&self, text: &str) -> AppResult<()> {
        if self.properties().has("status") {
            self.properties().set_value("status", text)?;
        }
        Ok(())
    }

    /// Apply the final summary (controller side).
    fn on_finished(&self, _summary: &ScanSummary) -> AppResult<()> {
        Ok(())
    }
}

/// Everything a runner needs to launch one scan.
pub struct ScanPlan {
    /// Protocol executed on the scan task
    pub protocol: Box<dyn ScanProtocol>,
    /// Labels of devices leased for the duration of the scan
    pub devices: Vec<String>,
}

impl ScanPlan {
    /// Plan without leased devices.
    pub fn new(protocol: impl ScanProtocol + 'static) -> Self {
        Self {
            protocol: Box::new(protocol),
            devices: Vec::new(),
        }
    }

    /// Lease `device` while the scan runs.
    pub fn using<T: ?Sized>(mut self, device: &Bound<T>) -> Self {
        self.devices.push(device.label().to_string());
        self
    }

    /// Lease `device` if present.
    pub fn using_optional<T: ?Sized>(self, device: Option<&Bound<T>>) -> Self {
        match device {
            Some(device) => self.using(device),
            None => self,
        }
    }
}

impl fmt::Debug for ScanPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScanPlan")
            .field("devices", &self.devices)
            .finish_non_exhaustive()
    }
}

/// Devices of one capability offered in a choice property.
///
/// Filled during `initialize` from the binding context; the property's
/// selected index picks the device at scan start.
pub struct Collaborators<T: ?Sized> {
    bound: RwLock<Vec<Bound<T>>>,
    with_none: bool,
}

impl<T: ?Sized> Collaborators<T> {
    /// Mandatory collaborator: index `i` selects device `i`.
    pub fn new() -> Self {
        Self {
            bound: RwLock::new(Vec::new()),
            with_none: false,
        }
    }

    /// Optional collaborator: index 0 is "No", index `i` selects device `i - 1`.
    pub fn optional() -> Self {
        Self {
            bound: RwLock::new(Vec::new()),
            with_none: true,
        }
    }

    /// Replace the candidates and the choice list of `query`.
    pub fn bind(&self, properties: &PropertySet, query: &str, found: Vec<Bound<T>>) -> AppResult<()> {
        let mut labels: Vec<String> = Vec::with_capacity(found.len() + 1);
        if self.with_none {
            labels.push("No".to_string());
        }
        labels.extend(found.iter().map(|b| b.label().to_string()));
        properties.set_choices(query, labels)?;
        *self.bound.write() = found;
        Ok(())
    }

    /// Number of candidate devices.
    pub fn len(&self) -> usize {
        self.bound.read().len()
    }

    /// Whether there are no candidates.
    pub fn is_empty(&self) -> bool {
        self.bound.read().is_empty()
    }

    /// Device selected by a choice index, `None` for "No" or out of range.
    pub fn selected(&self, index: usize) -> Option<Bound<T>> {
        let index = if self.with_none {
            index.checked_sub(1)?
        } else {
            index
        };
        self.bound.read().get(index).cloned()
    }

    /// Device selected by a choice index, or [`DaqError::CollaboratorMissing`].
    pub fn require(&self, index: usize, experiment: &str, capability: &'static str) -> AppResult<Bound<T>> {
        self.selected(index).ok_or_else(|| DaqError::CollaboratorMissing {
            experiment: experiment.to_string(),
            capability,
        })
    }
}

impl<T: ?Sized> Default for Collaborators<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: ?Sized> fmt::Debug for Collaborators<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let labels: Vec<String> = self.bound.read().iter().map(|b| b.label().to_string()).collect();
        f.debug_struct("Collaborators")
            .field("bound", &labels)
            .field("with_none", &self.with_none)
            .finish()
    }
}
