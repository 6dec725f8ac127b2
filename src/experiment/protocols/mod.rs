//! Scan protocols and the experiments that launch them.
//!
//! Each submodule pairs an experiment module (properties, collaborator
//! binding, controller-side handling of updates) with the protocol it runs on
//! the scan task:
//!
//! | Module | Protocol |
//! |---|---|
//! | [`fsrs_scan::FsrsScan`] | ground/excited spectra over sets × delay points |
//! | [`acquire::FsrsAcquire`] | repeated bursts at a fixed delay, or continuous focus mode |
//! | [`xc_scan::XcScan`] | cross-correlation map, one row per delay |
//! | [`daq_scan::DaqScan`] | scalar input versus stage position |
//! | [`monitor::DaqMonitor`] | long scalar record with drift detection |
//! | [`grid_optimize::GridOptimize`] | shrinking grid search of two actuators for an input minimum |
//!
//! Protocols observe the [`ScanContext`] cancel token at every wait. Whatever
//! `run` returns, the runner calls `cleanup` exactly once afterwards.

pub mod acquire;
pub mod daq_scan;
pub mod fsrs_scan;
pub mod grid_optimize;
pub mod monitor;
pub mod xc_scan;

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::error::AppResult;
use crate::experiment::context::ScanContext;
use crate::experiment::events::{ReferenceTrace, ShutterState};
use crate::hardware::capabilities::{Camera, Output};
use crate::hardware::registry::Bound;
use crate::hardware::{OutputValue, SpectrumFrame};

pub use acquire::FsrsAcquire;
pub use daq_scan::DaqScan;
pub use fsrs_scan::FsrsScan;
pub use grid_optimize::GridOptimize;
pub use monitor::DaqMonitor;
pub use xc_scan::XcScan;

/// Device choreography executed on the scan task.
#[async_trait]
pub trait ScanProtocol: Send {
    /// Run until done, cancelled or failed.
    ///
    /// Returning `Ok` after observing cancellation is the normal stop path.
    async fn run(&mut self, ctx: &ScanContext) -> AppResult<()>;

    /// Put the hardware back: axis home, shutter closed, settings restored.
    ///
    /// Runs after `run` on every exit path, including errors and panics.
    async fn cleanup(&mut self, ctx: &ScanContext) -> AppResult<()>;

    /// Sets that ran to completion.
    fn completed_sets(&self) -> usize;

    /// Averaged reference signal, when one was recorded.
    fn reference(&self) -> Option<ReferenceTrace> {
        None
    }
}

/// Command a shutter state.
pub(crate) async fn set_shutter(shutter: &Bound<dyn Output>, state: ShutterState) -> AppResult<()> {
    shutter
        .device()
        .write(OutputValue::Digital(state.is_open()))
        .await?;
    Ok(())
}

/// Read one chopped burst, logging degraded frames that were not caused by
/// a stop request.
pub(crate) async fn acquire_spectrum(
    camera: &Bound<dyn Camera>,
    frames: usize,
    ctx: &ScanContext,
) -> AppResult<SpectrumFrame> {
    let frame = camera
        .device()
        .read_n_frames(frames, ctx.cancel_token())
        .await?;
    if frame.degraded && !ctx.is_cancelled() {
        warn!(
            experiment = ctx.experiment(),
            camera = camera.label(),
            frames,
            "camera returned a placeholder frame"
        );
    }
    Ok(frame)
}

/// Empty choice list for collaborator properties filled during binding.
pub(crate) const NO_CHOICES: [&str; 0] = [];

/// Directory named by a path property; empty means the working directory.
pub(crate) fn output_dir(text: &str) -> PathBuf {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        PathBuf::from(".")
    } else {
        PathBuf::from(trimmed)
    }
}

/// `{stem}_{index}{ext}` next to `path`; the extension defaults to `.txt`.
pub(crate) fn indexed_path(path: &Path, index: usize) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_else(|| ".txt".to_string());
    path.with_file_name(format!("{stem}_{index}{ext}"))
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Arc;
    use tokio::sync::mpsc;
    use uuid::Uuid;

    use crate::config::{StageConfig, TimingConfig};
    use crate::experiment::context::ScanContext;
    use crate::experiment::events::{ScanEvent, ScanMessage};
    use crate::experiment::Experiment;
    use crate::hardware::cancel::CancelToken;
    use crate::hardware::chopper::ChopperSettings;
    use crate::hardware::mock::{DummyAxis, DummyCamera, DummySensor, DummyShutter};
    use crate::hardware::registry::ModuleRegistry;
    use crate::modules::{ModuleEntry, ModuleStatus};

    /// Pixel count of the bench camera.
    pub(crate) const BENCH_WIDTH: usize = 8;

    /// Camera, sensor, axis and shutter followed by one experiment, all
    /// initialized in load order.
    pub(crate) struct Bench {
        pub(crate) registry: ModuleRegistry,
        pub(crate) camera: Arc<DummyCamera>,
        pub(crate) sensor: Arc<DummySensor>,
        pub(crate) axis: Arc<DummyAxis>,
        pub(crate) shutter: Arc<DummyShutter>,
    }

    impl Bench {
        pub(crate) async fn new(experiment: ModuleEntry) -> Self {
            let chopper = ChopperSettings {
                settle_frames: 0,
                ..ChopperSettings::default()
            };
            let camera = Arc::new(DummyCamera::with_settings(BENCH_WIDTH, chopper).unwrap());
            let sensor = Arc::new(DummySensor::new().unwrap());
            let axis = Arc::new(DummyAxis::new().unwrap());
            let shutter = Arc::new(DummyShutter::new().unwrap());
            let registry = ModuleRegistry::new(vec![
                ModuleEntry::camera(camera.clone()),
                ModuleEntry::input(sensor.clone()),
                ModuleEntry::axis(axis.clone()),
                ModuleEntry::output(shutter.clone()),
                experiment,
            ]);
            for position in 0..registry.len() {
                let module = registry.get(position).unwrap();
                module
                    .module()
                    .initialize(&registry.binding_context(position))
                    .await
                    .unwrap();
                module.set_status(ModuleStatus::Ready);
            }
            Self {
                registry,
                camera,
                sensor,
                axis,
                shutter,
            }
        }
    }

    /// Context with immediate timing and a roomy event channel.
    pub(crate) fn context(experiment: &str) -> (ScanContext, mpsc::Receiver<ScanMessage>) {
        let (tx, rx) = mpsc::channel(256);
        let ctx = ScanContext::new(
            Uuid::new_v4(),
            experiment,
            CancelToken::new(),
            tx,
            TimingConfig::immediate(),
            StageConfig::default(),
        );
        (ctx, rx)
    }

    /// Drain queued events, applying updates and status lines the way the
    /// controller does.
    pub(crate) fn apply_events(
        rx: &mut mpsc::Receiver<ScanMessage>,
        experiment: &dyn Experiment,
    ) -> Vec<ScanEvent> {
        let mut events = Vec::new();
        while let Ok(message) = rx.try_recv() {
            match &message.event {
                ScanEvent::Update(update) => experiment.on_update(update).unwrap(),
                ScanEvent::Status { text } => experiment.on_status(text).unwrap(),
                _ => {}
            }
            events.push(message.event);
        }
        events
    }
}
