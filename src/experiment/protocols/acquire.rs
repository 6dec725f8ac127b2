//! FSRS acquire: repeated camera bursts at a fixed delay.
//!
//! Every burst updates the incremental mean and is kept as an intermediate
//! set. With "Continuous" checked the experiment becomes the alignment loop:
//! it reads bursts until stopped and only the latest one is kept.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::data::{ColumnTable, FrameAccumulator, MeasurementMode, ResultSink, TsvFileSink};
use crate::error::AppResult;
use crate::experiment::context::ScanContext;
use crate::experiment::events::{Measurement, ScanUpdate, ShutterState};
use crate::experiment::protocols::{acquire_spectrum, indexed_path, ScanProtocol, NO_CHOICES};
use crate::experiment::{Collaborators, Experiment, ScanPlan, START_EVENT};
use crate::hardware::capabilities::Camera;
use crate::hardware::registry::{BindingContext, Bound};
use crate::modules::Module;
use crate::property::{PropertyKind, PropertySet, PropertySpec};

/// Pause between bursts in continuous mode.
const FOCUS_INTERVAL: Duration = Duration::from_millis(50);

const MEASUREMENT_CHOICES: [&str; 3] = ["FSRS", "TA", "T/T0"];

struct AcquireRun {
    mode: MeasurementMode,
    sets: usize,
    continuous: bool,
    data: FrameAccumulator,
}

/// Fixed-delay spectrum acquisition.
pub struct FsrsAcquire {
    properties: PropertySet,
    cameras: Collaborators<dyn Camera>,
    sink: Arc<dyn ResultSink>,
    run: Mutex<Option<AcquireRun>>,
}

impl FsrsAcquire {
    /// Experiment saving through a [`TsvFileSink`].
    pub fn new() -> AppResult<Self> {
        let properties = PropertySet::from_specs(vec![
            PropertySpec::new("Camera", PropertyKind::Choice, 0).choices(NO_CHOICES),
            PropertySpec::new("Mode", PropertyKind::Choice, 0).choices(MEASUREMENT_CHOICES),
            PropertySpec::new("# of Frames", PropertyKind::Spin, 8000).info(json!([2, 20000])),
            PropertySpec::new("# of Sets", PropertyKind::Spin, 1).info(json!([1, 20000])),
            PropertySpec::new("Continuous", PropertyKind::Checkbox, false).info("focus mode"),
            PropertySpec::new("Progress", PropertyKind::Progress, 0),
            PropertySpec::new("Save Last", PropertyKind::Button, "Save").event("on_save"),
            PropertySpec::new("Save To", PropertyKind::File, "fsrs_acquire.dat").info("save"),
            PropertySpec::new("Start", PropertyKind::Button, "Acquire").event(START_EVENT),
        ])?;
        Ok(Self {
            properties,
            cameras: Collaborators::new(),
            sink: Arc::new(TsvFileSink::new()),
            run: Mutex::new(None),
        })
    }

    /// Default save location, relative to `dir`.
    pub fn with_output_dir(self, dir: &str) -> AppResult<Self> {
        let file = PathBuf::from(dir).join("fsrs_acquire.dat");
        self.properties
            .set_value("save to", file.to_string_lossy().into_owned())?;
        Ok(self)
    }

    /// Write results through `sink` instead of the file system.
    pub fn with_sink(mut self, sink: Arc<dyn ResultSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Write the mean of the last acquisition to "Save To", plus one file per
    /// set when more than one was kept. Returns the number of files written.
    pub fn save(&self) -> AppResult<usize> {
        let guard = self.run.lock();
        let Some(data) = guard.as_ref().map(|run| &run.data).filter(|d| !d.is_empty()) else {
            warn!(experiment = self.name(), "nothing to save yet");
            return Ok(0);
        };

        let path = PathBuf::from(self.properties.value("save to")?.as_text().trim());
        self.sink
            .write_table(&path, &ColumnTable::from_columns(data.mean())?)?;
        let mut written = 1;
        if data.retained_len() > 1 {
            for index in 0..data.retained_len() {
                if let Some(set) = data.retained(index) {
                    self.sink
                        .write_table(&indexed_path(&path, index), &ColumnTable::from_columns(set)?)?;
                    written += 1;
                }
            }
        }
        info!(experiment = self.name(), path = %path.display(), files = written, "acquisition saved");
        Ok(written)
    }
}

#[async_trait]
impl Module for FsrsAcquire {
    fn name(&self) -> &str {
        "FSRS Acquire"
    }

    fn properties(&self) -> &PropertySet {
        &self.properties
    }

    async fn initialize(&self, ctx: &BindingContext<'_>) -> AppResult<()> {
        self.cameras.bind(&self.properties, "camera", ctx.cameras())
    }

    fn handle_event(&self, event: &str) -> AppResult<()> {
        if event == "on_save" {
            self.save()?;
        }
        Ok(())
    }
}

impl Experiment for FsrsAcquire {
    fn prepare(&self) -> AppResult<ScanPlan> {
        let snapshot = self.properties.snapshot();
        let camera = self.cameras.require(snapshot.index("camera")?, self.name(), "camera")?;
        let mode = MeasurementMode::from_index(snapshot.index("mode")?);
        let frames = snapshot.count("frames")?;
        let sets = snapshot.count("sets")?.max(1);
        let continuous = snapshot.flag("continuous")?;

        self.properties.set_value("progress", 0.0)?;
        *self.run.lock() = Some(AcquireRun {
            mode,
            sets,
            continuous,
            data: FrameAccumulator::retaining(),
        });
        info!(experiment = self.name(), %mode, frames, sets, continuous, "acquisition prepared");

        let protocol = AcquireProtocol {
            camera: camera.clone(),
            frames,
            sets: (!continuous).then_some(sets),
            completed: 0,
        };
        Ok(ScanPlan::new(protocol).using(&camera))
    }

    fn on_update(&self, update: &ScanUpdate) -> AppResult<()> {
        let Measurement::Spectrum(frame) = &update.measurement else {
            return Ok(());
        };
        let mut guard = self.run.lock();
        let Some(run) = guard.as_mut() else {
            return Ok(());
        };
        if frame.degraded {
            warn!(experiment = self.name(), set = update.set, "placeholder spectrum skipped");
            return Ok(());
        }

        let a = run.mode.transform(&frame.ratio);
        if run.continuous {
            run.data.reset();
        }
        run.data
            .push([a.as_slice(), frame.channel_a.as_slice(), frame.channel_b.as_slice()])?;

        if !run.continuous {
            let percent = (run.data.count() * 100 / run.sets).min(100);
            drop(guard);
            self.properties.set_value("progress", percent as f64)?;
        }
        Ok(())
    }
}

// =============================================================================
// Protocol
// =============================================================================

struct AcquireProtocol {
    camera: Bound<dyn Camera>,
    frames: usize,
    /// `None` runs until cancelled
    sets: Option<usize>,
    completed: usize,
}

#[async_trait]
impl ScanProtocol for AcquireProtocol {
    async fn run(&mut self, ctx: &ScanContext) -> AppResult<()> {
        if !ctx.sleep(ctx.timing().pre_scan_delay()).await {
            return Ok(());
        }
        while self.sets.map_or(true, |sets| self.completed < sets) {
            let frame = acquire_spectrum(&self.camera, self.frames, ctx).await?;
            if ctx.is_cancelled() {
                break;
            }
            ctx.update(ScanUpdate {
                set: self.completed,
                point: None,
                position: 0.0,
                shutter: ShutterState::Open,
                measurement: Measurement::Spectrum(frame),
                progress: None,
            })
            .await?;
            self.completed += 1;

            if self.sets.is_none() && !ctx.sleep(FOCUS_INTERVAL).await {
                break;
            }
        }
        debug!(experiment = ctx.experiment(), bursts = self.completed, "acquisition loop done");
        Ok(())
    }

    async fn cleanup(&mut self, _ctx: &ScanContext) -> AppResult<()> {
        Ok(())
    }

    fn completed_sets(&self) -> usize {
        self.completed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::MemorySink;
    use crate::experiment::protocols::testing::{apply_events, context, Bench, BENCH_WIDTH};
    use crate::modules::ModuleEntry;
    use std::path::Path;

    async fn bench(sink: Arc<MemorySink>) -> (Bench, Arc<FsrsAcquire>) {
        let acquire = Arc::new(FsrsAcquire::new().unwrap().with_sink(sink));
        let bench = Bench::new(ModuleEntry::experiment(acquire.clone())).await;
        acquire.properties().set_value("frames", 4i64).unwrap();
        acquire.properties().set_value("save to", "out/spec.dat").unwrap();
        (bench, acquire)
    }

    #[tokio::test]
    async fn test_sets_are_averaged_and_saved_individually() {
        let sink = Arc::new(MemorySink::new());
        let (_bench, acquire) = bench(sink.clone()).await;
        acquire.properties().set_value("sets", 3i64).unwrap();

        let mut plan = acquire.prepare().unwrap();
        assert_eq!(plan.devices, vec!["Dummy Camera"]);
        let (ctx, mut rx) = context("FSRS Acquire");
        plan.protocol.run(&ctx).await.unwrap();
        assert_eq!(plan.protocol.completed_sets(), 3);
        assert_eq!(apply_events(&mut rx, acquire.as_ref()).len(), 3);
        assert_eq!(
            acquire.properties().value("progress").unwrap().as_f64(),
            Some(100.0)
        );

        acquire.handle_event("on_save").unwrap();
        let mean = sink.table(Path::new("out/spec.dat")).unwrap();
        assert_eq!(mean.column_count(), 3);
        assert_eq!(mean.row_count(), BENCH_WIDTH);
        for i in 0..3 {
            assert!(sink.table(format!("out/spec_{i}.dat")).is_some());
        }
    }

    #[tokio::test]
    async fn test_single_set_writes_only_the_mean() {
        let sink = Arc::new(MemorySink::new());
        let (_bench, acquire) = bench(sink.clone()).await;
        assert_eq!(acquire.save().unwrap(), 0);

        let mut plan = acquire.prepare().unwrap();
        let (ctx, mut rx) = context("FSRS Acquire");
        plan.protocol.run(&ctx).await.unwrap();
        apply_events(&mut rx, acquire.as_ref());
        assert_eq!(acquire.save().unwrap(), 1);
        assert_eq!(sink.table_paths(), vec![PathBuf::from("out/spec.dat")]);
    }

    #[tokio::test]
    async fn test_continuous_mode_runs_until_cancelled() {
        let sink = Arc::new(MemorySink::new());
        let (_bench, acquire) = bench(sink).await;
        acquire.properties().set_value("continuous", true).unwrap();

        let mut plan = acquire.prepare().unwrap();
        let (ctx, mut rx) = context("FSRS Acquire");
        let cancel = ctx.cancel_token().clone();
        let task = tokio::spawn(async move {
            plan.protocol.run(&ctx).await.unwrap();
            plan.protocol.completed_sets()
        });
        tokio::time::sleep(Duration::from_millis(200)).await;
        cancel.cancel();
        let bursts = task.await.unwrap();
        assert!(bursts >= 2, "only {bursts} bursts");

        apply_events(&mut rx, acquire.as_ref());
        let guard = acquire.run.lock();
        assert_eq!(guard.as_ref().unwrap().data.count(), 1);
    }
}
