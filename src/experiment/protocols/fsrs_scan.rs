//! FSRS scan: stimulated Raman spectra over `sets × delay points`.
//!
//! In FSRS mode every set starts with a ground-state spectrum at the first
//! delay (shutter closed), then opens the shutter and records one excited
//! spectrum per point. Other modes keep the shutter open for the whole run.
//! An optional reference input is read after every excited spectrum and
//! averaged per point over the sets.
//!
//! Files written (tab-delimited, into "Output Path"):
//!
//! - `{basename}_timepoints.txt`: sorted delays, at scan start
//! - one `[A, B, C]` file per acquisition, named by
//!   [`format_fsrs_filename`]
//! - `{basename}_average.dat`: ground spectrum (FSRS only) followed by the
//!   averaged transformed spectrum of every delay in ascending order
//! - `{basename}_reference.dat`: `(t, r)` rows when a reference was taken

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::data::naming::format_fsrs_filename;
use crate::data::{Accumulator, ColumnTable, FrameAccumulator, MeasurementMode, ResultSink, TsvFileSink};
use crate::error::AppResult;
use crate::experiment::context::{ProgressCycle, ScanContext};
use crate::experiment::events::{Measurement, ReferenceTrace, ScanSummary, ScanUpdate, ShutterState};
use crate::experiment::points::{ScanPointSet, StageRange};
use crate::experiment::protocols::{acquire_spectrum, output_dir, set_shutter, ScanProtocol, NO_CHOICES};
use crate::experiment::safety::SettingGuard;
use crate::experiment::{Collaborators, Experiment, ScanPlan, START_EVENT};
use crate::hardware::capabilities::{Axis, Camera, Input, Output};
use crate::hardware::registry::{BindingContext, Bound};
use crate::modules::Module;
use crate::property::{PropertyKind, PropertySet, PropertySpec};

const MEASUREMENT_CHOICES: [&str; 3] = ["FSRS", "TA", "T/T0"];

/// Controller-side state of the current run.
struct FsrsRun {
    mode: MeasurementMode,
    basename: String,
    dir: PathBuf,
    sets: usize,
    visit: Vec<f64>,
    ground: FrameAccumulator,
    excited: Vec<FrameAccumulator>,
}

/// Time-resolved FSRS experiment.
pub struct FsrsScan {
    properties: PropertySet,
    cameras: Collaborators<dyn Camera>,
    axes: Collaborators<dyn Axis>,
    shutters: Collaborators<dyn Output>,
    references: Collaborators<dyn Input>,
    sink: Arc<dyn ResultSink>,
    run: Mutex<Option<FsrsRun>>,
}

impl FsrsScan {
    /// Experiment writing to the working directory through a [`TsvFileSink`].
    pub fn new() -> AppResult<Self> {
        let mut specs = vec![
            PropertySpec::new("Camera", PropertyKind::Choice, 0).choices(NO_CHOICES),
            PropertySpec::new("Type", PropertyKind::Choice, 0).choices(MEASUREMENT_CHOICES),
            PropertySpec::new("# of Frames", PropertyKind::Spin, 2000).info(json!([2, 20000])),
            PropertySpec::new("Axis", PropertyKind::Choice, 0).choices(NO_CHOICES),
        ];
        specs.extend(StageRange::property_specs(-500.0, 2500.0, 20.0));
        specs.extend([
            PropertySpec::new("Shutter", PropertyKind::Choice, 0).choices(NO_CHOICES),
            PropertySpec::new("Take Ref.", PropertyKind::Choice, 0).choices(["No"]),
            PropertySpec::new("# of Sets", PropertyKind::Spin, 1).info(json!([1, 1000])),
            PropertySpec::new("Basename", PropertyKind::Input, ""),
            PropertySpec::new("Output Path", PropertyKind::File, "").info("path"),
            PropertySpec::new("Progress", PropertyKind::Progress, 0),
            PropertySpec::new("Status", PropertyKind::Label, ""),
            PropertySpec::new("Start", PropertyKind::Button, "Scan").event(START_EVENT),
        ]);

        Ok(Self {
            properties: PropertySet::from_specs(specs)?,
            cameras: Collaborators::new(),
            axes: Collaborators::new(),
            shutters: Collaborators::new(),
            references: Collaborators::optional(),
            sink: Arc::new(TsvFileSink::new()),
            run: Mutex::new(None),
        })
    }

    /// Default output directory.
    pub fn with_output_dir(self, dir: &str) -> AppResult<Self> {
        self.properties.set_value("output path", dir)?;
        Ok(self)
    }

    /// Write results through `sink` instead of the file system.
    pub fn with_sink(mut self, sink: Arc<dyn ResultSink>) -> Self {
        self.sink = sink;
        self
    }

    fn write_average(&self, run: &FsrsRun) -> AppResult<()> {
        let mut order: Vec<usize> = (0..run.visit.len()).collect();
        order.sort_by(|a, b| run.visit[*a].total_cmp(&run.visit[*b]));

        let mut table = ColumnTable::new();
        if !run.ground.is_empty() {
            table.push_column(run.ground.mean()[0].to_vec())?;
        }
        for index in order {
            let acc = &run.excited[index];
            if !acc.is_empty() {
                table.push_column(acc.mean()[0].to_vec())?;
            }
        }
        if table.is_empty() {
            return Ok(());
        }
        let path = run.dir.join(format!("{}_average.dat", run.basename));
        self.sink.write_table(&path, &table)?;
        debug!(path = %path.display(), columns = table.column_count(), "wrote FSRS average");
        Ok(())
    }
}

#[async_trait]
impl Module for FsrsScan {
    fn name(&self) -> &str {
        "FSRS Scan"
    }

    fn properties(&self) -> &PropertySet {
        &self.properties
    }

    async fn initialize(&self, ctx: &BindingContext<'_>) -> AppResult<()> {
        self.cameras.bind(&self.properties, "camera", ctx.cameras())?;
        self.axes.bind(&self.properties, "axis", ctx.axes())?;
        self.shutters.bind(&self.properties, "shutter", ctx.outputs())?;
        self.references.bind(&self.properties, "take ref", ctx.inputs())?;
        Ok(())
    }

    fn handle_event(&self, event: &str) -> AppResult<()> {
        if event == "on_axis_range_change" {
            StageRange::normalize(&self.properties)?;
        }
        Ok(())
    }
}

impl Experiment for FsrsScan {
    fn prepare(&self) -> AppResult<ScanPlan> {
        let snapshot = self.properties.snapshot();
        let camera = self.cameras.require(snapshot.index("camera")?, self.name(), "camera")?;
        let axis = self.axes.require(snapshot.index("axis")?, self.name(), "axis")?;
        let shutter = self.shutters.require(snapshot.index("shutter")?, self.name(), "shutter")?;
        let reference = self.references.selected(snapshot.index("take ref")?);

        let mode = MeasurementMode::from_index(snapshot.index("type")?);
        let frames = snapshot.count("frames")?;
        let sets = snapshot.count("sets")?.max(1);
        let points = StageRange::from_snapshot(&snapshot)?.points()?;
        let basename = snapshot.text("basename")?;
        let dir = output_dir(&snapshot.text("output path")?);

        self.sink.write_table(
            &dir.join(format!("{basename}_timepoints.txt")),
            &ColumnTable::from_columns([points.sorted().to_vec()])?,
        )?;
        self.properties.set_value("progress", 0.0)?;
        self.properties.set_value("status", "")?;

        info!(
            experiment = self.name(),
            %mode,
            frames,
            sets,
            points = points.len(),
            reference = reference.as_ref().map(|r| r.label()),
            "FSRS scan prepared"
        );

        *self.run.lock() = Some(FsrsRun {
            mode,
            basename,
            dir,
            sets,
            visit: points.visit_order().to_vec(),
            ground: FrameAccumulator::new(),
            excited: (0..points.len()).map(|_| FrameAccumulator::new()).collect(),
        });

        let protocol = FsrsScanProtocol {
            camera: camera.clone(),
            axis: axis.clone(),
            shutter: shutter.clone(),
            reference: reference.clone(),
            mode,
            frames,
            sets,
            reference_sums: (0..points.len()).map(|_| Accumulator::new()).collect(),
            points,
            wait_guard: None,
            completed_sets: 0,
        };
        Ok(ScanPlan::new(protocol)
            .using(&camera)
            .using(&axis)
            .using(&shutter)
            .using_optional(reference.as_ref()))
    }

    fn on_update(&self, update: &ScanUpdate) -> AppResult<()> {
        if let Some(progress) = update.progress {
            self.properties.set_value("progress", progress)?;
        }
        let Measurement::Spectrum(frame) = &update.measurement else {
            return Ok(());
        };
        if frame.degraded {
            warn!(
                experiment = self.name(),
                set = update.set,
                position = update.position,
                "placeholder spectrum not saved"
            );
            return Ok(());
        }

        let mut guard = self.run.lock();
        let Some(run) = guard.as_mut() else {
            return Ok(());
        };

        let gain = run.mode.transform(&frame.ratio);
        let step = if update.point.is_some() { update.position } else { 0.0 };
        let name = format_fsrs_filename(run.mode, &run.basename, step, update.set, update.shutter);
        let table = ColumnTable::from_columns([
            gain.clone(),
            frame.channel_a.clone(),
            frame.channel_b.clone(),
        ])?;
        self.sink.write_table(&run.dir.join(&name), &table)?;

        let channels = [gain.as_slice(), frame.channel_a.as_slice(), frame.channel_b.as_slice()];
        match update.point {
            Some(point) => {
                if let Some(acc) = run.excited.get_mut(point) {
                    acc.push(channels)?;
                }
            }
            None => run.ground.push(channels)?,
        }

        let status = format!(
            "position {:.0}fs, set {}/{}",
            update.position,
            update.set + 1,
            run.sets
        );
        drop(guard);
        self.properties.set_value("status", status)?;
        Ok(())
    }

    fn on_finished(&self, summary: &ScanSummary) -> AppResult<()> {
        let guard = self.run.lock();
        let Some(run) = guard.as_ref() else {
            return Ok(());
        };

        if let Some(reference) = &summary.reference {
            let rows: Vec<[f64; 2]> = reference
                .sorted_rows()
                .into_iter()
                .map(|(t, r)| [t, r])
                .collect();
            let path = run.dir.join(format!("{}_reference.dat", run.basename));
            self.sink.write_table(&path, &ColumnTable::from_rows(rows)?)?;
        }
        self.write_average(run)
    }
}

// =============================================================================
// Protocol
// =============================================================================

struct FsrsScanProtocol {
    camera: Bound<dyn Camera>,
    axis: Bound<dyn Axis>,
    shutter: Bound<dyn Output>,
    reference: Option<Bound<dyn Input>>,
    mode: MeasurementMode,
    frames: usize,
    sets: usize,
    points: ScanPointSet,
    reference_sums: Vec<Accumulator>,
    wait_guard: Option<SettingGuard>,
    completed_sets: usize,
}

#[async_trait]
impl ScanProtocol for FsrsScanProtocol {
    async fn run(&mut self, ctx: &ScanContext) -> AppResult<()> {
        if let Some(reference) = &self.reference {
            self.wait_guard = Some(SettingGuard::zero_wait_time(reference.module().clone())?);
        }
        if !ctx.sleep(ctx.timing().pre_scan_delay()).await {
            return Ok(());
        }
        if !self.mode.is_fsrs() {
            set_shutter(&self.shutter, ShutterState::Open).await?;
        }

        let visit = self.points.visit_order().to_vec();
        let mut progress = ProgressCycle::spread(visit.len() * self.sets);

        for set in 0..self.sets {
            if !ctx.move_axis(self.axis.device().as_ref(), visit[0]).await? {
                return Ok(());
            }

            if self.mode.is_fsrs() {
                set_shutter(&self.shutter, ShutterState::Closed).await?;
                let frame = acquire_spectrum(&self.camera, self.frames, ctx).await?;
                if ctx.is_cancelled() {
                    return Ok(());
                }
                ctx.update(ScanUpdate {
                    set,
                    point: None,
                    position: visit[0],
                    shutter: ShutterState::Closed,
                    measurement: Measurement::Spectrum(frame),
                    progress: None,
                })
                .await?;
                set_shutter(&self.shutter, ShutterState::Open).await?;
            }

            for (point, &position) in visit.iter().enumerate() {
                if point > 0 && !ctx.move_axis(self.axis.device().as_ref(), position).await? {
                    return Ok(());
                }
                let frame = acquire_spectrum(&self.camera, self.frames, ctx).await?;
                if ctx.is_cancelled() {
                    return Ok(());
                }
                if let Some(reference) = &self.reference {
                    let value = reference.device().read().await?;
                    self.reference_sums[point].push_scalar(value)?;
                }
                ctx.update(ScanUpdate {
                    set,
                    point: Some(point),
                    position,
                    shutter: ShutterState::Open,
                    measurement: Measurement::Spectrum(frame),
                    progress: Some(progress.advance()),
                })
                .await?;
                if !ctx.sleep(ctx.timing().inter_point_delay()).await {
                    return Ok(());
                }
            }

            self.completed_sets += 1;
            debug!(experiment = ctx.experiment(), set, "set complete");
        }
        Ok(())
    }

    async fn cleanup(&mut self, ctx: &ScanContext) -> AppResult<()> {
        let homed = ctx
            .return_axis(self.axis.device().as_ref(), self.points.first())
            .await;
        let closed = set_shutter(&self.shutter, ShutterState::Closed).await;
        self.wait_guard.take();
        homed?;
        closed
    }

    fn completed_sets(&self) -> usize {
        self.completed_sets
    }

    fn reference(&self) -> Option<ReferenceTrace> {
        self.reference.as_ref()?;
        Some(ReferenceTrace {
            positions: self.points.visit_order().to_vec(),
            values: self
                .reference_sums
                .iter()
                .map(|acc| acc.scalar_mean().unwrap_or(0.0))
                .collect(),
        })
    }
}
