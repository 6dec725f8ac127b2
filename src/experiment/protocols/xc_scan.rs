//! Cross-correlation scan.
//!
//! Records one transformed spectrum per delay and stacks them into a map
//! (delay × pixel) used to characterize probe chirp. Kerr mode first reads a
//! shutter-closed background that is subtracted from the channel average of
//! every later spectrum.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use crate::data::transform::{channel_average, kerr_signal};
use crate::data::{ColumnTable, MeasurementMode, ResultSink, TsvFileSink};
use crate::error::AppResult;
use crate::experiment::context::{ProgressCycle, ScanContext};
use crate::experiment::events::{Measurement, ScanUpdate, ShutterState};
use crate::experiment::points::{ScanPointSet, StageRange};
use crate::experiment::protocols::{acquire_spectrum, set_shutter, ScanProtocol, NO_CHOICES};
use crate::experiment::{Collaborators, Experiment, ScanPlan, START_EVENT};
use crate::hardware::capabilities::{Axis, Camera, Output};
use crate::hardware::registry::{BindingContext, Bound};
use crate::modules::Module;
use crate::property::{PropertyKind, PropertySet, PropertySpec};

#[derive(Default)]
struct XcMap {
    mode: Option<MeasurementMode>,
    background: Option<Vec<f64>>,
    rows: Vec<(f64, Vec<f64>)>,
}

/// Cross-correlation experiment.
pub struct XcScan {
    properties: PropertySet,
    cameras: Collaborators<dyn Camera>,
    axes: Collaborators<dyn Axis>,
    shutters: Collaborators<dyn Output>,
    sink: Arc<dyn ResultSink>,
    map: Mutex<XcMap>,
}

impl XcScan {
    /// Experiment saving through a [`TsvFileSink`].
    pub fn new() -> AppResult<Self> {
        let mut specs = vec![
            PropertySpec::new("Camera", PropertyKind::Choice, 0).choices(NO_CHOICES),
            PropertySpec::new("Type", PropertyKind::Choice, 3).choices(MeasurementMode::CHOICES),
            PropertySpec::new("# of Frames", PropertyKind::Spin, 100).info(json!([2, 20000])),
            PropertySpec::new("Axis", PropertyKind::Choice, 0).choices(NO_CHOICES),
        ];
        specs.extend(StageRange::property_specs(-300.0, 300.0, 20.0));
        specs.extend([
            PropertySpec::new("Shutter", PropertyKind::Choice, 0).choices(NO_CHOICES),
            PropertySpec::new("Save Last", PropertyKind::Button, "Save").event("on_save"),
            PropertySpec::new("Save To", PropertyKind::File, "xc_scan.dat").info("save"),
            PropertySpec::new("Progress", PropertyKind::Progress, 0),
            PropertySpec::new("Start", PropertyKind::Button, "Scan").event(START_EVENT),
        ]);
        Ok(Self {
            properties: PropertySet::from_specs(specs)?,
            cameras: Collaborators::new(),
            axes: Collaborators::new(),
            shutters: Collaborators::new(),
            sink: Arc::new(TsvFileSink::new()),
            map: Mutex::new(XcMap::default()),
        })
    }

    /// Default save location, relative to `dir`.
    pub fn with_output_dir(self, dir: &str) -> AppResult<Self> {
        let file = PathBuf::from(dir).join("xc_scan.dat");
        self.properties
            .set_value("save to", file.to_string_lossy().into_owned())?;
        Ok(self)
    }

    /// Write results through `sink` instead of the file system.
    pub fn with_sink(mut self, sink: Arc<dyn ResultSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Write the map to "Save To": one row per delay in ascending order, the
    /// delay first, then the pixels. Returns whether anything was written.
    pub fn save(&self) -> AppResult<bool> {
        let map = self.map.lock();
        if map.rows.is_empty() {
            warn!(experiment = self.name(), "nothing to save yet");
            return Ok(false);
        }
        let mut rows: Vec<Vec<f64>> = map
            .rows
            .iter()
            .map(|(t, row)| std::iter::once(*t).chain(row.iter().copied()).collect())
            .collect();
        rows.sort_by(|a, b| a[0].total_cmp(&b[0]));

        let path = PathBuf::from(self.properties.value("save to")?.as_text().trim());
        self.sink.write_table(&path, &ColumnTable::from_rows(rows)?)?;
        info!(experiment = self.name(), path = %path.display(), delays = map.rows.len(), "cross-correlation saved");
        Ok(true)
    }

    /// Number of delays recorded in the current map.
    pub fn recorded_delays(&self) -> usize {
        self.map.lock().rows.len()
    }
}

#[async_trait]
impl Module for XcScan {
    fn name(&self) -> &str {
        "XC Scan"
    }

    fn properties(&self) -> &PropertySet {
        &self.properties
    }

    async fn initialize(&self, ctx: &BindingContext<'_>) -> AppResult<()> {
        self.cameras.bind(&self.properties, "camera", ctx.cameras())?;
        self.axes.bind(&self.properties, "axis", ctx.axes())?;
        self.shutters.bind(&self.properties, "shutter", ctx.outputs())
    }

    fn handle_event(&self, event: &str) -> AppResult<()> {
        match event {
            "on_axis_range_change" => StageRange::normalize(&self.properties),
            "on_save" => self.save().map(|_| ()),
            _ => Ok(()),
        }
    }
}

impl Experiment for XcScan {
    fn prepare(&self) -> AppResult<ScanPlan> {
        let snapshot = self.properties.snapshot();
        let camera = self.cameras.require(snapshot.index("camera")?, self.name(), "camera")?;
        let axis = self.axes.require(snapshot.index("axis")?, self.name(), "axis")?;
        let shutter = self.shutters.require(snapshot.index("shutter")?, self.name(), "shutter")?;
        let mode = MeasurementMode::from_index(snapshot.index("type")?);
        let frames = snapshot.count("frames")?;
        let points = StageRange::from_snapshot(&snapshot)?.points()?;

        *self.map.lock() = XcMap {
            mode: Some(mode),
            ..XcMap::default()
        };
        self.properties.set_value("progress", 0.0)?;
        info!(experiment = self.name(), %mode, frames, points = points.len(), "cross-correlation prepared");

        let protocol = XcScanProtocol {
            camera: camera.clone(),
            axis: axis.clone(),
            shutter: shutter.clone(),
            mode,
            frames,
            points,
            completed: 0,
        };
        Ok(ScanPlan::new(protocol)
            .using(&camera)
            .using(&axis)
            .using(&shutter))
    }

    fn on_update(&self, update: &ScanUpdate) -> AppResult<()> {
        let Measurement::Spectrum(frame) = &update.measurement else {
            return Ok(());
        };
        if let Some(progress) = update.progress {
            self.properties.set_value("progress", progress)?;
        }
        if frame.degraded {
            warn!(
                experiment = self.name(),
                position = update.position,
                background = update.point.is_none(),
                "placeholder spectrum left out of the map"
            );
            return Ok(());
        }

        let mut map = self.map.lock();
        let Some(mode) = map.mode else {
            return Ok(());
        };

        if update.point.is_none() {
            if mode == MeasurementMode::Kerr {
                map.background = Some(channel_average(&frame.channel_a, &frame.channel_b));
            }
            return Ok(());
        }

        let row = if mode == MeasurementMode::Kerr {
            let Some(background) = map.background.as_deref() else {
                warn!(experiment = self.name(), "Kerr spectrum without background skipped");
                return Ok(());
            };
            kerr_signal(&frame.channel_a, &frame.channel_b, background)
        } else {
            mode.transform(&frame.ratio)
        };
        map.rows.push((update.position, row));
        Ok(())
    }
}

// =============================================================================
// Protocol
// =============================================================================

struct XcScanProtocol {
    camera: Bound<dyn Camera>,
    axis: Bound<dyn Axis>,
    shutter: Bound<dyn Output>,
    mode: MeasurementMode,
    frames: usize,
    points: ScanPointSet,
    completed: usize,
}

#[async_trait]
impl ScanProtocol for XcScanProtocol {
    async fn run(&mut self, ctx: &ScanContext) -> AppResult<()> {
        if !ctx.sleep(ctx.timing().pre_scan_delay()).await {
            return Ok(());
        }

        if self.mode == MeasurementMode::Kerr {
            set_shutter(&self.shutter, ShutterState::Closed).await?;
            let frame = acquire_spectrum(&self.camera, self.frames, ctx).await?;
            if ctx.is_cancelled() {
                return Ok(());
            }
            ctx.update(ScanUpdate {
                set: 0,
                point: None,
                position: self.points.first(),
                shutter: ShutterState::Closed,
                measurement: Measurement::Spectrum(frame),
                progress: None,
            })
            .await?;
        }
        set_shutter(&self.shutter, ShutterState::Open).await?;

        let visit = self.points.visit_order().to_vec();
        let mut progress = ProgressCycle::stepped(visit.len());
        // 0 % was shown when the scan was prepared
        progress.advance();

        for (point, &position) in visit.iter().enumerate() {
            if !ctx.move_axis(self.axis.device().as_ref(), position).await? {
                return Ok(());
            }
            let frame = acquire_spectrum(&self.camera, self.frames, ctx).await?;
            if ctx.is_cancelled() {
                return Ok(());
            }
            ctx.update(ScanUpdate {
                set: 0,
                point: Some(point),
                position,
                shutter: ShutterState::Open,
                measurement: Measurement::Spectrum(frame),
                progress: Some(progress.advance()),
            })
            .await?;
        }
        self.completed = 1;
        Ok(())
    }

    async fn cleanup(&mut self, ctx: &ScanContext) -> AppResult<()> {
        let homed = ctx
            .return_axis(self.axis.device().as_ref(), self.points.first())
            .await;
        let closed = set_shutter(&self.shutter, ShutterState::Closed).await;
        homed?;
        closed
    }

    fn completed_sets(&self) -> usize {
        self.completed
    }
}
