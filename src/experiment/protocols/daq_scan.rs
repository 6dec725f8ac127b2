//! DAQ scan: a scalar input read at every stage position.
//!
//! Repeated sets are averaged per position. The saved file has two columns,
//! position and mean reading, in ascending position order.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::data::{Accumulator, ColumnTable, ResultSink, TsvFileSink};
use crate::error::AppResult;
use crate::experiment::context::{ProgressCycle, ScanContext};
use crate::experiment::events::{Measurement, ScanUpdate, ShutterState};
use crate::experiment::points::{ScanPointSet, StageRange};
use crate::experiment::protocols::{ScanProtocol, NO_CHOICES};
use crate::experiment::{Collaborators, Experiment, ScanPlan, START_EVENT};
use crate::hardware::capabilities::{Axis, Input};
use crate::hardware::registry::{BindingContext, Bound};
use crate::modules::Module;
use crate::property::{PropertyKind, PropertySet, PropertySpec};

#[derive(Default)]
struct DaqTrace {
    positions: Vec<f64>,
    readings: Vec<Accumulator>,
}

impl DaqTrace {
    /// `(position, mean)` pairs of every position read at least once, sorted.
    fn sorted_means(&self) -> Vec<(f64, f64)> {
        let mut rows: Vec<(f64, f64)> = self
            .positions
            .iter()
            .zip(&self.readings)
            .filter_map(|(p, acc)| acc.scalar_mean().map(|m| (*p, m)))
            .collect();
        rows.sort_by(|a, b| a.0.total_cmp(&b.0));
        rows
    }
}

/// Axis scan of a scalar input.
pub struct DaqScan {
    properties: PropertySet,
    inputs: Collaborators<dyn Input>,
    axes: Collaborators<dyn Axis>,
    sink: Arc<dyn ResultSink>,
    trace: Mutex<DaqTrace>,
}

impl DaqScan {
    /// Experiment saving through a [`TsvFileSink`].
    pub fn new() -> AppResult<Self> {
        let mut specs = vec![
            PropertySpec::new("DAQ", PropertyKind::Choice, 0).choices(NO_CHOICES),
            PropertySpec::new("Axis", PropertyKind::Choice, 0).choices(NO_CHOICES),
        ];
        specs.extend(StageRange::property_specs(0.0, 100.0, 1.0));
        specs.extend([
            PropertySpec::new("# of Sets", PropertyKind::Spin, 1).info(json!([1, 1000])),
            PropertySpec::new("Save Scan", PropertyKind::Button, "Save").event("on_save"),
            PropertySpec::new("Save To", PropertyKind::File, "daq_scan.dat").info("save"),
            PropertySpec::new("Progress", PropertyKind::Progress, 0),
            PropertySpec::new("Start", PropertyKind::Button, "Scan").event(START_EVENT),
        ]);
        Ok(Self {
            properties: PropertySet::from_specs(specs)?,
            inputs: Collaborators::new(),
            axes: Collaborators::new(),
            sink: Arc::new(TsvFileSink::new()),
            trace: Mutex::new(DaqTrace::default()),
        })
    }

    /// Default save location, relative to `dir`.
    pub fn with_output_dir(self, dir: &str) -> AppResult<Self> {
        let file = PathBuf::from(dir).join("daq_scan.dat");
        self.properties
            .set_value("save to", file.to_string_lossy().into_owned())?;
        Ok(self)
    }

    /// Write results through `sink` instead of the file system.
    pub fn with_sink(mut self, sink: Arc<dyn ResultSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Mean reading per position, sorted by position.
    pub fn means(&self) -> Vec<(f64, f64)> {
        self.trace.lock().sorted_means()
    }

    /// Save `(position, mean)` rows to "Save To"; returns whether anything
    /// was written.
    pub fn save(&self) -> AppResult<bool> {
        let rows = self.means();
        if rows.is_empty() {
            warn!(experiment = self.name(), "nothing to save yet");
            return Ok(false);
        }
        let path = PathBuf::from(self.properties.value("save to")?.as_text().trim());
        let table = ColumnTable::from_rows(rows.iter().map(|(p, v)| [*p, *v]))?;
        self.sink.write_table(&path, &table)?;
        info!(experiment = self.name(), path = %path.display(), points = rows.len(), "scan saved");
        Ok(true)
    }
}

#[async_trait]
impl Module for DaqScan {
    fn name(&self) -> &str {
        "DAQ Scan"
    }

    fn properties(&self) -> &PropertySet {
        &self.properties
    }

    async fn initialize(&self, ctx: &BindingContext<'_>) -> AppResult<()> {
        self.inputs.bind(&self.properties, "daq", ctx.inputs())?;
        self.axes.bind(&self.properties, "axis", ctx.axes())
    }

    fn handle_event(&self, event: &str) -> AppResult<()> {
        match event {
            "on_axis_range_change" => StageRange::normalize(&self.properties),
            "on_save" => self.save().map(|_| ()),
            _ => Ok(()),
        }
    }
}

impl Experiment for DaqScan {
    fn prepare(&self) -> AppResult<ScanPlan> {
        let snapshot = self.properties.snapshot();
        let input = self.inputs.require(snapshot.index("daq")?, self.name(), "input")?;
        let axis = self.axes.require(snapshot.index("axis")?, self.name(), "axis")?;
        let points = StageRange::from_snapshot(&snapshot)?.points()?;
        let sets = snapshot.count("sets")?.max(1);

        *self.trace.lock() = DaqTrace {
            positions: points.visit_order().to_vec(),
            readings: (0..points.len()).map(|_| Accumulator::new()).collect(),
        };
        self.properties.set_value("progress", 0.0)?;
        info!(experiment = self.name(), input = input.label(), points = points.len(), sets, "scan prepared");

        let protocol = DaqScanProtocol {
            input: input.clone(),
            axis: axis.clone(),
            points,
            sets,
            completed: 0,
        };
        Ok(ScanPlan::new(protocol).using(&input).using(&axis))
    }

    fn on_update(&self, update: &ScanUpdate) -> AppResult<()> {
        let (Measurement::Scalar { value }, Some(point)) = (&update.measurement, update.point) else {
            return Ok(());
        };
        if let Some(acc) = self.trace.lock().readings.get_mut(point) {
            acc.push_scalar(*value)?;
        }
        if let Some(progress) = update.progress {
            self.properties.set_value("progress", progress)?;
        }
        Ok(())
    }
}

// =============================================================================
// Protocol
// =============================================================================

struct DaqScanProtocol {
    input: Bound<dyn Input>,
    axis: Bound<dyn Axis>,
    points: ScanPointSet,
    sets: usize,
    completed: usize,
}

#[async_trait]
impl ScanProtocol for DaqScanProtocol {
    async fn run(&mut self, ctx: &ScanContext) -> AppResult<()> {
        if !ctx.sleep(ctx.timing().pre_scan_delay()).await {
            return Ok(());
        }
        let visit = self.points.visit_order().to_vec();
        let mut progress = ProgressCycle::stepped(visit.len() * self.sets);
        progress.advance();

        for set in 0..self.sets {
            for (point, &position) in visit.iter().enumerate() {
                if !ctx.move_axis(self.axis.device().as_ref(), position).await? {
                    return Ok(());
                }
                let value = self.input.device().read().await?;
                ctx.update(ScanUpdate {
                    set,
                    point: Some(point),
                    position,
                    shutter: ShutterState::Open,
                    measurement: Measurement::Scalar { value },
                    progress: Some(progress.advance()),
                })
                .await?;
                if !ctx.sleep(ctx.timing().inter_point_delay()).await {
                    return Ok(());
                }
            }
            self.completed += 1;
            debug!(experiment = ctx.experiment(), set, "set complete");
        }
        Ok(())
    }

    async fn cleanup(&mut self, ctx: &ScanContext) -> AppResult<()> {
        ctx.return_axis(self.axis.device().as_ref(), self.points.first())
            .await
    }

    fn completed_sets(&self) -> usize {
        self.completed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::MemorySink;
    use crate::error::DaqError;
    use crate::experiment::protocols::testing::{apply_events, context, Bench};
    use crate::modules::ModuleEntry;
    use std::path::Path;

    async fn bench(sink: Arc<MemorySink>) -> (Bench, Arc<DaqScan>) {
        let scan = Arc::new(DaqScan::new().unwrap().with_sink(sink));
        let bench = Bench::new(ModuleEntry::experiment(scan.clone())).await;
        let props = scan.properties();
        // index 1: the sensor, after the camera
        props.set_value("daq", 1i64).unwrap();
        props.set_value("till", "3").unwrap();
        props.set_value("save to", "daq.dat").unwrap();
        bench.sensor.properties().set_value("offset", "5").unwrap();
        (bench, scan)
    }

    #[tokio::test]
    async fn test_readings_averaged_over_sets() {
        let sink = Arc::new(MemorySink::new());
        let (bench, scan) = bench(sink.clone()).await;
        scan.properties().set_value("sets", 2i64).unwrap();

        let mut plan = scan.prepare().unwrap();
        assert_eq!(plan.devices, vec!["Dummy Sensor", "Dummy Axis"]);
        let (ctx, mut rx) = context("DAQ Scan");
        plan.protocol.run(&ctx).await.unwrap();
        plan.protocol.cleanup(&ctx).await.unwrap();
        assert_eq!(plan.protocol.completed_sets(), 2);

        assert_eq!(apply_events(&mut rx, scan.as_ref()).len(), 8);
        assert_eq!(
            scan.means(),
            vec![(0.0, 5.0), (1.0, 5.0), (2.0, 5.0), (3.0, 5.0)]
        );
        assert_eq!(scan.properties().value("progress").unwrap().as_f64(), Some(100.0));
        assert_eq!(bench.axis.goto_history().last(), Some(&0.0));

        scan.handle_event("on_save").unwrap();
        let table = sink.table(Path::new("daq.dat")).unwrap();
        assert_eq!(table.column(0).unwrap(), &[0.0, 1.0, 2.0, 3.0]);
        assert_eq!(table.column(1).unwrap(), &[5.0; 4]);
    }

    #[tokio::test]
    async fn test_disconnected_input_fails_the_run() {
        let sink = Arc::new(MemorySink::new());
        let (bench, scan) = bench(sink).await;
        bench.sensor.set_connected(false);

        let mut plan = scan.prepare().unwrap();
        let (ctx, _rx) = context("DAQ Scan");
        let err = plan.protocol.run(&ctx).await.unwrap_err();
        assert!(matches!(err, DaqError::Device(_)));
        plan.protocol.cleanup(&ctx).await.unwrap();
        assert_eq!(plan.protocol.completed_sets(), 0);
    }

    #[tokio::test]
    async fn test_file_mode_without_file_is_rejected() {
        let (_bench, scan) = bench(Arc::new(MemorySink::new())).await;
        scan.properties().set_value("mode", 2i64).unwrap();
        assert!(matches!(scan.prepare(), Err(DaqError::EmptyScan)));
    }
}
