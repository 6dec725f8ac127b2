//! Grid optimize: search two actuators for the minimum of a scalar input.
//!
//! Each iteration samples a grid over the current domain, visiting the points
//! nearest the current best first (or in random order), then centers the
//! domain on the lowest reading and shrinks it by `1 / Convergence Power` per
//! axis. The search stops once the best reading improves by no more than the
//! function tolerance or the domain gets narrower than the parameter
//! tolerance, and after "Max Iterations" grids at the latest.
//!
//! Both actuators go back to 0 afterwards. The coordinate list is written to
//! `{Output Path}/{Basename}.txt` as `x, y, reading` rows, newest iteration
//! first and each iteration sorted by reading.

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use serde_json::json;
use std::f64::consts::SQRT_2;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::data::{ColumnTable, ResultSink, TsvFileSink};
use crate::error::{AppResult, DaqError};
use crate::experiment::context::{ProgressCycle, ScanContext};
use crate::experiment::events::{Measurement, ScanSummary, ScanUpdate, ShutterState};
use crate::experiment::points::MAX_SCAN_POINTS;
use crate::experiment::protocols::{output_dir, ScanProtocol, NO_CHOICES};
use crate::experiment::{Collaborators, Experiment, ScanPlan, START_EVENT};
use crate::hardware::capabilities::{Axis, Input};
use crate::hardware::registry::{BindingContext, Bound};
use crate::modules::Module;
use crate::property::{PropertyKind, PropertySet, PropertySnapshot, PropertySpec};

/// File stem used when "Basename" is empty.
pub const DEFAULT_BASENAME: &str = "alpha0";

/// Guess text while the search starts from a random order.
const NO_GUESS: &str = "NA";

const GRID_TYPES: [&str; 3] = ["linear", "antigauspace", "erfspace"];

// =============================================================================
// Grid spacing
// =============================================================================

/// Floor added to every gap weight so warped grids never stack points.
const MIN_GAP_WEIGHT: f64 = 0.1;
const WARP_ITERATIONS: usize = 50;

/// Sample spacing along one axis of the grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GridSpacing {
    /// Evenly spaced
    Linear,
    /// Finest near the center; gaps grow like `1 - exp(-d² / 2σ²)`
    AntiGaussian,
    /// Finest near the center; gaps grow like `|erf(d / √2σ)|`
    Erf,
}

impl GridSpacing {
    /// Spacing at a "Grid Type" choice index.
    pub fn from_index(index: usize) -> Self {
        match index {
            1 => GridSpacing::AntiGaussian,
            2 => GridSpacing::Erf,
            _ => GridSpacing::Linear,
        }
    }

    /// `num` samples from `start` to `stop`, both included.
    ///
    /// Warped spacings put their narrowest gap at `center`, with σ half the
    /// range. A center outside the range pulls the fine end toward the
    /// nearer edge.
    pub fn samples(self, start: f64, stop: f64, num: usize, center: f64) -> Vec<f64> {
        match self {
            GridSpacing::Linear => linspace(start, stop, num),
            GridSpacing::AntiGaussian => {
                warped(start, stop, num, center, |d| 1.0 - (-d * d / 2.0).exp())
            }
            GridSpacing::Erf => warped(start, stop, num, center, |d| erf(d / SQRT_2).abs()),
        }
    }
}

fn linspace(start: f64, stop: f64, num: usize) -> Vec<f64> {
    match num {
        0 => Vec::new(),
        1 => vec![start],
        n => (0..n)
            .map(|i| start + (stop - start) * i as f64 / (n - 1) as f64)
            .collect(),
    }
}

/// Gaps proportional to `gap((midpoint - center) / σ)`, iterated from an even
/// grid until the sample positions stop moving.
fn warped(start: f64, stop: f64, num: usize, center: f64, gap: impl Fn(f64) -> f64) -> Vec<f64> {
    let sigma = (stop - start) / 2.0;
    let mut samples = linspace(start, stop, num);
    if num < 3 || sigma == 0.0 || !center.is_finite() {
        return samples;
    }
    for _ in 0..WARP_ITERATIONS {
        let weights: Vec<f64> = samples
            .windows(2)
            .map(|w| MIN_GAP_WEIGHT + gap(((w[0] + w[1]) / 2.0 - center) / sigma))
            .collect();
        let total: f64 = weights.iter().sum();
        let mut acc = 0.0;
        let next: Vec<f64> = std::iter::once(start)
            .chain(weights.iter().map(|w| {
                acc += w;
                start + (stop - start) * acc / total
            }))
            .collect();
        let shift = next
            .iter()
            .zip(&samples)
            .map(|(a, b)| (a - b).abs())
            .fold(0.0, f64::max);
        samples = next;
        if shift < 1e-9 {
            break;
        }
    }
    samples
}

/// Error function, Abramowitz and Stegun 7.1.26 (absolute error below 1.5e-7).
fn erf(x: f64) -> f64 {
    let t = 1.0 / (1.0 + 0.327_591_1 * x.abs());
    let poly = t
        * (0.254_829_592
            + t * (-0.284_496_736 + t * (1.421_413_741 + t * (-1.453_152_027 + t * 1.061_405_429))));
    (1.0 - poly * (-x * x).exp()).copysign(x)
}

// =============================================================================
// Search state
// =============================================================================

/// Parameters of one search, read from the properties at start.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchSettings {
    /// `[min, max]` per axis
    pub domain: [[f64; 2]; 2],
    /// Grid points per axis
    pub steps: [usize; 2],
    /// Initial best guess
    pub guess: [f64; 2],
    /// Visit grid points in random order instead of nearest first
    pub shuffle: bool,
    pub spacing: GridSpacing,
    /// Domain width factor applied after every iteration, in `(0, 1)`
    pub shrink: f64,
    pub function_tolerance: f64,
    pub parameter_tolerance: f64,
    pub max_iterations: usize,
}

/// Why a search ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The best reading improved by no more than the function tolerance
    FunctionTolerance,
    /// The shrunk domain is narrower than the parameter tolerance
    ParameterTolerance,
    /// "Max Iterations" grids were sampled
    MaxIterations,
}

/// One reading of the search.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GridSample {
    pub at: [f64; 2],
    pub value: f64,
}

/// Domain and best point carried from one iteration to the next.
#[derive(Debug, Clone)]
pub struct GridSearch {
    settings: SearchSettings,
    domain: [[f64; 2]; 2],
    center: [f64; 2],
    best: f64,
    iterations: usize,
}

impl GridSearch {
    pub fn new(settings: SearchSettings) -> Self {
        Self {
            domain: settings.domain,
            center: settings.guess,
            best: f64::INFINITY,
            iterations: 0,
            settings,
        }
    }

    /// Current `[min, max]` per axis.
    pub fn domain(&self) -> [[f64; 2]; 2] {
        self.domain
    }

    /// Best point so far, or the guess before the first iteration.
    pub fn center(&self) -> [f64; 2] {
        self.center
    }

    /// Iterations concluded so far.
    pub fn iterations(&self) -> usize {
        self.iterations
    }

    /// Points of one grid.
    pub fn grid_len(&self) -> usize {
        self.settings.steps[0] * self.settings.steps[1]
    }

    /// Grid points of the next iteration in visiting order.
    pub fn next_grid(&self) -> Vec<[f64; 2]> {
        let axis = |i: usize| {
            self.settings.spacing.samples(
                self.domain[i][0],
                self.domain[i][1],
                self.settings.steps[i],
                self.center[i],
            )
        };
        let (xs, ys) = (axis(0), axis(1));
        let mut grid: Vec<[f64; 2]> = xs
            .iter()
            .flat_map(|&x| ys.iter().map(move |&y| [x, y]))
            .collect();
        if self.settings.shuffle {
            grid.shuffle(&mut rand::thread_rng());
        } else {
            let [cx, cy] = self.center;
            let distance = |p: &[f64; 2]| (p[0] - cx).hypot(p[1] - cy);
            grid.sort_by(|a, b| distance(a).total_cmp(&distance(b)));
        }
        grid
    }

    /// Fold in the lowest reading of a finished grid; `Some` ends the search.
    pub fn conclude(&mut self, best: GridSample) -> Option<StopReason> {
        self.iterations += 1;
        self.center = best.at;
        let previous = std::mem::replace(&mut self.best, best.value);

        if best.value <= previous && previous - best.value <= self.settings.function_tolerance {
            return Some(StopReason::FunctionTolerance);
        }
        for (range, mid) in self.domain.iter_mut().zip(self.center) {
            let half = (range[1] - range[0]) / 2.0 * self.settings.shrink;
            *range = [mid - half, mid + half];
        }
        let widest = self
            .domain
            .iter()
            .map(|r| r[1] - r[0])
            .fold(0.0, f64::max);
        if widest < self.settings.parameter_tolerance {
            return Some(StopReason::ParameterTolerance);
        }
        if self.iterations >= self.settings.max_iterations {
            return Some(StopReason::MaxIterations);
        }
        None
    }
}

// =============================================================================
// Experiment
// =============================================================================

struct GridRun {
    path: PathBuf,
    /// `[x, y, reading]` rows per iteration, in acquisition order
    iterations: Vec<Vec<[f64; 3]>>,
}

/// Two-actuator grid search for the minimum of a scalar input.
pub struct GridOptimize {
    properties: PropertySet,
    inputs: Collaborators<dyn Input>,
    valves: [Collaborators<dyn Axis>; 2],
    sink: Arc<dyn ResultSink>,
    run: Mutex<Option<GridRun>>,
}

impl GridOptimize {
    /// Experiment saving through a [`TsvFileSink`].
    pub fn new() -> AppResult<Self> {
        let mut specs = vec![
            PropertySpec::new("DAQ", PropertyKind::Choice, 0).choices(NO_CHOICES),
            PropertySpec::new("Convergence Power", PropertyKind::Input, "2").info("float"),
            PropertySpec::new("Function Tolerance", PropertyKind::Input, "0.03").info("float"),
            PropertySpec::new("Parameter Tolerance", PropertyKind::Input, "0.1").info("float"),
            PropertySpec::new("Max Iterations", PropertyKind::Spin, 20).info(json!([1, 1000])),
            PropertySpec::new("Grid Type", PropertyKind::Choice, 0).choices(GRID_TYPES),
        ];
        for axis in 1..=2 {
            specs.extend([
                PropertySpec::new(format!("Valve {axis}"), PropertyKind::Choice, 0)
                    .choices(NO_CHOICES),
                PropertySpec::new(format!("Minimum {axis}"), PropertyKind::Input, "-10.75")
                    .info("float"),
                PropertySpec::new(format!("Maximum {axis}"), PropertyKind::Input, "9.31")
                    .info("float"),
                PropertySpec::new(format!("# of Steps {axis}"), PropertyKind::Spin, 12)
                    .info(json!([1, 300])),
                // free text: holds "NA" while the search is randomized
                PropertySpec::new(format!("Guess {axis}"), PropertyKind::Input, "1"),
            ]);
        }
        specs.extend([
            PropertySpec::new("Random", PropertyKind::Checkbox, 0)
                .info("randomize search")
                .event("on_randomize"),
            PropertySpec::new("Basename", PropertyKind::Input, ""),
            PropertySpec::new("Output Path", PropertyKind::File, "").info("path"),
            PropertySpec::new("Progress", PropertyKind::Progress, 0),
            PropertySpec::new("Start", PropertyKind::Button, "Scan").event(START_EVENT),
        ]);
        Ok(Self {
            properties: PropertySet::from_specs(specs)?,
            inputs: Collaborators::new(),
            valves: [Collaborators::new(), Collaborators::new()],
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

    /// Coordinate list of the last run: newest iteration first, each
    /// iteration sorted by reading.
    pub fn coordinates(&self) -> Vec<[f64; 3]> {
        let guard = self.run.lock();
        let Some(run) = guard.as_ref() else {
            return Vec::new();
        };
        run.iterations
            .iter()
            .rev()
            .flat_map(|rows| {
                let mut sorted = rows.clone();
                sorted.sort_by(|a, b| a[2].total_cmp(&b[2]));
                sorted
            })
            .collect()
    }

    /// Lowest reading of the last run as `[x, y, reading]`.
    pub fn best(&self) -> Option<[f64; 3]> {
        self.coordinates()
            .into_iter()
            .min_by(|a, b| a[2].total_cmp(&b[2]))
    }

    fn toggle_guesses(&self) -> AppResult<()> {
        for axis in 1..=2 {
            let query = format!("guess {axis}");
            let next = if self.properties.value(&query)?.as_text().trim() == NO_GUESS {
                "1"
            } else {
                NO_GUESS
            };
            self.properties.set_value(&query, next)?;
        }
        Ok(())
    }

    fn settings(&self, snapshot: &PropertySnapshot) -> AppResult<SearchSettings> {
        let mut domain = [[0.0; 2]; 2];
        let mut steps = [0; 2];
        for axis in 0..2 {
            let min = snapshot.float(&format!("minimum {}", axis + 1))?;
            let max = snapshot.float(&format!("maximum {}", axis + 1))?;
            if !(min.is_finite() && max.is_finite() && min < max) {
                return Err(DaqError::invalid(
                    format!("Maximum {}", axis + 1),
                    format!("range [{min}, {max}] is empty"),
                ));
            }
            domain[axis] = [min, max];
            steps[axis] = snapshot.count(&format!("steps {}", axis + 1))?.max(1);
        }
        if steps[0] * steps[1] > MAX_SCAN_POINTS {
            return Err(DaqError::invalid(
                "# of Steps",
                format!("more than {MAX_SCAN_POINTS} grid points"),
            ));
        }

        let shuffle = snapshot.flag("random")?;
        let guess = if shuffle {
            [0.0; 2]
        } else {
            [snapshot.float("guess 1")?, snapshot.float("guess 2")?]
        };

        let power = snapshot.float("convergence power")?;
        if !(power.is_finite() && power > 1.0) {
            return Err(DaqError::invalid(
                "Convergence Power",
                format!("{power} does not shrink the domain"),
            ));
        }
        let tolerance = |query: &str, label: &str| -> AppResult<f64> {
            let value = snapshot.float(query)?;
            if value.is_finite() && value >= 0.0 {
                Ok(value)
            } else {
                Err(DaqError::invalid(label, format!("{value} is not a tolerance")))
            }
        };

        Ok(SearchSettings {
            domain,
            steps,
            guess,
            shuffle,
            spacing: GridSpacing::from_index(snapshot.index("grid type")?),
            shrink: 1.0 / power,
            function_tolerance: tolerance("function tolerance", "Function Tolerance")?,
            parameter_tolerance: tolerance("parameter tolerance", "Parameter Tolerance")?,
            max_iterations: snapshot.count("max iterations")?.max(1),
        })
    }
}

#[async_trait]
impl Module for GridOptimize {
    fn name(&self) -> &str {
        "Grid Optimize 2D"
    }

    fn properties(&self) -> &PropertySet {
        &self.properties
    }

    async fn initialize(&self, ctx: &BindingContext<'_>) -> AppResult<()> {
        self.inputs.bind(&self.properties, "daq", ctx.inputs())?;
        self.valves[0].bind(&self.properties, "valve 1", ctx.axes())?;
        self.valves[1].bind(&self.properties, "valve 2", ctx.axes())?;
        if self.valves[1].len() > 1 {
            self.properties.set_value("valve 2", 1i64)?;
        }
        Ok(())
    }

    fn handle_event(&self, event: &str) -> AppResult<()> {
        match event {
            "on_randomize" => self.toggle_guesses(),
            _ => Ok(()),
        }
    }
}

impl Experiment for GridOptimize {
    fn prepare(&self) -> AppResult<ScanPlan> {
        let snapshot = self.properties.snapshot();
        let input = self.inputs.require(snapshot.index("daq")?, self.name(), "input")?;
        let first = self.valves[0].require(snapshot.index("valve 1")?, self.name(), "axis")?;
        let second = self.valves[1].require(snapshot.index("valve 2")?, self.name(), "axis")?;
        if first.label() == second.label() {
            return Err(DaqError::invalid(
                "Valve 2",
                format!("'{}' already drives the first axis", first.label()),
            ));
        }
        let settings = self.settings(&snapshot)?;

        let basename = match snapshot.text("basename")?.trim() {
            "" => DEFAULT_BASENAME.to_string(),
            name => name.to_string(),
        };
        let path = output_dir(&snapshot.text("output path")?).join(format!("{basename}.txt"));
        *self.run.lock() = Some(GridRun {
            path,
            iterations: Vec::new(),
        });
        self.properties.set_value("progress", 0.0)?;
        info!(
            experiment = self.name(),
            input = input.label(),
            valves = ?[first.label(), second.label()],
            spacing = ?settings.spacing,
            max_iterations = settings.max_iterations,
            "grid search prepared"
        );

        let protocol = GridOptimizeProtocol {
            input: input.clone(),
            valves: [first.clone(), second.clone()],
            search: GridSearch::new(settings),
            completed: 0,
        };
        Ok(ScanPlan::new(protocol)
            .using(&input)
            .using(&first)
            .using(&second))
    }

    fn on_update(&self, update: &ScanUpdate) -> AppResult<()> {
        let Measurement::Grid { x, y, value } = update.measurement else {
            return Ok(());
        };
        if let Some(run) = self.run.lock().as_mut() {
            if run.iterations.len() <= update.set {
                run.iterations.resize_with(update.set + 1, Vec::new);
            }
            run.iterations[update.set].push([x, y, value]);
        }
        if let Some(progress) = update.progress {
            self.properties.set_value("progress", progress)?;
        }
        Ok(())
    }

    fn on_finished(&self, summary: &ScanSummary) -> AppResult<()> {
        self.properties.set_value("progress", 100.0)?;
        let rows = self.coordinates();
        let Some(path) = self.run.lock().as_ref().map(|run| run.path.clone()) else {
            return Ok(());
        };
        if rows.is_empty() {
            warn!(experiment = self.name(), outcome = ?summary.outcome, "no readings to save");
            return Ok(());
        }
        self.sink
            .write_table(&path, &ColumnTable::from_rows(rows.iter().copied())?)?;
        if let Some([x, y, value]) = self.best() {
            info!(experiment = self.name(), path = %path.display(), x, y, value, "coordinate list saved");
        }
        Ok(())
    }
}

// =============================================================================
// Protocol
// =============================================================================

struct GridOptimizeProtocol {
    input: Bound<dyn Input>,
    valves: [Bound<dyn Axis>; 2],
    search: GridSearch,
    completed: usize,
}

#[async_trait]
impl ScanProtocol for GridOptimizeProtocol {
    async fn run(&mut self, ctx: &ScanContext) -> AppResult<()> {
        if !ctx.sleep(ctx.timing().pre_scan_delay()).await {
            return Ok(());
        }
        let mut progress = ProgressCycle::stepped(self.search.grid_len());
        progress.advance();

        loop {
            let iteration = self.search.iterations();
            let mut best: Option<GridSample> = None;
            for (point, at) in self.search.next_grid().into_iter().enumerate() {
                for (valve, target) in self.valves.iter().zip(at) {
                    if !ctx.move_axis(valve.device().as_ref(), target).await? {
                        return Ok(());
                    }
                }
                let value = self.input.device().read_at(&at).await?;
                ctx.update(ScanUpdate {
                    set: iteration,
                    point: Some(point),
                    position: at[0],
                    shutter: ShutterState::Open,
                    measurement: Measurement::Grid {
                        x: at[0],
                        y: at[1],
                        value,
                    },
                    progress: Some(progress.advance()),
                })
                .await?;
                if best.map_or(true, |b| value < b.value) {
                    best = Some(GridSample { at, value });
                }
                if !ctx.sleep(ctx.timing().inter_point_delay()).await {
                    return Ok(());
                }
            }
            let Some(best) = best else {
                return Ok(());
            };

            let stop = self.search.conclude(best);
            self.completed += 1;
            debug!(
                experiment = ctx.experiment(),
                iteration,
                value = best.value,
                domain = ?self.search.domain(),
                "grid iteration complete"
            );
            ctx.status(format!(
                "iteration {}: {:.4} at ({:.4}, {:.4})",
                iteration + 1,
                best.value,
                best.at[0],
                best.at[1]
            ))
            .await?;
            if let Some(reason) = stop {
                info!(
                    experiment = ctx.experiment(),
                    ?reason,
                    iterations = self.completed,
                    "grid search finished"
                );
                return Ok(());
            }
        }
    }

    async fn cleanup(&mut self, ctx: &ScanContext) -> AppResult<()> {
        let first = ctx.return_axis(self.valves[0].device().as_ref(), 0.0).await;
        let second = ctx.return_axis(self.valves[1].device().as_ref(), 0.0).await;
        first.and(second)
    }

    fn completed_sets(&self) -> usize {
        self.completed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{StageConfig, TimingConfig};
    use crate::data::MemorySink;
    use crate::experiment::events::{ScanEvent, ScanMessage, ScanOutcome};
    use crate::experiment::protocols::testing::apply_events;
    use crate::hardware::cancel::CancelToken;
    use crate::hardware::mock::{DummySensor, DummyValve};
    use crate::hardware::registry::ModuleRegistry;
    use crate::modules::{ModuleEntry, ModuleStatus};
    use std::path::Path;
    use tokio::sync::mpsc;
    use uuid::Uuid;

    struct Rig {
        _registry: ModuleRegistry,
        sensor: Arc<DummySensor>,
        valves: [Arc<DummyValve>; 2],
        optimize: Arc<GridOptimize>,
    }

    async fn rig(sink: Arc<MemorySink>) -> Rig {
        let sensor = Arc::new(DummySensor::new().unwrap());
        let valves = [
            Arc::new(DummyValve::new().unwrap()),
            Arc::new(DummyValve::new().unwrap()),
        ];
        let optimize = Arc::new(GridOptimize::new().unwrap().with_sink(sink));
        let registry = ModuleRegistry::new(vec![
            ModuleEntry::input(sensor.clone()),
            ModuleEntry::axis(valves[0].clone()),
            ModuleEntry::axis(valves[1].clone()),
            ModuleEntry::experiment(optimize.clone()),
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
        // parabola with its minimum at (1, 1), no noise
        sensor.properties().set_value("function", 1i64).unwrap();
        optimize.properties().set_value("output path", "out").unwrap();
        Rig {
            _registry: registry,
            sensor,
            valves,
            optimize,
        }
    }

    /// A whole search queues several hundred events.
    fn roomy_context() -> (ScanContext, mpsc::Receiver<ScanMessage>) {
        let (tx, rx) = mpsc::channel(4096);
        let ctx = ScanContext::new(
            Uuid::new_v4(),
            "Grid Optimize 2D",
            CancelToken::new(),
            tx,
            TimingConfig::immediate(),
            StageConfig::default(),
        );
        (ctx, rx)
    }

    fn summary(completed_sets: usize) -> ScanSummary {
        ScanSummary {
            run_id: Uuid::new_v4(),
            outcome: ScanOutcome::Completed,
            completed_sets,
            reference: None,
        }
    }

    fn settings() -> SearchSettings {
        SearchSettings {
            domain: [[-10.0, 10.0], [-10.0, 10.0]],
            steps: [5, 5],
            guess: [0.0, 0.0],
            shuffle: false,
            spacing: GridSpacing::Linear,
            shrink: 0.5,
            function_tolerance: 0.03,
            parameter_tolerance: 0.1,
            max_iterations: 20,
        }
    }

    fn sample(x: f64, y: f64, value: f64) -> GridSample {
        GridSample { at: [x, y], value }
    }

    #[test]
    fn test_grid_visits_nearest_points_first() {
        let search = GridSearch::new(SearchSettings {
            guess: [5.0, 5.0],
            ..settings()
        });
        let grid = search.next_grid();
        assert_eq!(grid.len(), 25);
        assert_eq!(grid[0], [5.0, 5.0]);
        assert_eq!(grid[24], [-10.0, -10.0]);
    }

    #[test]
    fn test_first_iteration_shrinks_around_best() {
        let mut search = GridSearch::new(settings());
        assert_eq!(search.conclude(sample(5.0, -5.0, 3.0)), None);
        assert_eq!(search.center(), [5.0, -5.0]);
        assert_eq!(search.domain(), [[0.0, 10.0], [-10.0, 0.0]]);
    }

    #[test]
    fn test_small_improvement_stops_on_function_tolerance() {
        let mut search = GridSearch::new(settings());
        assert_eq!(search.conclude(sample(0.0, 0.0, 1.0)), None);
        assert_eq!(
            search.conclude(sample(0.5, 0.0, 0.98)),
            Some(StopReason::FunctionTolerance)
        );
        assert_eq!(search.iterations(), 2);
    }

    #[test]
    fn test_worse_reading_still_shrinks() {
        let mut search = GridSearch::new(settings());
        assert_eq!(search.conclude(sample(0.0, 0.0, 1.0)), None);
        assert_eq!(search.conclude(sample(2.0, 2.0, 4.0)), None);
        assert_eq!(search.domain(), [[-0.5, 4.5], [-0.5, 4.5]]);
    }

    #[test]
    fn test_narrow_domain_stops_on_parameter_tolerance() {
        let mut search = GridSearch::new(SearchSettings {
            parameter_tolerance: 5.0,
            ..settings()
        });
        assert_eq!(search.conclude(sample(0.0, 0.0, 10.0)), None);
        assert_eq!(search.conclude(sample(0.0, 0.0, 9.0)), None);
        assert_eq!(
            search.conclude(sample(0.0, 0.0, 8.0)),
            Some(StopReason::ParameterTolerance)
        );
    }

    #[test]
    fn test_iteration_limit() {
        let mut search = GridSearch::new(SearchSettings {
            max_iterations: 2,
            ..settings()
        });
        assert_eq!(search.conclude(sample(0.0, 0.0, 10.0)), None);
        assert_eq!(
            search.conclude(sample(0.0, 0.0, 9.0)),
            Some(StopReason::MaxIterations)
        );
    }

    #[test]
    fn test_linear_spacing() {
        assert_eq!(
            GridSpacing::Linear.samples(0.0, 10.0, 6, 3.0),
            vec![0.0, 2.0, 4.0, 6.0, 8.0, 10.0]
        );
        assert_eq!(GridSpacing::Linear.samples(2.0, 4.0, 1, 3.0), vec![2.0]);
    }

    #[test]
    fn test_warped_spacing_is_finest_at_center() {
        for spacing in [GridSpacing::AntiGaussian, GridSpacing::Erf] {
            for center in [0.0, 4.0, -7.0] {
                let samples = spacing.samples(-10.0, 10.0, 21, center);
                assert_eq!(samples.len(), 21);
                assert_eq!(samples[0], -10.0);
                assert!((samples[20] - 10.0).abs() < 1e-9);

                let gaps: Vec<f64> = samples.windows(2).map(|w| w[1] - w[0]).collect();
                assert!(gaps.iter().all(|g| *g > 0.0), "{spacing:?} {center}: {samples:?}");
                let (narrowest, gap) = gaps
                    .iter()
                    .enumerate()
                    .min_by(|a, b| a.1.total_cmp(b.1))
                    .unwrap();
                let middle = (samples[narrowest] + samples[narrowest + 1]) / 2.0;
                assert!((middle - center).abs() < 0.5, "{spacing:?} {center}: {middle}");
                assert!(gaps[0].max(gaps[19]) > 2.0 * gap);
            }
        }
    }

    #[test]
    fn test_erf_approximation() {
        assert!(erf(0.0).abs() < 1e-6);
        assert!((erf(1.0) - 0.842_700_79).abs() < 1e-6);
        assert!((erf(-2.0) + 0.995_322_27).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_search_finds_parabola_minimum() {
        let sink = Arc::new(MemorySink::new());
        let rig = rig(sink.clone()).await;
        let optimize = rig.optimize.as_ref();
        optimize.properties().set_value("basename", "valves").unwrap();

        let mut plan = optimize.prepare().unwrap();
        assert_eq!(plan.devices, vec!["Dummy Sensor", "Dummy Valve #1", "Dummy Valve #2"]);
        let (ctx, mut rx) = roomy_context();
        plan.protocol.run(&ctx).await.unwrap();
        plan.protocol.cleanup(&ctx).await.unwrap();

        // domain halves each time until the improvement drops below 0.03
        let iterations = plan.protocol.completed_sets();
        assert_eq!(iterations, 6);
        let events = apply_events(&mut rx, optimize);
        let statuses = events
            .iter()
            .filter(|e| matches!(e, ScanEvent::Status { .. }))
            .count();
        assert_eq!(statuses, iterations);
        optimize.on_finished(&summary(iterations)).unwrap();

        let [x, y, value] = optimize.best().unwrap();
        assert!((x - 1.0).abs() < 0.05 && (y - 1.0).abs() < 0.05, "({x}, {y})");
        assert!(value < 0.01);
        for valve in &rig.valves {
            assert_eq!(valve.goto_history().last(), Some(&0.0));
        }
        assert_eq!(optimize.properties().value("progress").unwrap().as_f64(), Some(100.0));

        let table = sink.table(Path::new("out/valves.txt")).unwrap();
        assert_eq!(table.row_count(), iterations * 144);
        let first_block = &table.column(2).unwrap()[..144];
        assert!(first_block.windows(2).all(|w| w[0] <= w[1]));
        // the last grid overshot slightly; its best is not the overall best
        assert!(first_block[0] > value && first_block[0] < 0.01);
    }

    #[tokio::test]
    async fn test_empty_basename_saves_default_name() {
        let sink = Arc::new(MemorySink::new());
        let rig = rig(sink.clone()).await;
        let props = rig.optimize.properties();
        props.set_value("max iterations", 1i64).unwrap();
        props.set_value("steps 1", 3i64).unwrap();
        props.set_value("steps 2", 2i64).unwrap();

        let mut plan = rig.optimize.prepare().unwrap();
        let (ctx, mut rx) = roomy_context();
        plan.protocol.run(&ctx).await.unwrap();
        plan.protocol.cleanup(&ctx).await.unwrap();
        apply_events(&mut rx, rig.optimize.as_ref());
        rig.optimize.on_finished(&summary(1)).unwrap();

        let table = sink.table(Path::new("out/alpha0.txt")).unwrap();
        assert_eq!(table.row_count(), 6);
        assert_eq!(table.column(0).unwrap().len(), 6);
    }

    #[tokio::test]
    async fn test_randomize_replaces_guesses() {
        let rig = rig(Arc::new(MemorySink::new())).await;
        let props = rig.optimize.properties();
        props.set_value("max iterations", 2i64).unwrap();

        props.set_value("random", true).unwrap();
        rig.optimize.handle_event("on_randomize").unwrap();
        assert_eq!(props.value("guess 1").unwrap().as_text(), "NA");
        assert_eq!(props.value("guess 2").unwrap().as_text(), "NA");

        let mut plan = rig.optimize.prepare().unwrap();
        let (ctx, mut rx) = roomy_context();
        plan.protocol.run(&ctx).await.unwrap();
        plan.protocol.cleanup(&ctx).await.unwrap();
        apply_events(&mut rx, rig.optimize.as_ref());
        assert_eq!(rig.optimize.coordinates().len(), 2 * 144);

        rig.optimize.handle_event("on_randomize").unwrap();
        props.set_value("random", false).unwrap();
        assert_eq!(props.value("guess 1").unwrap().as_text(), "1");
        assert!(rig.optimize.prepare().is_ok());
    }

    #[tokio::test]
    async fn test_invalid_settings_are_rejected() {
        let rig = rig(Arc::new(MemorySink::new())).await;
        let props = rig.optimize.properties();

        props.set_value("guess 2", "NA").unwrap();
        assert!(matches!(rig.optimize.prepare(), Err(DaqError::InvalidValue { .. })));
        props.set_value("guess 2", "1").unwrap();

        props.set_value("convergence power", "1").unwrap();
        assert!(matches!(rig.optimize.prepare(), Err(DaqError::InvalidValue { .. })));
        props.set_value("convergence power", "2").unwrap();

        props.set_value("valve 2", 0i64).unwrap();
        assert!(matches!(rig.optimize.prepare(), Err(DaqError::InvalidValue { .. })));
        props.set_value("valve 2", 1i64).unwrap();

        props.set_value("minimum 1", "20").unwrap();
        assert!(matches!(rig.optimize.prepare(), Err(DaqError::InvalidValue { .. })));
        props.set_value("minimum 1", "-10.75").unwrap();

        assert!(rig.optimize.prepare().is_ok());
        assert_eq!(rig.sensor.properties().value("function").unwrap().as_index(), Some(1));
    }
}
