//! Scan point generation.
//!
//! A [`StageRange`] is the stage block every scanning experiment carries in its
//! property set ("From (fs)", "Till (fs)", "Step Size (fs)", "Mode", "Random",
//! "Use File"). It is read from a [`PropertySnapshot`] at scan start and turned
//! into a [`ScanPointSet`].
//!
//! # Modes
//!
//! - **linear**: `count = max(2, floor(|stop - start| / |step|) + 1)`, points
//!   `start + i * step`; the last point is the recomputed stop
//!   `(count - 1) * step + start`, so both endpoints are always visited
//! - **logarithmic**: `count` points geometrically spaced between strictly
//!   positive `start` and `stop`
//! - **from file**: first numeric column of a text file
//!
//! Randomizing changes the visiting order only; [`ScanPointSet::sorted`] keeps
//! the canonical values for output files.

use rand::seq::SliceRandom;
use std::path::{Path, PathBuf};

use crate::error::{AppResult, DaqError};
use crate::property::{PropertyKind, PropertySet, PropertySnapshot, PropertySpec};

/// Upper bound on the positions of one scan.
pub const MAX_SCAN_POINTS: usize = 100_000;

const STEP_SIZE_LABEL: &str = "Step Size (fs)";
const STEP_COUNT_LABEL: &str = "# of Steps";

/// How stage positions are generated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepMode {
    /// Constant step size
    Linear,
    /// Geometric spacing, step field holds the point count
    Logarithmic,
    /// Positions listed in a file
    FromFile,
}

impl StepMode {
    /// Mode for a "Mode" choice index.
    pub fn from_index(index: usize) -> Self {
        match index {
            1 => StepMode::Logarithmic,
            2 => StepMode::FromFile,
            _ => StepMode::Linear,
        }
    }
}

/// Stage block of an experiment's properties.
#[derive(Debug, Clone, PartialEq)]
pub struct StageRange {
    /// First position
    pub start: f64,
    /// Last position (before recomputation)
    pub stop: f64,
    /// Step size (linear) or point count (logarithmic)
    pub step: f64,
    /// Generation mode
    pub mode: StepMode,
    /// Visit points in random order
    pub randomize: bool,
    /// Position file for [`StepMode::FromFile`]
    pub file: Option<PathBuf>,
}

impl StageRange {
    /// Property definitions of the stage block with the given defaults.
    pub fn property_specs(from: f64, till: f64, step: f64) -> Vec<PropertySpec> {
        vec![
            PropertySpec::new("From (fs)", PropertyKind::Input, from.to_string())
                .info("float")
                .event("on_axis_range_change"),
            PropertySpec::new("Till (fs)", PropertyKind::Input, till.to_string())
                .info("float")
                .event("on_axis_range_change"),
            PropertySpec::new(STEP_SIZE_LABEL, PropertyKind::Input, step.to_string())
                .info("float")
                .event("on_axis_range_change"),
            PropertySpec::new("Mode", PropertyKind::Choice, 0)
                .choices(["linear", "logarithmic", "from file"])
                .event("on_axis_range_change"),
            PropertySpec::new("Random", PropertyKind::Checkbox, false).info("randomize steps"),
            PropertySpec::new("Use File", PropertyKind::File, "").info("open"),
        ]
    }

    /// Read the stage block from a snapshot.
    pub fn from_snapshot(snapshot: &PropertySnapshot) -> AppResult<Self> {
        let file = snapshot.text("use file")?;
        Ok(Self {
            start: snapshot.float("from")?,
            stop: snapshot.float("till")?,
            step: snapshot.float("step")?,
            mode: StepMode::from_index(snapshot.index("mode")?),
            randomize: snapshot.flag("random")?,
            file: (!file.trim().is_empty()).then(|| PathBuf::from(file.trim())),
        })
    }

    /// Generate the point set.
    pub fn points(&self) -> AppResult<ScanPointSet> {
        let points = match self.mode {
            StepMode::Linear => ScanPointSet::linear(self.start, self.stop, self.step)?,
            StepMode::Logarithmic => {
                ScanPointSet::logarithmic(self.start, self.stop, self.step.abs().trunc() as usize)?
            }
            StepMode::FromFile => match &self.file {
                Some(path) => ScanPointSet::from_file(path)?,
                None => return Err(DaqError::EmptyScan),
            },
        };
        Ok(if self.randomize {
            points.shuffled()
        } else {
            points
        })
    }

    /// Rewrite the stage fields after an edit.
    ///
    /// Linear mode recomputes "Till" so the range is a whole number of steps;
    /// logarithmic mode relabels the step field "# of Steps" and forces both
    /// endpoints positive.
    pub fn normalize(properties: &PropertySet) -> AppResult<()> {
        let float = |query: &str| -> AppResult<f64> {
            properties
                .value(query)?
                .as_f64()
                .ok_or_else(|| DaqError::invalid(query, "not a number"))
        };
        let mode = StepMode::from_index(properties.value("mode")?.as_index().unwrap_or(0));
        let mut start = float("from")?;
        let mut stop = float("till")?;
        let mut step = float("step")?;

        match mode {
            StepMode::Logarithmic => {
                properties.set_label("step", STEP_COUNT_LABEL)?;
                start = positive_or_one(start);
                stop = positive_or_one(stop);
                step = step.abs();
            }
            StepMode::Linear => {
                properties.set_label("step", STEP_SIZE_LABEL)?;
                let count = linear_count(start, stop, step)?;
                stop = (count - 1) as f64 * step + start;
            }
            StepMode::FromFile => {}
        }

        properties.set_value("from", start.to_string())?;
        properties.set_value("till", stop.to_string())?;
        properties.set_value("step", step.to_string())?;
        Ok(())
    }
}

fn positive_or_one(x: f64) -> f64 {
    if x > 0.0 && x.is_finite() {
        x
    } else {
        1.0
    }
}

fn linear_count(start: f64, stop: f64, step: f64) -> AppResult<usize> {
    if step == 0.0 || !step.is_finite() {
        return Err(DaqError::invalid(STEP_SIZE_LABEL, "step size must be non-zero"));
    }
    let count = ((stop - start).abs() / step.abs() + 1.0).trunc();
    if !count.is_finite() {
        return Err(DaqError::invalid(STEP_SIZE_LABEL, "range is not finite"));
    }
    if count > MAX_SCAN_POINTS as f64 {
        return Err(too_many_points(STEP_SIZE_LABEL, count));
    }
    Ok((count as usize).max(2))
}

fn too_many_points(label: &str, count: f64) -> DaqError {
    DaqError::invalid(
        label,
        format!("{count:.0} points exceed the limit of {MAX_SCAN_POINTS}"),
    )
}

/// Ordered scan positions plus their sorted canonical values.
///
/// Never empty.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanPointSet {
    visit: Vec<f64>,
    sorted: Vec<f64>,
}

impl ScanPointSet {
    /// Wrap explicit positions; rejects an empty or non-finite sequence.
    pub fn new(points: Vec<f64>) -> AppResult<Self> {
        if points.is_empty() {
            return Err(DaqError::EmptyScan);
        }
        if points.len() > MAX_SCAN_POINTS {
            return Err(too_many_points("points", points.len() as f64));
        }
        if let Some(bad) = points.iter().find(|p| !p.is_finite()) {
            return Err(DaqError::invalid("points", format!("{bad} is not a finite position")));
        }
        let mut sorted = points.clone();
        sorted.sort_by(f64::total_cmp);
        Ok(Self {
            visit: points,
            sorted,
        })
    }

    /// Linear points including both endpoints.
    pub fn linear(start: f64, stop: f64, step: f64) -> AppResult<Self> {
        let count = linear_count(start, stop, step)?;
        Self::new((0..count).map(|i| start + i as f64 * step).collect())
    }

    /// `count` geometrically spaced points between positive endpoints.
    pub fn logarithmic(start: f64, stop: f64, count: usize) -> AppResult<Self> {
        if start <= 0.0 || stop <= 0.0 {
            return Err(DaqError::invalid(
                "From (fs)",
                "logarithmic stepping needs positive start and stop",
            ));
        }
        if count == 0 {
            return Err(DaqError::EmptyScan);
        }
        if count > MAX_SCAN_POINTS {
            return Err(too_many_points(STEP_COUNT_LABEL, count as f64));
        }
        if count == 1 {
            return Self::new(vec![start]);
        }
        let (lo, hi) = (start.log10(), stop.log10());
        let delta = (hi - lo) / (count - 1) as f64;
        let mut points: Vec<f64> = (0..count)
            .map(|i| 10f64.powf(lo + i as f64 * delta))
            .collect();
        // pin the endpoints against powf rounding
        points[0] = start;
        points[count - 1] = stop;
        Self::new(points)
    }

    /// First numeric column of a text file.
    ///
    /// Blank lines and `#` comments are skipped; columns may be separated by
    /// whitespace, tabs or commas.
    pub fn from_file(path: &Path) -> AppResult<Self> {
        let text = std::fs::read_to_string(path)?;
        let mut points = Vec::new();
        for (line_no, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let first = line
                .split(|c: char| c.is_whitespace() || c == ',')
                .find(|s| !s.is_empty())
                .unwrap_or(line);
            let value: f64 = first.parse().map_err(|_| {
                DaqError::invalid(
                    "Use File",
                    format!("{}:{}: '{}' is not a number", path.display(), line_no + 1, first),
                )
            })?;
            points.push(value);
        }
        Self::new(points)
    }

    /// Same points in random visiting order.
    pub fn shuffled(mut self) -> Self {
        self.visit.shuffle(&mut rand::thread_rng());
        self
    }

    /// Positions in visiting order.
    pub fn visit_order(&self) -> &[f64] {
        &self.visit
    }

    /// Positions in ascending order.
    pub fn sorted(&self) -> &[f64] {
        &self.sorted
    }

    /// Number of points.
    pub fn len(&self) -> usize {
        self.visit.len()
    }

    /// Always false; kept for API symmetry with collections.
    pub fn is_empty(&self) -> bool {
        self.visit.is_empty()
    }

    /// First position visited; the axis returns here when a scan ends.
    pub fn first(&self) -> f64 {
        self.visit[0]
    }

    /// Distance between the extreme positions.
    pub fn span(&self) -> f64 {
        self.sorted[self.sorted.len() - 1] - self.sorted[0]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_linear_count_and_endpoint_law() {
        let cases = [
            (-500.0, 2500.0, 20.0),
            (0.0, 100.0, 30.0),
            (10.0, 10.0, 5.0),
            (100.0, 0.0, -7.5),
            (0.0, 1.0, 3.0),
            (-3.3, 7.9, 0.4),
        ];
        for (start, stop, step) in cases {
            let points = ScanPointSet::linear(start, stop, step).unwrap();
            let expected = ((stop - start).abs() / step.abs()).floor() as usize + 1;
            assert_eq!(points.len(), expected.max(2), "{start}..{stop} by {step}");

            let last = points.visit_order()[points.len() - 1];
            let recomputed = (points.len() - 1) as f64 * step + start;
            assert!((last - recomputed).abs() < 1e-9);
            assert_eq!(points.first(), start);
        }
    }

    #[test]
    fn test_linear_default_stage_block() {
        let points = ScanPointSet::linear(-500.0, 2500.0, 20.0).unwrap();
        assert_eq!(points.len(), 151);
        assert_eq!(points.visit_order()[150], 2500.0);
    }

    #[test]
    fn test_zero_step_rejected() {
        assert!(matches!(
            ScanPointSet::linear(0.0, 10.0, 0.0),
            Err(DaqError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_oversized_ranges_rejected_before_allocating() {
        assert!(matches!(
            ScanPointSet::linear(0.0, 1e15, 1e-3),
            Err(DaqError::InvalidValue { .. })
        ));
        assert!(matches!(
            ScanPointSet::logarithmic(1.0, 10.0, usize::MAX),
            Err(DaqError::InvalidValue { .. })
        ));

        let range = StageRange {
            start: 1.0,
            stop: 1000.0,
            step: 1e12,
            mode: StepMode::Logarithmic,
            randomize: false,
            file: None,
        };
        assert!(matches!(range.points(), Err(DaqError::InvalidValue { .. })));

        let largest = ScanPointSet::linear(0.0, (MAX_SCAN_POINTS - 1) as f64, 1.0).unwrap();
        assert_eq!(largest.len(), MAX_SCAN_POINTS);
    }

    #[test]
    fn test_logarithmic_is_geometric_and_monotonic() {
        for (start, stop, count) in [(1.0, 1000.0, 4), (0.5, 20.0, 17), (300.0, 3.0, 9)] {
            let points = ScanPointSet::logarithmic(start, stop, count).unwrap();
            let p = points.visit_order();
            assert_eq!(p.len(), count);
            assert_eq!(p[0], start);
            assert_eq!(p[count - 1], stop);

            let ratio = p[1] / p[0];
            for w in p.windows(2) {
                assert!((w[1] / w[0] - ratio).abs() < 1e-9);
                if stop > start {
                    assert!(w[1] > w[0]);
                } else {
                    assert!(w[1] < w[0]);
                }
            }
        }
    }

    #[test]
    fn test_logarithmic_rejects_non_positive() {
        assert!(ScanPointSet::logarithmic(0.0, 10.0, 5).is_err());
        assert!(ScanPointSet::logarithmic(-1.0, 10.0, 5).is_err());
        assert!(matches!(
            ScanPointSet::logarithmic(1.0, 10.0, 0),
            Err(DaqError::EmptyScan)
        ));
    }

    #[test]
    fn test_empty_sequence_rejected() {
        assert!(matches!(ScanPointSet::new(vec![]), Err(DaqError::EmptyScan)));
        assert!(ScanPointSet::new(vec![1.0, f64::NAN]).is_err());
    }

    #[test]
    fn test_shuffle_keeps_canonical_values() {
        let points = ScanPointSet::linear(0.0, 990.0, 10.0).unwrap();
        let sorted_before = points.sorted().to_vec();
        let shuffled = points.shuffled();
        assert_eq!(shuffled.sorted(), sorted_before.as_slice());
        let mut visit = shuffled.visit_order().to_vec();
        visit.sort_by(f64::total_cmp);
        assert_eq!(visit, sorted_before);
    }

    #[test]
    fn test_from_file_reads_first_column() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# delay\tweight").unwrap();
        writeln!(file, "-100\t1.0").unwrap();
        writeln!(file).unwrap();
        writeln!(file, "250.5,2.0").unwrap();
        writeln!(file, "  1e3   3.0").unwrap();

        let points = ScanPointSet::from_file(file.path()).unwrap();
        assert_eq!(points.visit_order(), &[-100.0, 250.5, 1000.0]);
        assert_eq!(points.span(), 1100.0);
    }

    #[test]
    fn test_from_file_rejects_garbage() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "abc").unwrap();
        assert!(matches!(
            ScanPointSet::from_file(file.path()),
            Err(DaqError::InvalidValue { .. })
        ));
    }

    fn stage_props() -> PropertySet {
        PropertySet::from_specs(StageRange::property_specs(-500.0, 2500.0, 20.0)).unwrap()
    }

    #[test]
    fn test_normalize_linear_recomputes_till() {
        let props = stage_props();
        props.set_value("till", "2510").unwrap();
        props.set_value("step", "30").unwrap();
        StageRange::normalize(&props).unwrap();

        // floor(3010 / 30) + 1 = 101 points -> till = 100 * 30 - 500
        assert_eq!(props.value("till").unwrap().as_f64(), Some(2500.0));
        assert_eq!(props.label("step").unwrap(), "Step Size (fs)");
    }

    #[test]
    fn test_normalize_log_relabels_and_clamps() {
        let props = stage_props();
        props.set_value("mode", 1i64).unwrap();
        props.set_value("step", "-12").unwrap();
        StageRange::normalize(&props).unwrap();

        assert_eq!(props.label("step").unwrap(), "# of Steps");
        assert_eq!(props.value("from").unwrap().as_f64(), Some(1.0));
        assert_eq!(props.value("step").unwrap().as_f64(), Some(12.0));

        props.set_value("mode", 0i64).unwrap();
        StageRange::normalize(&props).unwrap();
        assert_eq!(props.label("step").unwrap(), "Step Size (fs)");
    }

    #[test]
    fn test_range_from_snapshot() {
        let props = stage_props();
        props.set_value("random", true).unwrap();
        let range = StageRange::from_snapshot(&props.snapshot()).unwrap();
        assert_eq!(range.mode, StepMode::Linear);
        assert!(range.randomize);
        assert_eq!(range.file, None);
        assert_eq!(range.points().unwrap().len(), 151);
    }

    #[test]
    fn test_from_file_mode_without_file_is_empty() {
        let props = stage_props();
        props.set_value("mode", 2i64).unwrap();
        let range = StageRange::from_snapshot(&props.snapshot()).unwrap();
        assert!(matches!(range.points(), Err(DaqError::EmptyScan)));
    }
}
