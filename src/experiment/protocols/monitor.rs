//! DAQ monitor: long scalar record with drift detection.
//!
//! Once more than 95 samples exist, every `duration` samples the mean of the
//! last window is compared with the mean of the whole record. A window that
//! sits more than `tolerance` standard deviations away is a fault: it is
//! appended to `faultLog.txt` when logging is enabled, and the first fault of
//! a run flips "Status" to "Unstable" and optionally sends an alert.
//!
//! When the run ends the status line shows the record's mean and standard
//! deviation.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use crate::alert::{send_instability_alert, AlertSink, LogAlertSink};
use crate::data::{ColumnTable, ResultSink, TsvFileSink};
use crate::error::{AppResult, DaqError};
use crate::experiment::context::{ProgressCycle, ScanContext};
use crate::experiment::events::{Measurement, ScanSummary, ScanUpdate, ShutterState};
use crate::experiment::protocols::{output_dir, ScanProtocol, NO_CHOICES};
use crate::experiment::{Collaborators, Experiment, ScanPlan, START_EVENT};
use crate::hardware::capabilities::Input;
use crate::hardware::registry::{BindingContext, Bound};
use crate::modules::Module;
use crate::property::{PropertyKind, PropertySet, PropertySpec};

/// Samples required before the first stability check.
const MIN_SAMPLES: usize = 95;

const STABLE: &str = "Stable";
const UNSTABLE: &str = "Unstable";
const FAULT_LOG: &str = "faultLog.txt";
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Settings read once at scan start.
#[derive(Debug, Clone)]
struct FaultPolicy {
    duration: usize,
    tolerance: f64,
    email: bool,
    sender: String,
    password: String,
    destination: String,
    log: Option<PathBuf>,
}

#[derive(Default)]
struct MonitorRecord {
    data: Vec<f64>,
    policy: Option<FaultPolicy>,
    faulted: bool,
}

/// Mean and population standard deviation.
fn mean_std(data: &[f64]) -> (f64, f64) {
    if data.is_empty() {
        return (f64::NAN, f64::NAN);
    }
    let n = data.len() as f64;
    let mean = data.iter().sum::<f64>() / n;
    let var = data.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n;
    (mean, var.sqrt())
}

/// `%g`-style formatting: six significant digits, trailing zeros trimmed.
fn format_g(x: f64) -> String {
    if x == 0.0 || !x.is_finite() {
        return format!("{x}");
    }
    let exponent = x.abs().log10().floor() as i32;
    if !(-4..6).contains(&exponent) {
        let text = format!("{x:.5e}");
        let (mantissa, exp) = text.split_once('e').unwrap_or((text.as_str(), "0"));
        let mantissa = mantissa.trim_end_matches('0').trim_end_matches('.');
        let exp: i32 = exp.parse().unwrap_or(0);
        let sign = if exp < 0 { '-' } else { '+' };
        return format!("{mantissa}e{sign}{:02}", exp.abs());
    }
    let decimals = (5 - exponent).max(0) as usize;
    let text = format!("{x:.decimals$}");
    if text.contains('.') {
        text.trim_end_matches('0').trim_end_matches('.').to_string()
    } else {
        text
    }
}

fn timestamp() -> String {
    chrono::Utc::now().format(TIMESTAMP_FORMAT).to_string()
}

/// Stability monitor for a scalar input.
pub struct DaqMonitor {
    properties: PropertySet,
    inputs: Collaborators<dyn Input>,
    sink: Arc<dyn ResultSink>,
    alerts: Arc<dyn AlertSink>,
    record: Mutex<MonitorRecord>,
}

impl DaqMonitor {
    /// Monitor saving through a [`TsvFileSink`] and logging alerts.
    pub fn new() -> AppResult<Self> {
        let properties = PropertySet::from_specs(vec![
            PropertySpec::new("DAQ", PropertyKind::Choice, 0).choices(NO_CHOICES),
            PropertySpec::new("# of Points", PropertyKind::Spin, 200).info(json!([1, 1_000_000])),
            PropertySpec::new("Progress", PropertyKind::Progress, 0),
            PropertySpec::new("Start", PropertyKind::Button, "Scan").event(START_EVENT),
            PropertySpec::new("Save", PropertyKind::Button, "Save Last Scan").event("on_save"),
            PropertySpec::new("Save To", PropertyKind::File, "daq_monitor.dat").info("save"),
            PropertySpec::new("Tolerance (std dev)", PropertyKind::Input, ".1").info("float"),
            PropertySpec::new("Average Duration", PropertyKind::Spin, 10).info(json!([1, 100_000])),
            PropertySpec::new("Status", PropertyKind::Label, STABLE),
            PropertySpec::new("Send Email at Fault", PropertyKind::Checkbox, false)
                .info("send email at initial fault"),
            PropertySpec::new("Outgoing Email Address", PropertyKind::Input, "test@gmail.com"),
            PropertySpec::new("Password", PropertyKind::Input, ""),
            PropertySpec::new("Destination Email", PropertyKind::Input, "test@gmail.com"),
            PropertySpec::new("Path", PropertyKind::File, "").info("path"),
            PropertySpec::new("Keep Fault Log", PropertyKind::Checkbox, false)
                .info("generate faultLog.txt"),
        ])?;
        Ok(Self {
            properties,
            inputs: Collaborators::new(),
            sink: Arc::new(TsvFileSink::new()),
            alerts: Arc::new(LogAlertSink),
            record: Mutex::new(MonitorRecord::default()),
        })
    }

    /// Directory for the fault log and the default save file.
    pub fn with_output_dir(self, dir: &str) -> AppResult<Self> {
        self.properties.set_value("path", dir)?;
        let file = PathBuf::from(dir).join("daq_monitor.dat");
        self.properties
            .set_value("save to", file.to_string_lossy().into_owned())?;
        Ok(self)
    }

    /// Write results through `sink` instead of the file system.
    pub fn with_sink(mut self, sink: Arc<dyn ResultSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Deliver fault alerts through `alerts`.
    pub fn with_alert_sink(mut self, alerts: Arc<dyn AlertSink>) -> Self {
        self.alerts = alerts;
        self
    }

    /// Samples recorded so far.
    pub fn samples(&self) -> Vec<f64> {
        self.record.lock().data.clone()
    }

    /// Save the last record as a single column; returns whether anything was
    /// written.
    pub fn save(&self) -> AppResult<bool> {
        let data = self.samples();
        if data.is_empty() {
            warn!(experiment = self.name(), "nothing to save yet");
            return Ok(false);
        }
        let path = PathBuf::from(self.properties.value("save to")?.as_text().trim());
        self.sink
            .write_table(&path, &ColumnTable::from_columns([data])?)?;
        info!(experiment = self.name(), path = %path.display(), "monitor record saved");
        Ok(true)
    }

    fn read_policy(&self, points: usize) -> AppResult<FaultPolicy> {
        let snapshot = self.properties.snapshot();
        let tolerance = snapshot.float("tolerance")?;
        if tolerance <= 0.0 {
            return Err(DaqError::invalid("Tolerance (std dev)", "must be positive"));
        }
        let duration = snapshot.count("duration")?.max(1);
        let log = snapshot
            .flag("fault log")?
            .then(|| output_dir(&snapshot.text("path").unwrap_or_default()).join(FAULT_LOG));

        if let Some(path) = &log {
            self.sink.append_text(
                path,
                &format!(
                    "{} - log in\n{points}measurements will be made.\nDuration = {duration}, Tolerance = {}\n\
                     Time of Fault\tCurrent Value\tCurrent Mean\tCurrent stdev\n",
                    timestamp(),
                    snapshot.text("tolerance")?,
                ),
            )?;
        }

        Ok(FaultPolicy {
            duration,
            tolerance,
            email: snapshot.flag("send email")?,
            sender: snapshot.text("outgoing")?,
            password: snapshot.text("password")?,
            destination: snapshot.text("destination")?,
            log,
        })
    }

    /// Run the stability check after a new sample; returns whether it failed.
    fn check_stability(&self, record: &mut MonitorRecord) -> AppResult<bool> {
        let Some(policy) = record.policy.clone() else {
            return Ok(false);
        };
        let len = record.data.len();
        if (len + 1) % policy.duration != 0 || len <= MIN_SAMPLES {
            return Ok(false);
        }

        let window = &record.data[len.saturating_sub(policy.duration + 1)..len - 1];
        let (sliding, _) = mean_std(window);
        let (net, std) = mean_std(&record.data);
        let deviation = ((sliding - net) / (std * policy.tolerance)).abs();
        if deviation.is_nan() || deviation <= 1.0 {
            return Ok(false);
        }

        warn!(
            experiment = self.name(),
            sliding,
            net,
            std,
            duration = policy.duration,
            tolerance = policy.tolerance,
            "instability fault"
        );
        if let Some(path) = &policy.log {
            self.sink
                .append_text(path, &format!("{}\t{sliding}\t{net}\t{std}\n", timestamp()))?;
        }
        if !record.faulted {
            record.faulted = true;
            self.properties.set_value("status", UNSTABLE)?;
            if policy.email {
                send_instability_alert(
                    &self.alerts,
                    &policy.sender,
                    &policy.password,
                    &policy.destination,
                    policy.duration,
                    policy.tolerance,
                )?;
            }
        }
        Ok(true)
    }
}

#[async_trait]
impl Module for DaqMonitor {
    fn name(&self) -> &str {
        "DAQ Monitor"
    }

    fn properties(&self) -> &PropertySet {
        &self.properties
    }

    async fn initialize(&self, ctx: &BindingContext<'_>) -> AppResult<()> {
        self.inputs.bind(&self.properties, "daq", ctx.inputs())
    }

    fn handle_event(&self, event: &str) -> AppResult<()> {
        if event == "on_save" {
            self.save()?;
        }
        Ok(())
    }
}

impl Experiment for DaqMonitor {
    fn prepare(&self) -> AppResult<ScanPlan> {
        let snapshot = self.properties.snapshot();
        let input = self.inputs.require(snapshot.index("daq")?, self.name(), "input")?;
        let points = snapshot.count("points")?;
        if points == 0 {
            return Err(DaqError::EmptyScan);
        }
        let policy = self.read_policy(points)?;

        *self.record.lock() = MonitorRecord {
            data: Vec::with_capacity(points),
            policy: Some(policy),
            faulted: false,
        };
        self.properties.set_value("status", STABLE)?;
        self.properties.set_value("progress", 0.0)?;
        info!(experiment = self.name(), input = input.label(), points, "monitor prepared");

        let protocol = MonitorProtocol {
            input: input.clone(),
            points,
            completed: 0,
        };
        Ok(ScanPlan::new(protocol).using(&input))
    }

    fn on_update(&self, update: &ScanUpdate) -> AppResult<()> {
        let Measurement::Scalar { value } = update.measurement else {
            return Ok(());
        };
        {
            let mut record = self.record.lock();
            record.data.push(value);
            self.check_stability(&mut record)?;
        }
        if let Some(progress) = update.progress {
            self.properties.set_value("progress", progress)?;
        }
        Ok(())
    }

    fn on_finished(&self, _summary: &ScanSummary) -> AppResult<()> {
        let data = self.samples();
        if data.is_empty() {
            return Ok(());
        }
        let (mean, std) = mean_std(&data);
        info!(experiment = self.name(), samples = data.len(), mean, std, "monitor finished");
        self.properties.set_value(
            "status",
            format!("Mean Value = {}\nStd.Dev = {}", format_g(mean), format_g(std)),
        )?;
        Ok(())
    }
}

// =============================================================================
// Protocol
// =============================================================================

struct MonitorProtocol {
    input: Bound<dyn Input>,
    points: usize,
    completed: usize,
}

#[async_trait]
impl ScanProtocol for MonitorProtocol {
    async fn run(&mut self, ctx: &ScanContext) -> AppResult<()> {
        if !ctx.sleep(ctx.timing().pre_scan_delay()).await {
            return Ok(());
        }
        let mut progress = ProgressCycle::stepped(self.points);
        progress.advance();

        for point in 0..self.points {
            if ctx.is_cancelled() {
                return Ok(());
            }
            let value = self.input.device().read().await?;
            ctx.update(ScanUpdate {
                set: 0,
                point: Some(point),
                position: 0.0,
                shutter: ShutterState::Open,
                measurement: Measurement::Scalar { value },
                progress: Some(progress.advance()),
            })
            .await?;
            if !ctx.sleep(ctx.timing().inter_point_delay()).await {
                return Ok(());
            }
        }
        self.completed = 1;
        Ok(())
    }

    async fn cleanup(&mut self, _ctx: &ScanContext) -> AppResult<()> {
        Ok(())
    }

    fn completed_sets(&self) -> usize {
        self.completed
    }
}
