//! Simulated Devices
//!
//! Dummy implementations of every capability so the engine runs end to end
//! without lab hardware. All waits use `tokio::time::sleep`.
//!
//! # Available Devices
//!
//! - [`DummyCamera`]: 1024-pixel chopped camera with a Gaussian pump signal
//! - [`DummySensor`]: scalar input returning `(rand - 0.5) * amplitude + offset`,
//!   plus a [`TestFunction`] of the setpoints when read with coordinates
//! - [`DummyAxis`]: delay stage with simulated travel time
//! - [`DummyValve`]: setpoint actuator that settles instantly
//! - [`DummyShutter`]: digital output with configurable polarity
//! - [`DummyLockIn`]: identified lock-in amplifier addressed by load order

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::error::{AppResult, DaqError, DeviceError, DeviceResult};
use crate::hardware::cancel::CancelToken;
use crate::hardware::capabilities::{Axis, Camera, Input, Output};
use crate::hardware::chopper::{acquire_chopped, ChopperSettings};
use crate::hardware::registry::BindingContext;
use crate::hardware::{OutputValue, SpectrumFrame};
use crate::modules::Module;
use crate::property::{PropertyKind, PropertySet, PropertySpec};

fn wait_time(properties: &PropertySet) -> Duration {
    let seconds = properties
        .value("wait")
        .ok()
        .and_then(|v| v.as_f64())
        .unwrap_or(0.0)
        .abs();
    Duration::from_secs_f64(if seconds.is_finite() { seconds } else { 0.0 })
}

// =============================================================================
// DummyCamera
// =============================================================================

/// Default pixel count of the simulated detector.
pub const DUMMY_CAMERA_WIDTH: usize = 1024;

/// Simulated CCD behind a chopper.
///
/// Pump-on rows carry a Gaussian peak on top of a flat baseline; pump-off rows
/// carry the baseline only, so the ratio channel shows the peak. Bursts can be
/// made to fail with [`DummyCamera::drop_next_bursts`] to exercise the retry
/// policy.
pub struct DummyCamera {
    properties: PropertySet,
    width: usize,
    settle_frames: usize,
    max_attempts: u32,
    dropped_bursts: AtomicU32,
}

impl DummyCamera {
    /// Camera with default width and chopper settings.
    pub fn new() -> AppResult<Self> {
        Self::with_settings(DUMMY_CAMERA_WIDTH, ChopperSettings::default())
    }

    /// Camera with explicit width and chopper policy.
    pub fn with_settings(width: usize, chopper: ChopperSettings) -> AppResult<Self> {
        let properties = PropertySet::from_specs(vec![PropertySpec::new(
            "Phase Flip",
            PropertyKind::Choice,
            usize::from(chopper.phase_flip),
        )
        .choices(["0 deg", "180 deg"])])?;

        Ok(Self {
            properties,
            width,
            settle_frames: chopper.settle_frames,
            max_attempts: chopper.max_attempts,
            dropped_bursts: AtomicU32::new(0),
        })
    }

    /// Make the next `count` bursts come back incomplete.
    pub fn drop_next_bursts(&self, count: u32) {
        self.dropped_bursts.store(count, Ordering::SeqCst);
    }

    fn chopper(&self) -> ChopperSettings {
        let phase_flip = self
            .properties
            .value("phase")
            .ok()
            .and_then(|v| v.as_index())
            .unwrap_or(0)
            == 1;
        ChopperSettings {
            settle_frames: self.settle_frames,
            max_attempts: self.max_attempts,
            phase_flip,
        }
    }

    fn synthesize(&self, total: usize, phase_flip: bool) -> Vec<Vec<f64>> {
        let mut rng = rand::thread_rng();
        let center = self.width as f64 / 2.0;
        let sigma = self.width as f64 / 25.0;
        let pump_parity = usize::from(!phase_flip);

        (0..total)
            .map(|row| {
                let pumped = row % 2 == pump_parity;
                (0..self.width)
                    .map(|px| {
                        let baseline = 1000.0 + rng.gen_range(-1.0..1.0);
                        if pumped {
                            let x = (px as f64 - center) / sigma;
                            baseline + 50.0 * (-x * x).exp()
                        } else {
                            baseline
                        }
                    })
                    .collect()
            })
            .collect()
    }

    async fn read_burst(&self, total: usize, phase_flip: bool) -> DeviceResult<Option<Vec<Vec<f64>>>> {
        // roughly one detector readout per 100 frames
        tokio::time::sleep(Duration::from_millis((total / 100) as u64)).await;

        let dropped = self
            .dropped_bursts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if dropped {
            debug!("dummy camera dropping burst of {} frames", total);
            return Ok(Some(self.synthesize(total / 2, phase_flip)));
        }
        Ok(Some(self.synthesize(total, phase_flip)))
    }
}

#[async_trait]
impl Module for DummyCamera {
    fn name(&self) -> &str {
        "Dummy Camera"
    }

    fn properties(&self) -> &PropertySet {
        &self.properties
    }
}

#[async_trait]
impl Input for DummyCamera {
    async fn read(&self) -> DeviceResult<f64> {
        // nothing cancels this token, so a placeholder means the retries ran out
        let frame = self.read_n_frames(2, &CancelToken::new()).await?;
        if frame.degraded {
            return Err(DeviceError::AcquisitionFailed {
                device: self.name().to_string(),
                attempts: self.max_attempts,
            });
        }
        Ok(frame.mean_ratio())
    }
}

#[async_trait]
impl Camera for DummyCamera {
    fn width(&self) -> usize {
        self.width
    }

    async fn read_n_frames(&self, n: usize, cancel: &CancelToken) -> DeviceResult<SpectrumFrame> {
        let settings = self.chopper();
        acquire_chopped(n, self.width, settings, cancel, |total| {
            self.read_burst(total, settings.phase_flip)
        })
        .await
    }
}

// =============================================================================
// DummySensor
// =============================================================================

/// Scalar input producing uniform noise around an offset.
pub struct DummySensor {
    properties: PropertySet,
    connected: AtomicBool,
}

impl DummySensor {
    /// Connected sensor with zero amplitude, offset and wait.
    pub fn new() -> AppResult<Self> {
        let properties = PropertySet::from_specs(vec![
            PropertySpec::new("Amplitude", PropertyKind::Input, "0.0").info("float"),
            PropertySpec::new("Offset", PropertyKind::Input, "0.0").info("float"),
            PropertySpec::new("Wait Time (s)", PropertyKind::Input, "0").info("float"),
            PropertySpec::new("Function", PropertyKind::Choice, 0)
                .choices(["Rosenbrock", "Parabola", "Ackley"]),
        ])?;
        Ok(Self {
            properties,
            connected: AtomicBool::new(true),
        })
    }

    /// Simulate the device dropping off (or coming back onto) its bus.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    fn float(&self, query: &str) -> DeviceResult<f64> {
        self.properties
            .value(query)
            .ok()
            .and_then(|v| v.as_f64())
            .ok_or_else(|| DeviceError::Rejected(format!("'{query}' is not a number")))
    }
}

#[async_trait]
impl Module for DummySensor {
    fn name(&self) -> &str {
        "Dummy Sensor"
    }

    fn properties(&self) -> &PropertySet {
        &self.properties
    }
}

#[async_trait]
impl Input for DummySensor {
    async fn read(&self) -> DeviceResult<f64> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(DeviceError::NotReady {
                device: self.name().to_string(),
            });
        }
        let wait = wait_time(&self.properties);
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
        let amplitude = self.float("amplitude")?;
        let offset = self.float("offset")?;
        let noise: f64 = rand::thread_rng().gen();
        Ok((noise - 0.5) * amplitude + offset)
    }

    async fn read_at(&self, coordinates: &[f64]) -> DeviceResult<f64> {
        let base = self.read().await?;
        if coordinates.is_empty() {
            return Ok(base);
        }
        let function = self
            .properties
            .value("function")
            .ok()
            .and_then(|v| v.as_index())
            .unwrap_or(0);
        Ok(base + TestFunction::from_index(function).eval(coordinates))
    }
}

/// Landscapes [`DummySensor::read_at`] adds to its reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestFunction {
    /// Rosenbrock valley, minimum 0 at (1, 1, ...)
    Rosenbrock,
    /// Paraboloid, minimum 0 at (1, 1, ...)
    Parabola,
    /// Ackley function over the first two coordinates, minimum 0 at (1, 1)
    Ackley,
}

impl TestFunction {
    /// Function at a "Function" choice index.
    pub fn from_index(index: usize) -> Self {
        match index {
            1 => TestFunction::Parabola,
            2 => TestFunction::Ackley,
            _ => TestFunction::Rosenbrock,
        }
    }

    /// Value at `coordinates`.
    pub fn eval(self, coordinates: &[f64]) -> f64 {
        match self {
            TestFunction::Rosenbrock => coordinates
                .windows(2)
                .map(|w| (1.0 - w[0]).powi(2) + 100.0 * (w[1] - w[0].powi(2)).powi(2))
                .sum(),
            TestFunction::Parabola => coordinates.iter().map(|c| (c - 1.0).powi(2)).sum(),
            TestFunction::Ackley => {
                let dx = coordinates.first().copied().unwrap_or(1.0) - 1.0;
                let dy = coordinates.get(1).copied().unwrap_or(1.0) - 1.0;
                let tau = std::f64::consts::TAU;
                -20.0 * (-0.2 * (0.5 * (dx * dx + dy * dy)).sqrt()).exp()
                    - (0.5 * ((tau * dx).cos() + (tau * dy).cos())).exp()
                    + std::f64::consts::E
                    + 20.0
            }
        }
    }
}

// =============================================================================
// DummyAxis
// =============================================================================

/// Travel speed of [`DummyAxis`] in position units per second.
const FAST_SPEED: f64 = 1_000_000.0;
const SLOW_SPEED: f64 = 10_000.0;

#[derive(Debug, Clone, Copy)]
struct Motion {
    from: f64,
    to: f64,
    started: Instant,
    duration: Duration,
}

impl Motion {
    fn at_rest(position: f64) -> Self {
        Self {
            from: position,
            to: position,
            started: Instant::now(),
            duration: Duration::ZERO,
        }
    }

    fn position(&self) -> f64 {
        if self.duration.is_zero() {
            return self.to;
        }
        let fraction = (self.started.elapsed().as_secs_f64() / self.duration.as_secs_f64()).min(1.0);
        self.from + (self.to - self.from) * fraction
    }

    fn is_moving(&self) -> bool {
        self.started.elapsed() < self.duration
    }
}

/// Delay stage with linear simulated travel.
pub struct DummyAxis {
    properties: PropertySet,
    motion: Mutex<Motion>,
    history: Mutex<Vec<f64>>,
}

impl DummyAxis {
    /// Axis at position 0.
    pub fn new() -> AppResult<Self> {
        let properties = PropertySet::from_specs(vec![
            PropertySpec::new("Axis", PropertyKind::Label, ""),
            PropertySpec::new("Position", PropertyKind::Input, "0").info("float"),
            PropertySpec::new("Speed", PropertyKind::Choice, 0).choices(["fast", "slow"]),
        ])?;
        Ok(Self {
            properties,
            motion: Mutex::new(Motion::at_rest(0.0)),
            history: Mutex::new(Vec::new()),
        })
    }

    /// Every target commanded so far, in order.
    pub fn goto_history(&self) -> Vec<f64> {
        self.history.lock().clone()
    }

    fn speed(&self) -> f64 {
        match self.properties.value("speed").ok().and_then(|v| v.as_index()) {
            Some(1) => SLOW_SPEED,
            _ => FAST_SPEED,
        }
    }
}

#[async_trait]
impl Module for DummyAxis {
    fn name(&self) -> &str {
        "Dummy Axis"
    }

    fn properties(&self) -> &PropertySet {
        &self.properties
    }

    async fn initialize(&self, ctx: &BindingContext<'_>) -> AppResult<()> {
        self.properties
            .set_value("axis", format!("#{}", ctx.peers_before() + 1))?;
        Ok(())
    }
}

#[async_trait]
impl Axis for DummyAxis {
    async fn pos(&self) -> DeviceResult<f64> {
        Ok(self.motion.lock().position())
    }

    async fn goto(&self, target: f64) -> DeviceResult<()> {
        if !target.is_finite() {
            return Err(DeviceError::Rejected(format!("target {target} is not finite")));
        }
        let speed = self.speed();
        {
            let mut motion = self.motion.lock();
            let from = motion.position();
            *motion = Motion {
                from,
                to: target,
                started: Instant::now(),
                duration: Duration::from_secs_f64((target - from).abs() / speed),
            };
        }
        self.history.lock().push(target);
        self.properties
            .set_value("position", target.to_string())
            .map_err(|e| DeviceError::Rejected(e.to_string()))?;
        Ok(())
    }

    async fn is_moving(&self) -> DeviceResult<bool> {
        Ok(self.motion.lock().is_moving())
    }
}

// =============================================================================
// DummyValve
// =============================================================================

/// Setpoint actuator (flow valve, mirror mount) that settles instantly.
pub struct DummyValve {
    properties: PropertySet,
    setpoint: Mutex<f64>,
    history: Mutex<Vec<f64>>,
}

impl DummyValve {
    /// Valve at setpoint 0.
    pub fn new() -> AppResult<Self> {
        let properties = PropertySet::from_specs(vec![
            PropertySpec::new("Valve", PropertyKind::Label, ""),
            PropertySpec::new("Position", PropertyKind::Input, "0").info("float"),
            PropertySpec::new("Speed", PropertyKind::Choice, 0).choices(["fast", "slow"]),
        ])?;
        Ok(Self {
            properties,
            setpoint: Mutex::new(0.0),
            history: Mutex::new(Vec::new()),
        })
    }

    /// Every setpoint commanded so far, in order.
    pub fn goto_history(&self) -> Vec<f64> {
        self.history.lock().clone()
    }
}

#[async_trait]
impl Module for DummyValve {
    fn name(&self) -> &str {
        "Dummy Valve"
    }

    fn properties(&self) -> &PropertySet {
        &self.properties
    }

    async fn initialize(&self, ctx: &BindingContext<'_>) -> AppResult<()> {
        self.properties
            .set_value("valve", format!("#{}", ctx.peers_before() + 1))?;
        Ok(())
    }
}

#[async_trait]
impl Axis for DummyValve {
    async fn pos(&self) -> DeviceResult<f64> {
        Ok(*self.setpoint.lock())
    }

    async fn goto(&self, target: f64) -> DeviceResult<()> {
        if !target.is_finite() {
            return Err(DeviceError::Rejected(format!("setpoint {target} is not finite")));
        }
        *self.setpoint.lock() = target;
        self.history.lock().push(target);
        self.properties
            .set_value("position", target.to_string())
            .map_err(|e| DeviceError::Rejected(e.to_string()))?;
        Ok(())
    }

    async fn is_moving(&self) -> DeviceResult<bool> {
        Ok(false)
    }
}

// =============================================================================
// DummyShutter
// =============================================================================

/// Digital shutter; the line level is the requested state XOR the slope.
pub struct DummyShutter {
    properties: PropertySet,
    open: AtomicBool,
    line: AtomicBool,
    history: Mutex<Vec<bool>>,
}

impl DummyShutter {
    /// Closed shutter, open on high.
    pub fn new() -> AppResult<Self> {
        let properties = PropertySet::from_specs(vec![
            PropertySpec::new("Slope", PropertyKind::Choice, 0)
                .choices(["Open on High", "Open on Low"]),
            PropertySpec::new("Control", PropertyKind::Toggle, false).info("OPEN/CLOSE"),
        ])?;
        Ok(Self {
            properties,
            open: AtomicBool::new(false),
            line: AtomicBool::new(false),
            history: Mutex::new(Vec::new()),
        })
    }

    /// Whether the shutter is open.
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Electrical level currently driven on the line.
    pub fn line_level(&self) -> bool {
        self.line.load(Ordering::SeqCst)
    }

    /// Every state written so far (`true` = open).
    pub fn write_history(&self) -> Vec<bool> {
        self.history.lock().clone()
    }
}

#[async_trait]
impl Module for DummyShutter {
    fn name(&self) -> &str {
        "Dummy Shutter"
    }

    fn properties(&self) -> &PropertySet {
        &self.properties
    }
}

#[async_trait]
impl Output for DummyShutter {
    async fn write(&self, value: OutputValue) -> DeviceResult<()> {
        let open = value.as_bool();
        let open_on_low = self
            .properties
            .value("slope")
            .ok()
            .and_then(|v| v.as_index())
            == Some(1);

        self.open.store(open, Ordering::SeqCst);
        self.line.store(open ^ open_on_low, Ordering::SeqCst);
        self.history.lock().push(open);
        self.properties
            .set_value("control", open)
            .map_err(|e| DeviceError::Rejected(e.to_string()))?;
        Ok(())
    }
}

// =============================================================================
// DummyLockIn
// =============================================================================

/// Model string every [`DummyLockIn`] expects in its identification reply.
pub const LOCK_IN_MODEL: &str = "SR830";

/// First bus address handed out to lock-ins, in load order.
const LOCK_IN_BASE_ADDRESS: usize = 8;

/// Lock-in amplifier answering a configurable identification string.
///
/// `initialize` checks the reply against [`LOCK_IN_MODEL`]; a mismatch leaves
/// the device not-ready. Identical units are told apart by load order.
pub struct DummyLockIn {
    properties: PropertySet,
    identity: String,
    connected: AtomicBool,
}

impl DummyLockIn {
    /// Lock-in replying `identity` to an identification query.
    pub fn new(identity: impl Into<String>) -> AppResult<Self> {
        let properties = PropertySet::from_specs(vec![
            PropertySpec::new("Address", PropertyKind::Label, ""),
            PropertySpec::new("Wait Time (s)", PropertyKind::Input, "0.1").info("float"),
        ])?;
        Ok(Self {
            properties,
            identity: identity.into(),
            connected: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl Module for DummyLockIn {
    fn name(&self) -> &str {
        "Dummy Lock-In"
    }

    fn properties(&self) -> &PropertySet {
        &self.properties
    }

    async fn initialize(&self, ctx: &BindingContext<'_>) -> AppResult<()> {
        self.connected.store(false, Ordering::SeqCst);
        if !self.identity.contains(LOCK_IN_MODEL) {
            return Err(DaqError::Device(DeviceError::IdentificationMismatch {
                expected: LOCK_IN_MODEL.to_string(),
                found: self.identity.clone(),
            }));
        }
        let address = format!("GPIB0::{}::INSTR", LOCK_IN_BASE_ADDRESS + ctx.peers_before());
        info!(label = ctx.label(), %address, "lock-in identified");
        self.properties.set_value("address", address)?;
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn shutdown(&self) -> AppResult<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl Input for DummyLockIn {
    async fn read(&self) -> DeviceResult<f64> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(DeviceError::NotReady {
                device: self.name().to_string(),
            });
        }
        let wait = wait_time(&self.properties);
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
        let jitter: f64 = rand::thread_rng().gen_range(-0.5..0.5);
        Ok(1.0e-3 * (1.0 + 0.01 * jitter))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::registry::ModuleRegistry;
    use crate::modules::ModuleEntry;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_sensor_with_zero_amplitude_reads_offset() {
        let sensor = DummySensor::new().unwrap();
        sensor.properties().set_value("offset", "5").unwrap();
        for _ in 0..10 {
            assert_eq!(sensor.read().await.unwrap(), 5.0);
        }
    }

    #[tokio::test]
    async fn test_disconnected_sensor_is_not_ready() {
        let sensor = DummySensor::new().unwrap();
        sensor.set_connected(false);
        assert!(matches!(
            sensor.read().await,
            Err(DeviceError::NotReady { .. })
        ));
    }

    #[tokio::test]
    async fn test_camera_ratio_shows_pump_signal() {
        let camera = DummyCamera::with_settings(64, ChopperSettings::default()).unwrap();
        let frame = camera.read_n_frames(20, &CancelToken::new()).await.unwrap();
        assert!(!frame.degraded);
        assert_eq!(frame.width(), 64);
        // peak in the middle, flat at the edge
        assert!(frame.ratio[32] > 1.03);
        assert!((frame.ratio[0] - 1.0).abs() < 0.01);
    }

    #[tokio::test]
    async fn test_camera_phase_flip_inverts_ratio() {
        let camera = DummyCamera::with_settings(64, ChopperSettings::default()).unwrap();
        camera.properties().set_value("phase", 1i64).unwrap();
        let frame = camera.read_n_frames(20, &CancelToken::new()).await.unwrap();
        // pump rows follow the flip, so the ratio still shows the signal
        assert!(frame.ratio[32] > 1.03);
    }

    #[tokio::test]
    async fn test_camera_dropped_bursts_are_retried() {
        let camera = DummyCamera::with_settings(16, ChopperSettings::default()).unwrap();
        camera.drop_next_bursts(2);
        let frame = camera.read_n_frames(4, &CancelToken::new()).await.unwrap();
        assert!(!frame.degraded);

        camera.drop_next_bursts(10);
        let frame = camera.read_n_frames(4, &CancelToken::new()).await.unwrap();
        assert!(frame.degraded);
        assert_eq!(frame.ratio, vec![1.0; 16]);
    }

    #[tokio::test]
    async fn test_camera_scalar_read_fails_after_retry_limit() {
        let camera = DummyCamera::with_settings(16, ChopperSettings::default()).unwrap();
        camera.drop_next_bursts(5);
        match camera.read().await {
            Err(DeviceError::AcquisitionFailed { device, attempts }) => {
                assert_eq!(device, "Dummy Camera");
                assert_eq!(attempts, 5);
            }
            other => panic!("expected a failed acquisition, got {other:?}"),
        }

        // the next burst is complete again
        assert!(camera.read().await.is_ok());
    }

    #[tokio::test]
    async fn test_axis_travels_and_settles() {
        let axis = DummyAxis::new().unwrap();
        axis.properties().set_value("speed", 1i64).unwrap();
        axis.goto(100.0).await.unwrap();
        assert!(axis.is_moving().await.unwrap());

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!axis.is_moving().await.unwrap());
        assert_eq!(axis.pos().await.unwrap(), 100.0);
        assert_eq!(axis.goto_history(), vec![100.0]);
        assert_eq!(
            axis.properties().value("position").unwrap().as_f64(),
            Some(100.0)
        );
    }

    #[tokio::test]
    async fn test_valve_settles_at_once() {
        let valve = DummyValve::new().unwrap();
        valve.goto(-3.5).await.unwrap();
        assert!(!valve.is_moving().await.unwrap());
        assert_eq!(valve.pos().await.unwrap(), -3.5);
        assert!(valve.goto(f64::NAN).await.is_err());
        assert_eq!(valve.goto_history(), vec![-3.5]);
    }

    #[tokio::test]
    async fn test_sensor_landscapes_have_minimum_at_one_one() {
        let sensor = DummySensor::new().unwrap();
        sensor.properties().set_value("offset", "2").unwrap();
        for function in 0..3i64 {
            sensor.properties().set_value("function", function).unwrap();
            let at_minimum = sensor.read_at(&[1.0, 1.0]).await.unwrap();
            let away = sensor.read_at(&[-1.0, 2.5]).await.unwrap();
            assert!((at_minimum - 2.0).abs() < 1e-9, "function {function}: {at_minimum}");
            assert!(away > at_minimum + 1.0, "function {function}: {away}");
        }
        // no coordinates: plain reading
        assert_eq!(sensor.read_at(&[]).await.unwrap(), 2.0);
    }

    #[tokio::test]
    async fn test_shutter_slope_inverts_line_level() {
        let shutter = DummyShutter::new().unwrap();
        shutter.write(true.into()).await.unwrap();
        assert!(shutter.is_open());
        assert!(shutter.line_level());

        shutter.properties().set_value("slope", 1i64).unwrap();
        shutter.write(true.into()).await.unwrap();
        assert!(shutter.is_open());
        assert!(!shutter.line_level());

        shutter.write(false.into()).await.unwrap();
        assert!(shutter.line_level());
        assert_eq!(shutter.write_history(), vec![true, true, false]);
    }

    #[tokio::test]
    async fn test_lock_in_identification_and_addresses() {
        let registry = ModuleRegistry::new(vec![
            ModuleEntry::input(Arc::new(DummyLockIn::new("SRS,SR830,s/n1,ver1.07").unwrap())),
            ModuleEntry::input(Arc::new(DummyLockIn::new("SRS,SR830,s/n2,ver1.07").unwrap())),
            ModuleEntry::input(Arc::new(DummyLockIn::new("SRS,SR844,s/n3,ver1.00").unwrap())),
        ]);

        let mut results = Vec::new();
        for (i, module) in registry.iter().enumerate() {
            results.push(module.module().initialize(&registry.binding_context(i)).await);
        }
        assert!(results[0].is_ok());
        assert!(results[1].is_ok());
        assert!(matches!(
            results[2],
            Err(DaqError::Device(DeviceError::IdentificationMismatch { .. }))
        ));

        let address = |i: usize| {
            registry
                .get(i)
                .unwrap()
                .module()
                .properties()
                .value("address")
                .unwrap()
                .as_text()
        };
        assert_eq!(address(0), "GPIB0::8::INSTR");
        assert_eq!(address(1), "GPIB0::9::INSTR");
    }

    #[tokio::test]
    async fn test_uninitialized_lock_in_is_not_ready() {
        let lock_in = DummyLockIn::new("SR830").unwrap();
        assert!(matches!(
            lock_in.read().await,
            Err(DeviceError::NotReady { .. })
        ));
    }
}
