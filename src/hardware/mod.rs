//! Hardware layer: capability traits, the module registry and simulated devices.
//!
//! - [`capabilities`]: `Input`, `Output`, `Axis`, `Camera`
//! - [`cancel`]: cooperative cancellation token
//! - [`chopper`]: parity split and bounded-retry burst acquisition shared by cameras
//! - [`registry`]: authoritative module list, binding context and device leases
//! - [`mock`]: dummy devices for running without hardware

pub mod cancel;
pub mod capabilities;
pub mod chopper;
pub mod mock;
pub mod registry;

use serde::Serialize;

/// Reduced camera burst: ratio plus the two chopping channels.
///
/// `degraded` marks a placeholder produced when acquisition was cancelled or
/// ran out of retries; such frames are all ones and must not be mistaken for
/// data.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpectrumFrame {
    /// A / B per pixel
    pub ratio: Vec<f64>,
    /// Mean of the pump-on frames
    pub channel_a: Vec<f64>,
    /// Mean of the pump-off frames
    pub channel_b: Vec<f64>,
    /// Placeholder flag
    pub degraded: bool,
}

impl SpectrumFrame {
    /// Genuine frame from its three channels.
    pub fn new(ratio: Vec<f64>, channel_a: Vec<f64>, channel_b: Vec<f64>) -> Self {
        Self {
            ratio,
            channel_a,
            channel_b,
            degraded: false,
        }
    }

    /// Flagged all-ones frame of the given width.
    pub fn placeholder(width: usize) -> Self {
        Self {
            ratio: vec![1.0; width],
            channel_a: vec![1.0; width],
            channel_b: vec![1.0; width],
            degraded: true,
        }
    }

    /// Pixel count.
    pub fn width(&self) -> usize {
        self.ratio.len()
    }

    /// Mean of the ratio channel, 0 for an empty frame.
    pub fn mean_ratio(&self) -> f64 {
        if self.ratio.is_empty() {
            return 0.0;
        }
        self.ratio.iter().sum::<f64>() / self.ratio.len() as f64
    }

    /// Channels in storage order: ratio, A, B.
    pub fn channels(&self) -> [&[f64]; 3] {
        [&self.ratio, &self.channel_a, &self.channel_b]
    }
}

/// Value written to an [`capabilities::Output`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub enum OutputValue {
    /// Logic level
    Digital(bool),
    /// Voltage or setpoint
    Analog(f64),
}

impl OutputValue {
    /// Logic interpretation; analog values above zero are high.
    pub fn as_bool(&self) -> bool {
        match self {
            OutputValue::Digital(b) => *b,
            OutputValue::Analog(v) => *v > 0.0,
        }
    }
}

impl From<bool> for OutputValue {
    fn from(value: bool) -> Self {
        OutputValue::Digital(value)
    }
}
