//! Measurement modes and the ratio transforms they imply.

use serde::Serialize;
use std::fmt;

/// What the ratio channel of a chopped acquisition represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MeasurementMode {
    /// Stimulated Raman gain, `-ln(A)`
    Fsrs,
    /// Transient absorption, `-log10(A)`
    TransientAbsorption,
    /// Differential transmission, untouched
    Transmittance,
    /// Optical Kerr gate, background-subtracted channel average
    Kerr,
}

impl MeasurementMode {
    /// Choice labels in index order.
    pub const CHOICES: [&'static str; 4] = ["FSRS", "TA", "T/T0", "Kerr"];

    /// Mode selected by a choice index; out-of-range indices fall back to
    /// transmittance.
    pub fn from_index(index: usize) -> Self {
        match index {
            0 => MeasurementMode::Fsrs,
            1 => MeasurementMode::TransientAbsorption,
            3 => MeasurementMode::Kerr,
            _ => MeasurementMode::Transmittance,
        }
    }

    /// Whether ground/excited spectra are distinguished by shutter state.
    pub fn is_fsrs(self) -> bool {
        self == MeasurementMode::Fsrs
    }

    /// Transform the ratio channel.
    ///
    /// Kerr needs a background and is handled by [`kerr_signal`]; here it
    /// passes the ratio through like transmittance.
    pub fn transform(self, ratio: &[f64]) -> Vec<f64> {
        match self {
            MeasurementMode::Fsrs => ratio.iter().map(|a| -a.ln()).collect(),
            MeasurementMode::TransientAbsorption => ratio.iter().map(|a| -a.log10()).collect(),
            MeasurementMode::Transmittance | MeasurementMode::Kerr => ratio.to_vec(),
        }
    }
}

impl fmt::Display for MeasurementMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let index = match self {
            MeasurementMode::Fsrs => 0,
            MeasurementMode::TransientAbsorption => 1,
            MeasurementMode::Transmittance => 2,
            MeasurementMode::Kerr => 3,
        };
        f.write_str(Self::CHOICES[index])
    }
}

/// Mean of the two chopping channels.
pub fn channel_average(channel_a: &[f64], channel_b: &[f64]) -> Vec<f64> {
    channel_a
        .iter()
        .zip(channel_b)
        .map(|(a, b)| 0.5 * (a + b))
        .collect()
}

/// Kerr signal: channel average minus the shutter-closed background.
pub fn kerr_signal(channel_a: &[f64], channel_b: &[f64], background: &[f64]) -> Vec<f64> {
    channel_average(channel_a, channel_b)
        .into_iter()
        .zip(background)
        .map(|(s, bg)| s - bg)
        .collect()
}
