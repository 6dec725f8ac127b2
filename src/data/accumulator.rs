//! Incremental averaging of repeated acquisitions.
//!
//! Long unattended runs average thousands of sets, so the mean is updated in
//! place with `mean_n = mean_{n-1} + (x_n - mean_{n-1}) / n` instead of
//! summing and dividing at the end.

use serde::Serialize;

use crate::error::{AppResult, DaqError};
use crate::hardware::SpectrumFrame;

/// Running mean of equally sized samples.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Accumulator {
    mean: Vec<f64>,
    count: usize,
    retain: bool,
    history: Vec<Vec<f64>>,
}

impl Accumulator {
    /// Accumulator keeping only the mean.
    pub fn new() -> Self {
        Self::default()
    }

    /// Accumulator that also keeps every pushed sample.
    pub fn retaining() -> Self {
        Self {
            retain: true,
            ..Self::default()
        }
    }

    /// Fold one sample into the mean.
    ///
    /// The first sample fixes the width; later samples must match it.
    pub fn push(&mut self, sample: &[f64]) -> AppResult<()> {
        if self.count == 0 {
            self.mean = sample.to_vec();
        } else {
            if sample.len() != self.mean.len() {
                return Err(DaqError::invalid(
                    "sample",
                    format!("width {} does not match {}", sample.len(), self.mean.len()),
                ));
            }
            let n = (self.count + 1) as f64;
            for (mean, x) in self.mean.iter_mut().zip(sample) {
                *mean += (x - *mean) / n;
            }
        }
        self.count += 1;
        if self.retain {
            self.history.push(sample.to_vec());
        }
        Ok(())
    }

    /// Fold a single value; the accumulator has width one.
    pub fn push_scalar(&mut self, value: f64) -> AppResult<()> {
        self.push(&[value])
    }

    /// Current mean (empty before the first sample).
    pub fn mean(&self) -> &[f64] {
        &self.mean
    }

    /// Mean of a width-one accumulator.
    pub fn scalar_mean(&self) -> Option<f64> {
        self.mean.first().copied()
    }

    /// Number of samples folded in.
    pub fn count(&self) -> usize {
        self.count
    }

    /// Whether nothing has been pushed yet.
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Every pushed sample, oldest first; empty unless retaining.
    pub fn history(&self) -> &[Vec<f64>] {
        &self.history
    }

    /// Forget everything.
    pub fn reset(&mut self) {
        self.mean.clear();
        self.history.clear();
        self.count = 0;
    }
}

/// Running mean of the three channels of a camera burst.
#[derive(Debug, Clone, Default)]
pub struct FrameAccumulator {
    channels: [Accumulator; 3],
}

impl FrameAccumulator {
    /// Mean only.
    pub fn new() -> Self {
        Self::default()
    }

    /// Also keep every frame.
    pub fn retaining() -> Self {
        Self {
            channels: [
                Accumulator::retaining(),
                Accumulator::retaining(),
                Accumulator::retaining(),
            ],
        }
    }

    /// Fold a frame given as (ratio, A, B) channels.
    pub fn push(&mut self, channels: [&[f64]; 3]) -> AppResult<()> {
        for (acc, channel) in self.channels.iter_mut().zip(channels) {
            acc.push(channel)?;
        }
        Ok(())
    }

    /// Fold a raw frame.
    pub fn push_frame(&mut self, frame: &SpectrumFrame) -> AppResult<()> {
        self.push(frame.channels())
    }

    /// Mean channels in storage order.
    pub fn mean(&self) -> [&[f64]; 3] {
        [
            self.channels[0].mean(),
            self.channels[1].mean(),
            self.channels[2].mean(),
        ]
    }

    /// Frames folded in.
    pub fn count(&self) -> usize {
        self.channels[0].count()
    }

    /// Whether nothing has been pushed yet.
    pub fn is_empty(&self) -> bool {
        self.channels[0].is_empty()
    }

    /// Retained frame `index` as (ratio, A, B).
    pub fn retained(&self, index: usize) -> Option<[&[f64]; 3]> {
        Some([
            self.channels[0].history().get(index)?.as_slice(),
            self.channels[1].history().get(index)?.as_slice(),
            self.channels[2].history().get(index)?.as_slice(),
        ])
    }

    /// Number of retained frames.
    pub fn retained_len(&self) -> usize {
        self.channels[0].history().len()
    }

    /// Forget everything.
    pub fn reset(&mut self) {
        for acc in &mut self.channels {
            acc.reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matches_one_pass_mean() {
        let mut acc = Accumulator::new();
        let n = 100_000;
        let mut sum = 0.0;
        for i in 0..n {
            let x = ((i * 7919) % 1000) as f64 * 0.37 + 1e6;
            sum += x;
            acc.push_scalar(x).unwrap();
        }
        let expected = sum / n as f64;
        let mean = acc.scalar_mean().unwrap();
        assert!((mean - expected).abs() / expected < 1e-9, "{mean} vs {expected}");
        assert_eq!(acc.count(), n);
    }

    #[test]
    fn test_width_mismatch_rejected() {
        let mut acc = Accumulator::new();
        acc.push(&[1.0, 2.0]).unwrap();
        assert!(acc.push(&[1.0]).is_err());
        assert_eq!(acc.count(), 1);
    }

    #[test]
    fn test_retaining_keeps_intermediates() {
        let mut acc = Accumulator::retaining();
        acc.push(&[1.0, 3.0]).unwrap();
        acc.push(&[3.0, 5.0]).unwrap();
        assert_eq!(acc.mean(), &[2.0, 4.0]);
        assert_eq!(acc.history().len(), 2);

        acc.reset();
        assert!(acc.is_empty());
        assert!(acc.history().is_empty());
    }

    #[test]
    fn test_frame_accumulator_averages_channels() {
        let mut acc = FrameAccumulator::retaining();
        acc.push_frame(&SpectrumFrame::new(vec![1.0], vec![10.0], vec![100.0]))
            .unwrap();
        acc.push_frame(&SpectrumFrame::new(vec![3.0], vec![30.0], vec![300.0]))
            .unwrap();

        let [ratio, a, b] = acc.mean();
        assert_eq!(ratio, &[2.0]);
        assert_eq!(a, &[20.0]);
        assert_eq!(b, &[200.0]);
        assert_eq!(acc.retained_len(), 2);
        assert_eq!(acc.retained(1).unwrap()[0], &[3.0]);
    }
}
