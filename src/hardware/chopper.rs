//! Chopped-burst reduction shared by every camera driver.
//!
//! A camera burst alternates pump-on and pump-off frames. Frames at odd
//! positions form channel A and even positions channel B; a 180 degree phase
//! flip swaps the two. The ratio channel is `A / B` with non-finite pixels
//! replaced by zero.

use std::future::Future;
use tracing::{debug, warn};

use crate::error::{DeviceError, DeviceResult};
use crate::hardware::cancel::CancelToken;
use crate::hardware::SpectrumFrame;

/// Acquisition policy for chopped bursts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChopperSettings {
    /// Leading frames discarded while the chopper and detector settle
    pub settle_frames: usize,
    /// Attempts before giving up with a placeholder frame
    pub max_attempts: u32,
    /// Swap channel A and B
    pub phase_flip: bool,
}

impl Default for ChopperSettings {
    fn default() -> Self {
        Self {
            settle_frames: 20,
            max_attempts: 5,
            phase_flip: false,
        }
    }
}

/// Average rows by chopping parity.
///
/// `frames` must contain at least two rows of equal width.
pub fn split_by_parity(frames: &[Vec<f64>], phase_flip: bool) -> SpectrumFrame {
    let width = frames.first().map_or(0, Vec::len);
    let a_start = usize::from(!phase_flip);
    let b_start = usize::from(phase_flip);

    let channel_a = mean_rows(frames.iter().skip(a_start).step_by(2), width);
    let channel_b = mean_rows(frames.iter().skip(b_start).step_by(2), width);
    let ratio = channel_a
        .iter()
        .zip(&channel_b)
        .map(|(a, b)| {
            let r = a / b;
            if r.is_finite() {
                r
            } else {
                0.0
            }
        })
        .collect();

    SpectrumFrame::new(ratio, channel_a, channel_b)
}

fn mean_rows<'a>(rows: impl Iterator<Item = &'a Vec<f64>>, width: usize) -> Vec<f64> {
    let mut sum = vec![0.0; width];
    let mut count = 0usize;
    for row in rows {
        for (acc, x) in sum.iter_mut().zip(row) {
            *acc += x;
        }
        count += 1;
    }
    if count > 0 {
        for acc in &mut sum {
            *acc /= count as f64;
        }
    }
    sum
}

/// Read a burst of `n` usable frames and reduce it.
///
/// `read_burst(total)` is the driver's raw read of `total` frames; it returns
/// `Ok(None)` (or short/ragged data) for an incomplete burst, which is retried
/// up to `settings.max_attempts` times. Cancellation and exhausted retries
/// yield [`SpectrumFrame::placeholder`]. Transport errors propagate.
pub async fn acquire_chopped<F, Fut>(
    n: usize,
    width: usize,
    settings: ChopperSettings,
    cancel: &CancelToken,
    mut read_burst: F,
) -> DeviceResult<SpectrumFrame>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = DeviceResult<Option<Vec<Vec<f64>>>>>,
{
    if n < 2 {
        return Err(DeviceError::Rejected(format!(
            "at least two frames are required for a chopped burst, got {n}"
        )));
    }
    let total = n + settings.settle_frames;

    for attempt in 1..=settings.max_attempts {
        if cancel.is_cancelled() {
            debug!("burst acquisition cancelled before attempt {}", attempt);
            return Ok(SpectrumFrame::placeholder(width));
        }

        match read_burst(total).await? {
            Some(frames)
                if frames.len() >= total && frames.iter().all(|f| f.len() == width) =>
            {
                return Ok(split_by_parity(
                    &frames[settings.settle_frames..total],
                    settings.phase_flip,
                ));
            }
            _ => warn!(
                attempt,
                max_attempts = settings.max_attempts,
                "incomplete camera burst"
            ),
        }
    }

    warn!(
        "no complete burst after {} attempts, returning placeholder frame",
        settings.max_attempts
    );
    Ok(SpectrumFrame::placeholder(width))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn burst(rows: usize, width: usize) -> Vec<Vec<f64>> {
        // even rows 2.0, odd rows 4.0
        (0..rows)
            .map(|i| vec![if i % 2 == 0 { 2.0 } else { 4.0 }; width])
            .collect()
    }

    #[test]
    fn test_parity_split() {
        let frame = split_by_parity(&burst(6, 3), false);
        assert_eq!(frame.channel_a, vec![4.0; 3]);
        assert_eq!(frame.channel_b, vec![2.0; 3]);
        assert_eq!(frame.ratio, vec![2.0; 3]);
        assert!(!frame.degraded);

        let flipped = split_by_parity(&burst(6, 3), true);
        assert_eq!(flipped.channel_a, vec![2.0; 3]);
        assert_eq!(flipped.ratio, vec![0.5; 3]);
    }

    #[test]
    fn test_zero_denominator_maps_to_zero() {
        let frames = vec![vec![0.0, 1.0], vec![1.0, 1.0]];
        let frame = split_by_parity(&frames, false);
        assert_eq!(frame.ratio, vec![0.0, 1.0]);
    }

    #[tokio::test]
    async fn test_settle_frames_are_discarded() {
        let settings = ChopperSettings {
            settle_frames: 3,
            max_attempts: 1,
            phase_flip: false,
        };
        let cancel = CancelToken::new();
        let frame = acquire_chopped(4, 2, settings, &cancel, |total| async move {
            assert_eq!(total, 7);
            // three settle rows of garbage, then a clean burst
            let mut rows = vec![vec![1000.0; 2]; 3];
            rows.extend(burst(4, 2));
            Ok(Some(rows))
        })
        .await
        .unwrap();
        assert_eq!(frame.ratio, vec![2.0; 2]);
    }

    #[tokio::test]
    async fn test_retries_then_placeholder() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();
        let settings = ChopperSettings {
            settle_frames: 0,
            max_attempts: 5,
            phase_flip: false,
        };
        let cancel = CancelToken::new();
        let frame = acquire_chopped(4, 8, settings, &cancel, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok(None) }
        })
        .await
        .unwrap();

        assert_eq!(attempts.load(Ordering::SeqCst), 5);
        assert!(frame.degraded);
        assert_eq!(frame.ratio, vec![1.0; 8]);
    }

    #[tokio::test]
    async fn test_recovers_after_short_burst() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();
        let settings = ChopperSettings {
            settle_frames: 0,
            ..Default::default()
        };
        let cancel = CancelToken::new();
        let frame = acquire_chopped(4, 2, settings, &cancel, move |total| {
            let attempt = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt == 0 {
                    Ok(Some(burst(total - 1, 2)))
                } else {
                    Ok(Some(burst(total, 2)))
                }
            }
        })
        .await
        .unwrap();
        assert!(!frame.degraded);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cancelled_returns_placeholder() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let frame = acquire_chopped(4, 2, ChopperSettings::default(), &cancel, |_| async {
            Ok(Some(Vec::new()))
        })
        .await
        .unwrap();
        assert!(frame.degraded);
    }

    #[tokio::test]
    async fn test_transport_error_propagates() {
        let cancel = CancelToken::new();
        let result = acquire_chopped(4, 2, ChopperSettings::default(), &cancel, |_| async {
            Err(DeviceError::Communication("bus timeout".into()))
        })
        .await;
        assert!(matches!(result, Err(DeviceError::Communication(_))));
    }
}
