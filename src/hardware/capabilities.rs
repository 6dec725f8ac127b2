//! Device Capability Contracts
//!
//! Every concrete driver implements one of four small capability traits on
//! top of [`Module`]:
//!
//! - a lock-in amplifier or DAQ channel implements [`Input`]
//! - a CCD implements [`Camera`] (and therefore [`Input`])
//! - a shutter implements [`Output`]
//! - a delay stage implements [`Axis`]
//!
//! # Design Philosophy
//!
//! Each capability trait:
//! - Is async (uses #[async_trait])
//! - Is thread-safe (requires Send + Sync through `Module`)
//! - Returns [`DeviceResult`] so "not ready" is never mistaken for a reading
//! - Focuses on ONE thing
//!
//! Drivers bound their own blocking calls. Long reads take a [`CancelToken`]
//! so a stop request is observed between frame bursts.
//!
//! # Example
//!
//! ```rust
//! use fsrs_daq::error::DeviceResult;
//! use fsrs_daq::hardware::capabilities::Axis;
//! use fsrs_daq::hardware::mock::DummyAxis;
//! use std::time::Duration;
//!
//! async fn settle(axis: &dyn Axis, target: f64) -> DeviceResult<()> {
//!     axis.goto(target).await?;
//!     while axis.is_moving().await? {
//!         tokio::time::sleep(Duration::from_millis(10)).await;
//!     }
//!     Ok(())
//! }
//!
//! # tokio_test::block_on(async {
//! let axis = DummyAxis::new()?;
//! settle(&axis, 150.0).await?;
//! assert_eq!(axis.pos().await?, 150.0);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # }).unwrap();
//! ```

use async_trait::async_trait;

use crate::error::DeviceResult;
use crate::hardware::cancel::CancelToken;
use crate::hardware::{OutputValue, SpectrumFrame};
use crate::modules::Module;

/// Capability: Scalar Readout
///
/// Devices that return a single value per read (lock-in amplifiers, DAQ
/// channels, power meters).
///
/// # Contract
/// - A device that is not connected returns `DeviceError::NotReady`
/// - Any configured per-read wait time is applied inside `read`
#[async_trait]
pub trait Input: Module {
    /// Read the current value.
    async fn read(&self) -> DeviceResult<f64>;

    /// Read the value belonging to the actuator setpoints `coordinates`.
    ///
    /// Real inputs measure whatever the actuators produced and ignore the
    /// argument; simulated inputs evaluate a test landscape at it.
    async fn read_at(&self, _coordinates: &[f64]) -> DeviceResult<f64> {
        self.read().await
    }
}

/// Capability: Output
///
/// Digital or analog outputs (shutters, valves, analog voltages).
///
/// # Contract
/// - Side effect only; success means the command was issued
#[async_trait]
pub trait Output: Module {
    /// Write a value.
    async fn write(&self, value: OutputValue) -> DeviceResult<()>;
}

/// Capability: Positioning
///
/// Delay stages and other positioners.
///
/// # Contract
/// - `goto` returns as soon as motion is commanded; motion proceeds in the
///   background
/// - after `goto`, `is_moving` eventually returns `false` once the target is
///   reached or motion is aborted
/// - `pos` may be approximate while moving
#[async_trait]
pub trait Axis: Module {
    /// Current position in device units.
    async fn pos(&self) -> DeviceResult<f64>;

    /// Command a move to `target`.
    async fn goto(&self, target: f64) -> DeviceResult<()>;

    /// Whether the axis is still moving.
    async fn is_moving(&self) -> DeviceResult<bool>;
}

/// Capability: Chopped Frame Acquisition
///
/// Cameras read bursts of alternating pump-on / pump-off frames and reduce
/// them to a (ratio, channel A, channel B) triple.
///
/// # Contract
/// - Pairs frames by chopping parity, honoring the device's phase setting
/// - Discards the configured number of leading settle frames
/// - Returns a degraded all-ones frame (flagged) when cancelled or when the
///   bounded retry count is exhausted; transport failures are errors
///
/// See [`crate::hardware::chopper::acquire_chopped`] for the shared policy.
#[async_trait]
pub trait Camera: Input {
    /// Number of pixels per frame.
    fn width(&self) -> usize;

    /// Acquire `n` chopped pairs and reduce them.
    async fn read_n_frames(&self, n: usize, cancel: &CancelToken) -> DeviceResult<SpectrumFrame>;
}
