//! Result aggregation and persistence.
//!
//! - [`accumulator`]: incremental mean over sets, optionally keeping every set
//! - [`transform`]: measurement modes and ratio transforms
//! - [`naming`]: historical spectroscopy file names
//! - [`table`]: column tables rendered one row per sample
//! - [`storage`]: the [`storage::ResultSink`] boundary and its implementations
pub mod accumulator;
pub mod naming;
pub mod storage;
pub mod table;
pub mod transform;

pub use accumulator::{Accumulator, FrameAccumulator};
pub use storage::{MemorySink, ResultSink, TsvFileSink};
pub use table::ColumnTable;
pub use transform::MeasurementMode;
