//! # FSRS DAQ Core Library
//!
//! Orchestration engine for pump-probe spectroscopy: delay stages, shutters,
//! cameras and scalar inputs are loaded as modules, bound to experiments and
//! driven through scans (move, settle, acquire, toggle shutter, average,
//! persist) under cooperative cancellation.
//!
//! ## Crate Structure
//!
//! - **`alert`**: instability alerts and their delivery boundary.
//! - **`config`**: figment-based configuration (`config/fsrs_daq.toml` plus
//!   `FSRS_DAQ_` environment variables).
//! - **`data`**: running means, column tables, measurement transforms, file
//!   naming and the [`data::ResultSink`] persistence boundary.
//! - **`error`**: the `DaqError` and `DeviceError` enums.
//! - **`experiment`**: the scan state machine, runner, controller and the
//!   built-in experiments.
//! - **`hardware`**: capability traits, cancellation, chopped acquisition,
//!   the module registry and simulated devices.
//! - **`logging`**: tracing subscriber setup.
//! - **`modules`**: the `Module` trait, capability tags and the module catalog.
//! - **`property`**: typed, observable configuration cells.
//!
//! ## Example
//!
//! ```no_run
//! use fsrs_daq::config::AppConfig;
//! use fsrs_daq::experiment::Controller;
//!
//! # async fn demo() -> fsrs_daq::error::AppResult<()> {
//! let mut controller = Controller::from_config(AppConfig::load()?).await?;
//! controller.set_property("daq scan", "till", "50")?;
//! controller.start("daq scan")?;
//! let summary = controller.wait_finished("daq scan").await?;
//! println!("{:?}", summary.outcome);
//! # Ok(())
//! # }
//! ```

pub mod alert;
pub mod config;
pub mod data;
pub mod error;
pub mod experiment;
pub mod hardware;
pub mod logging;
pub mod modules;
pub mod property;
