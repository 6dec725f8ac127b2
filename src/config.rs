//! Configuration System using Figment
//!
//! Configuration is loaded from:
//! 1. `config/fsrs_daq.toml` (base configuration)
//! 2. Environment variables prefixed with `FSRS_DAQ_`, nested keys separated
//!    by `__` (for example `FSRS_DAQ_TIMING__POLL_INTERVAL_MS=5`)
//!
//! Every field has a default, so a missing file yields a runnable
//! configuration with the simulated device set.
//!
//! # Example
//! ```no_run
//! use fsrs_daq::config::AppConfig;
//!
//! let config = AppConfig::load()?;
//! config.validate().map_err(fsrs_daq::error::DaqError::Configuration)?;
//! println!("Application: {}", config.application.name);
//! # Ok::<(), fsrs_daq::error::DaqError>(())
//! ```

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::AppResult;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/fsrs_daq.toml";

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Scan pacing and acquisition policy
    pub timing: TimingConfig,
    /// Delay stage travel heuristic
    pub stage: StageConfig,
    /// Output settings
    pub storage: StorageConfig,
    /// Modules to instantiate
    pub modules: Vec<ModuleDefinition>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            application: ApplicationConfig::default(),
            timing: TimingConfig::default(),
            stage: StageConfig::default(),
            storage: StorageConfig::default(),
            modules: default_modules(),
        }
    }
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log output format
    pub log_format: LogFormat,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "fsrs_daq".to_string(),
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
        }
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable, colored
    Pretty,
    /// Single line per event
    Compact,
    /// Structured JSON
    Json,
}

/// Scan pacing and acquisition policy
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TimingConfig {
    /// Interval between `is_moving` polls
    pub poll_interval_ms: u64,
    /// Display refresh interval for continuous acquisition
    pub ui_refresh_ms: u64,
    /// Attempts per camera burst before a placeholder frame is returned
    pub frame_retry_limit: u32,
    /// Leading camera frames discarded per burst
    pub settle_frames: usize,
    /// Delay between spawning a scan and its first device command
    pub pre_scan_delay_ms: u64,
    /// Delay after each acquired point
    pub inter_point_delay_ms: u64,
    /// Capacity of the worker to controller event channel
    pub event_channel_capacity: usize,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 10,
            ui_refresh_ms: 200,
            frame_retry_limit: 5,
            settle_frames: 20,
            pre_scan_delay_ms: 500,
            inter_point_delay_ms: 200,
            event_channel_capacity: 256,
        }
    }
}

impl TimingConfig {
    /// Axis poll interval.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Display refresh interval.
    pub fn ui_refresh(&self) -> Duration {
        Duration::from_millis(self.ui_refresh_ms)
    }

    /// Pre-scan delay.
    pub fn pre_scan_delay(&self) -> Duration {
        Duration::from_millis(self.pre_scan_delay_ms)
    }

    /// Inter-point delay.
    pub fn inter_point_delay(&self) -> Duration {
        Duration::from_millis(self.inter_point_delay_ms)
    }

    /// Timing with every deliberate delay removed, for simulations and tests.
    pub fn immediate() -> Self {
        Self {
            poll_interval_ms: 1,
            ui_refresh_ms: 1,
            pre_scan_delay_ms: 0,
            inter_point_delay_ms: 0,
            ..Self::default()
        }
    }
}

/// Delay stage travel heuristic
///
/// Travel time over `distance` is estimated as
/// `distance / max_range * max_travel_time_s + fixed_settle_s`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StageConfig {
    /// Full stage range in position units (fs)
    pub max_range: f64,
    /// Time to traverse the full range
    pub max_travel_time_s: f64,
    /// Constant settle time added to every move
    pub fixed_settle_s: f64,
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            max_range: 1_670_000.0,
            max_travel_time_s: 30.0,
            fixed_settle_s: 0.1,
        }
    }
}

impl StageConfig {
    /// Estimated travel time over `distance`.
    pub fn travel_estimate(&self, distance: f64) -> Duration {
        let seconds = distance.abs() / self.max_range * self.max_travel_time_s + self.fixed_settle_s;
        if seconds.is_finite() && seconds > 0.0 {
            Duration::from_secs_f64(seconds)
        } else {
            Duration::ZERO
        }
    }
}

/// Output settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StorageConfig {
    /// Default directory for experiment output
    pub output_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("data"),
        }
    }
}

/// Module category; devices are always bound before experiments.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ModuleCategory {
    /// Hardware driver
    Device,
    /// Scan orchestration
    Experiment,
}

/// Module definition in configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModuleDefinition {
    /// Category
    pub category: ModuleCategory,
    /// Catalog type name (e.g. "dummy_camera", "fsrs_scan")
    pub r#type: String,
    /// Instance count, overriding the driver's own multiplicity
    #[serde(default)]
    pub count: Option<usize>,
    /// Whether this module is loaded
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Driver-specific settings
    #[serde(default = "empty_settings")]
    pub settings: toml::Value,
}

impl ModuleDefinition {
    /// Definition with default settings.
    pub fn new(category: ModuleCategory, module_type: &str) -> Self {
        Self {
            category,
            r#type: module_type.to_string(),
            count: None,
            enabled: true,
            settings: empty_settings(),
        }
    }

    /// Settings handed to the catalog; an explicit `count` is merged in.
    pub fn effective_settings(&self) -> toml::Value {
        let mut settings = match &self.settings {
            toml::Value::Table(table) => table.clone(),
            _ => toml::map::Map::new(),
        };
        if let Some(count) = self.count {
            settings.insert(
                "count".to_string(),
                toml::Value::Integer(i64::try_from(count).unwrap_or(i64::MAX)),
            );
        }
        toml::Value::Table(settings)
    }
}

fn default_enabled() -> bool {
    true
}

fn empty_settings() -> toml::Value {
    toml::Value::Table(toml::map::Map::new())
}

fn default_modules() -> Vec<ModuleDefinition> {
    let devices = ["dummy_camera", "dummy_sensor", "dummy_axis", "dummy_shutter"];
    let experiments = ["fsrs_scan", "fsrs_acquire", "xc_scan", "daq_scan", "daq_monitor"];
    devices
        .iter()
        .map(|t| ModuleDefinition::new(ModuleCategory::Device, t))
        .chain(
            experiments
                .iter()
                .map(|t| ModuleDefinition::new(ModuleCategory::Experiment, t)),
        )
        .collect()
}

impl AppConfig {
    /// Load configuration from the default file and environment variables.
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path.
    ///
    /// A missing file is not an error; environment variables still apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        Ok(Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("FSRS_DAQ_").split("__"))
            .extract()?)
    }

    /// Validate configuration after loading.
    pub fn validate(&self) -> Result<(), String> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            ));
        }

        if self.timing.poll_interval_ms == 0 {
            return Err("timing.poll_interval_ms must be greater than 0".to_string());
        }
        if self.timing.frame_retry_limit == 0 {
            return Err("timing.frame_retry_limit must be at least 1".to_string());
        }
        if self.timing.event_channel_capacity == 0 {
            return Err("timing.event_channel_capacity must be greater than 0".to_string());
        }

        if !(self.stage.max_range.is_finite() && self.stage.max_range > 0.0) {
            return Err(format!(
                "Invalid stage.max_range {}. Must be positive",
                self.stage.max_range
            ));
        }
        if self.stage.max_travel_time_s < 0.0 || self.stage.fixed_settle_s < 0.0 {
            return Err("stage travel times must not be negative".to_string());
        }

        if let Some(module) = self.modules.iter().find(|m| m.r#type.trim().is_empty()) {
            return Err(format!("Module definition with empty type: {:?}", module));
        }

        Ok(())
    }

    /// Enabled module definitions, devices first, file order within a category.
    pub fn enabled_modules(&self) -> Vec<&ModuleDefinition> {
        let enabled = self.modules.iter().filter(|m| m.enabled);
        enabled
            .clone()
            .filter(|m| m.category == ModuleCategory::Device)
            .chain(enabled.filter(|m| m.category == ModuleCategory::Experiment))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    #[test]
    fn test_defaults_validate() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.timing.poll_interval(), Duration::from_millis(10));
        assert_eq!(config.stage.max_range, 1_670_000.0);
        assert!(!config.modules.is_empty());
    }

    #[test]
    #[serial]
    fn test_load_from_file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        write!(
            file,
            r#"
[application]
log_level = "debug"

[timing]
poll_interval_ms = 5

[[modules]]
category = "experiment"
type = "daq_scan"

[[modules]]
category = "device"
type = "dummy_lock_in"
count = 2
settings = {{ identity = "SRS,SR830" }}
"#
        )
        .unwrap();

        let config = AppConfig::load_from(file.path()).unwrap();
        assert_eq!(config.application.log_level, "debug");
        assert_eq!(config.timing.poll_interval_ms, 5);
        // untouched fields keep their defaults
        assert_eq!(config.timing.settle_frames, 20);
        assert_eq!(config.modules.len(), 2);

        let order: Vec<_> = config.enabled_modules().iter().map(|m| m.r#type.clone()).collect();
        assert_eq!(order, vec!["dummy_lock_in", "daq_scan"]);

        let settings = config.modules[1].effective_settings();
        assert_eq!(settings.get("count").and_then(toml::Value::as_integer), Some(2));
        assert_eq!(
            settings.get("identity").and_then(toml::Value::as_str),
            Some("SRS,SR830")
        );
    }

    #[test]
    #[serial]
    fn test_missing_file_uses_defaults() {
        let config = AppConfig::load_from("/nonexistent/fsrs_daq.toml").unwrap();
        assert_eq!(config.application.name, "fsrs_daq");
    }

    #[test]
    #[serial]
    fn test_environment_overrides_file() {
        std::env::set_var("FSRS_DAQ_TIMING__POLL_INTERVAL_MS", "7");
        std::env::set_var("FSRS_DAQ_STORAGE__OUTPUT_DIR", "/tmp/fsrs_runs");
        let config = AppConfig::load_from("/nonexistent/fsrs_daq.toml");
        std::env::remove_var("FSRS_DAQ_TIMING__POLL_INTERVAL_MS");
        std::env::remove_var("FSRS_DAQ_STORAGE__OUTPUT_DIR");

        let config = config.unwrap();
        assert_eq!(config.timing.poll_interval_ms, 7);
        assert_eq!(config.storage.output_dir, PathBuf::from("/tmp/fsrs_runs"));
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = AppConfig::default();
        config.application.log_level = "verbose".into();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.timing.poll_interval_ms = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.stage.max_range = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_travel_estimate() {
        let stage = StageConfig::default();
        assert_eq!(stage.travel_estimate(0.0), Duration::from_secs_f64(0.1));
        let full = stage.travel_estimate(1_670_000.0);
        assert!((full.as_secs_f64() - 30.1).abs() < 1e-9);
        // direction does not matter
        assert_eq!(stage.travel_estimate(-3000.0), stage.travel_estimate(3000.0));
    }
}
