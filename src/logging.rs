//! Tracing subscriber setup.
//!
//! Scans log through `tracing` with `experiment`, `set` and `point` fields.
//! The level and format come from `[application]`; `RUST_LOG` wins over the
//! configured level when set.

use std::str::FromStr;

use tracing::level_filters::LevelFilter;
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

use crate::config::AppConfig;
use crate::error::{AppResult, DaqError};

/// Log line layout; the `log_format` key of `[application]`.
pub use crate::config::LogFormat as OutputFormat;

/// Subscriber options.
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Most verbose level shown unless `RUST_LOG` says otherwise
    pub level: Level,
    /// Line layout
    pub format: OutputFormat,
    /// Log span close events, which carry the duration of every scan run
    pub with_span_events: bool,
    /// Source file and line on every event
    pub with_file_and_line: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: OutputFormat::Pretty,
            with_span_events: false,
            with_file_and_line: true,
        }
    }
}

impl TracingConfig {
    /// Options from `[application]`.
    pub fn from_app_config(config: &AppConfig) -> AppResult<Self> {
        let level = Level::from_str(config.application.log_level.trim()).map_err(|_| {
            DaqError::Configuration(format!(
                "invalid log_level '{}'",
                config.application.log_level
            ))
        })?;
        Ok(Self {
            level,
            format: config.application.log_format,
            ..Self::default()
        })
    }

    /// Defaults at `level`.
    pub fn new(level: Level) -> Self {
        Self {
            level,
            ..Self::default()
        }
    }

    /// Set the line layout.
    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }

    fn filter(&self) -> EnvFilter {
        EnvFilter::builder()
            .with_default_directive(LevelFilter::from_level(self.level).into())
            .from_env_lossy()
    }

    fn layer(&self) -> Box<dyn Layer<Registry> + Send + Sync> {
        let spans = if self.with_span_events {
            FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        };
        let base = fmt::layer()
            .with_span_events(spans)
            .with_file(self.with_file_and_line)
            .with_line_number(self.with_file_and_line);
        match self.format {
            OutputFormat::Pretty => base.pretty().with_filter(self.filter()).boxed(),
            OutputFormat::Compact => base
                .compact()
                .with_ansi(false)
                .with_filter(self.filter())
                .boxed(),
            OutputFormat::Json => base.json().with_filter(self.filter()).boxed(),
        }
    }
}

/// Install the global subscriber described by `[application]`.
pub fn init_from_config(config: &AppConfig) -> AppResult<()> {
    init(TracingConfig::from_app_config(config)?)
}

/// Install the global subscriber.
///
/// A subscriber installed earlier (by a test harness or an embedding
/// application) is kept and this returns `Ok(())`.
pub fn init(config: TracingConfig) -> AppResult<()> {
    if tracing::dispatcher::has_been_set() {
        return Ok(());
    }
    match tracing_subscriber::registry().with(config.layer()).try_init() {
        Ok(()) => Ok(()),
        // lost a race with another initializer
        Err(_) if tracing::dispatcher::has_been_set() => Ok(()),
        Err(e) => Err(DaqError::Configuration(format!(
            "failed to install tracing subscriber: {e}"
        ))),
    }
}
