//! Logging initialization.
//!
//! All library code logs through `tracing`; binaries call [`init_logging`]
//! once at startup. `SETTLE_LOG` accepts a full `EnvFilter` directive and
//! wins over the configured level.

use std::str::FromStr;

use thiserror::Error;
use tracing_subscriber::filter::ParseError;
use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Output format for log lines on stderr.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pretty" | "text" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(format!("unknown log format '{other}' (expected pretty or json)")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    /// Default level directive, e.g. `info` or `settle_common=debug`.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self::new("info")
    }
}

impl LogConfig {
    pub fn new(level: impl Into<String>) -> Self {
        Self {
            level: level.into(),
            format: LogFormat::Pretty,
        }
    }

    #[must_use]
    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.level = level.into();
        self
    }

    #[must_use]
    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    fn filter(&self) -> Result<EnvFilter, LoggingError> {
        match EnvFilter::try_from_env("SETTLE_LOG") {
            Ok(filter) => Ok(filter),
            Err(_) => Ok(EnvFilter::try_new(&self.level)?),
        }
    }
}

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("invalid log filter: {0}")]
    Filter(#[from] ParseError),

    #[error("failed to install log subscriber: {0}")]
    Install(#[from] TryInitError),
}

/// Install the global subscriber writing to stderr.
pub fn init_logging(config: &LogConfig) -> Result<(), LoggingError> {
    let filter = config.filter()?;

    let json_layer = (config.format == LogFormat::Json).then(|| {
        fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_current_span(true)
            .with_target(true)
    });

    let pretty_layer = (config.format == LogFormat::Pretty).then(|| {
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(true)
            .compact()
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(json_layer)
        .with(pretty_layer)
        .try_init()?;

    Ok(())
}
