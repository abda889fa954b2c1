//! Runtime settings and configuration helpers.
//!
//! Per-checker configuration arrives as a generic map and is decoded into
//! strict structs by each checker. This module holds what is shared: the
//! `SETTLE_*` environment settings and serde helpers for durations and
//! string maps.

pub mod duration;
pub mod env;

use std::fmt;
use std::time::Duration;

pub use env::{EnvError, EnvParser};

use crate::logging::{LogConfig, LogFormat};

/// Default per-request timeout for HTTP probes.
pub const DEFAULT_HTTP_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Default connect timeout for TCP probes.
pub const DEFAULT_TCP_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default prefix for generated consumer group ids.
pub const DEFAULT_GROUP_PREFIX: &str = "settle";

/// Process-wide knobs that are not part of any single checker config.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Per-request timeout for HTTP probes.
    pub http_request_timeout: Duration,
    /// Connect timeout for TCP probes.
    pub tcp_connect_timeout: Duration,
    /// Prefix for generated consumer group ids.
    pub group_prefix: String,
    /// Logging configuration.
    pub log: LogConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            http_request_timeout: DEFAULT_HTTP_REQUEST_TIMEOUT,
            tcp_connect_timeout: DEFAULT_TCP_CONNECT_TIMEOUT,
            group_prefix: DEFAULT_GROUP_PREFIX.to_string(),
            log: LogConfig::default(),
        }
    }
}

impl Settings {
    /// Load settings from the process environment.
    pub fn from_env() -> Result<Self, SettingsError> {
        let mut parser = EnvParser::new();
        let settings = Self::from_parser(&mut parser);
        if parser.has_errors() {
            return Err(SettingsError(parser.take_errors()));
        }
        Ok(settings)
    }

    /// Read settings through `parser`, leaving any errors in it.
    pub fn from_parser(parser: &mut EnvParser) -> Self {
        let level = parser.get_log_level("LOG_LEVEL", "info");
        let format = match parser.get_choice("LOG_FORMAT", "pretty", &["pretty", "json"]).as_str() {
            "json" => LogFormat::Json,
            _ => LogFormat::Pretty,
        };

        Self {
            http_request_timeout: parser
                .get_duration("HTTP_REQUEST_TIMEOUT", DEFAULT_HTTP_REQUEST_TIMEOUT),
            tcp_connect_timeout: parser
                .get_duration("TCP_CONNECT_TIMEOUT", DEFAULT_TCP_CONNECT_TIMEOUT),
            group_prefix: parser.get_string("GROUP_PREFIX", DEFAULT_GROUP_PREFIX),
            log: LogConfig::new(level).with_format(format),
        }
    }
}

/// All environment errors found while loading [`Settings`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettingsError(pub Vec<EnvError>);

impl fmt::Display for SettingsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid environment configuration")?;
        for err in &self.0 {
            write!(f, "\n  - {err}")?;
        }
        Ok(())
    }
}

impl std::error::Error for SettingsError {}
