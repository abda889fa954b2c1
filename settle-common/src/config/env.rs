//! Environment variable parsing with type safety.
//!
//! Collects errors while parsing so every bad variable is reported at once
//! rather than failing on the first.

use std::env;
use std::time::Duration;

use thiserror::Error;

/// Errors that can occur during environment variable parsing.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnvError {
    /// Invalid value for a variable.
    #[error("Invalid value for {var}: expected {expected}, got '{value}'")]
    InvalidValue {
        var: String,
        expected: String,
        value: String,
    },

    /// Invalid duration format.
    #[error("Invalid duration for {var}: {value}")]
    InvalidDuration { var: String, value: String },

    /// Invalid log level.
    #[error("Invalid log level for {var}: {value}")]
    InvalidLogLevel { var: String, value: String },
}

type Lookup = Box<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Type-safe environment variable parser for `SETTLE_*` variables.
pub struct EnvParser {
    prefix: &'static str,
    lookup: Lookup,
    errors: Vec<EnvError>,
}

impl EnvParser {
    /// Create a parser reading the process environment.
    pub fn new() -> Self {
        Self::with_lookup(|name| env::var(name).ok())
    }

    /// Create a parser reading variables from `lookup` instead of the
    /// process environment.
    pub fn with_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        Self {
            prefix: "SETTLE_",
            lookup: Box::new(lookup),
            errors: Vec::new(),
        }
    }

    pub fn errors(&self) -> &[EnvError] {
        &self.errors
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn take_errors(&mut self) -> Vec<EnvError> {
        std::mem::take(&mut self.errors)
    }

    fn var_name(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name)
    }

    fn read(&self, var_name: &str) -> Option<String> {
        (self.lookup)(var_name).filter(|v| !v.trim().is_empty())
    }

    /// Get a string value with default.
    pub fn get_string(&mut self, name: &str, default: &str) -> String {
        let var_name = self.var_name(name);
        self.read(&var_name)
            .unwrap_or_else(|| default.to_string())
    }

    /// Get a duration value (`10s`, `500ms`, `1m`) with default.
    pub fn get_duration(&mut self, name: &str, default: Duration) -> Duration {
        let var_name = self.var_name(name);
        match self.read(&var_name) {
            Some(value) => match super::duration::parse(&value) {
                Ok(d) if !d.is_zero() => d,
                _ => {
                    self.errors.push(EnvError::InvalidDuration {
                        var: var_name,
                        value,
                    });
                    default
                }
            },
            None => default,
        }
    }

    /// Get a log level value with validation.
    pub fn get_log_level(&mut self, name: &str, default: &str) -> String {
        let var_name = self.var_name(name);
        match self.read(&var_name) {
            Some(value) => {
                let lower = value.trim().to_lowercase();
                match lower.as_str() {
                    "trace" | "debug" | "info" | "warn" | "error" | "off" => lower,
                    _ => {
                        self.errors.push(EnvError::InvalidLogLevel {
                            var: var_name,
                            value,
                        });
                        default.to_string()
                    }
                }
            }
            None => default.to_string(),
        }
    }

    /// Get a value restricted to `choices` (case-insensitive).
    pub fn get_choice(&mut self, name: &str, default: &str, choices: &[&str]) -> String {
        let var_name = self.var_name(name);
        match self.read(&var_name) {
            Some(value) => {
                let lower = value.trim().to_lowercase();
                if choices.contains(&lower.as_str()) {
                    lower
                } else {
                    self.errors.push(EnvError::InvalidValue {
                        var: var_name,
                        expected: format!("one of {}", choices.join("/")),
                        value,
                    });
                    default.to_string()
                }
            }
            None => default.to_string(),
        }
    }
}

impl Default for EnvParser {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn parser(vars: &[(&str, &str)]) -> EnvParser {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        EnvParser::with_lookup(move |name| vars.get(name).cloned())
    }

    #[test]
    fn test_get_string_default_and_override() {
        let mut p = parser(&[("SETTLE_GROUP_PREFIX", "ci")]);
        assert_eq!(p.get_string("GROUP_PREFIX", "settle"), "ci");
        assert_eq!(p.get_string("MISSING", "fallback"), "fallback");
        assert!(!p.has_errors());
    }

    #[test]
    fn test_empty_value_uses_default() {
        let mut p = parser(&[("SETTLE_GROUP_PREFIX", "  ")]);
        assert_eq!(p.get_string("GROUP_PREFIX", "settle"), "settle");
    }

    #[test]
    fn test_get_duration_valid() {
        let mut p = parser(&[("SETTLE_HTTP_REQUEST_TIMEOUT", "3s")]);
        assert_eq!(
            p.get_duration("HTTP_REQUEST_TIMEOUT", Duration::from_secs(10)),
            Duration::from_secs(3)
        );
        assert!(!p.has_errors());
    }

    #[test]
    fn test_get_duration_invalid_records_error() {
        let mut p = parser(&[("SETTLE_HTTP_REQUEST_TIMEOUT", "fast"), ("SETTLE_TCP_CONNECT_TIMEOUT", "0s")]);
        let d = p.get_duration("HTTP_REQUEST_TIMEOUT", Duration::from_secs(10));
        assert_eq!(d, Duration::from_secs(10));
        let d = p.get_duration("TCP_CONNECT_TIMEOUT", Duration::from_secs(5));
        assert_eq!(d, Duration::from_secs(5));

        let errors = p.take_errors();
        assert_eq!(errors.len(), 2);
        assert!(matches!(&errors[0], EnvError::InvalidDuration { var, .. } if var == "SETTLE_HTTP_REQUEST_TIMEOUT"));
        assert!(!p.has_errors());
    }

    #[test]
    fn test_get_log_level() {
        let mut p = parser(&[("SETTLE_LOG_LEVEL", "DEBUG")]);
        assert_eq!(p.get_log_level("LOG_LEVEL", "info"), "debug");

        let mut p = parser(&[("SETTLE_LOG_LEVEL", "chatty")]);
        assert_eq!(p.get_log_level("LOG_LEVEL", "info"), "info");
        assert_eq!(p.errors().len(), 1);
    }

    #[test]
    fn test_get_choice() {
        let mut p = parser(&[("SETTLE_LOG_FORMAT", "JSON")]);
        assert_eq!(p.get_choice("LOG_FORMAT", "pretty", &["pretty", "json"]), "json");

        let mut p = parser(&[("SETTLE_LOG_FORMAT", "xml")]);
        assert_eq!(p.get_choice("LOG_FORMAT", "pretty", &["pretty", "json"]), "pretty");
        let msg = p.errors()[0].to_string();
        assert!(msg.contains("one of pretty/json"));
    }
}
