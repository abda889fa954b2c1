//! Serde helpers for configuration fields.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serializer};
use serde_json::Value;

use crate::path::stringify;

/// Parse a duration string such as `30s`, `5m`, `1m30s` or `250ms`.
pub fn parse(value: &str) -> Result<Duration, humantime::DurationError> {
    humantime::parse_duration(value.trim())
}

/// `Option<Duration>` as an optional duration string.
pub mod option {
    use super::*;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw: Option<String> = Option::deserialize(deserializer)?;
        match raw {
            None => Ok(None),
            Some(s) if s.trim().is_empty() => Ok(None),
            Some(s) => parse(&s)
                .map(Some)
                .map_err(|err| de::Error::custom(InvalidDuration { value: s, err })),
        }
    }

    pub fn serialize<S>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(d) => serializer.serialize_str(&humantime::format_duration(*d).to_string()),
            None => serializer.serialize_none(),
        }
    }
}

struct InvalidDuration {
    value: String,
    err: humantime::DurationError,
}

impl fmt::Display for InvalidDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid duration '{}': {}", self.value, self.err)
    }
}

/// A string-keyed map whose values may be any scalar; non-string values are
/// rendered with [`stringify`] so `X-Retry: 3` in YAML becomes `"3"`.
pub fn string_map<'de, D>(deserializer: D) -> Result<BTreeMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<BTreeMap<String, Value>> = Option::deserialize(deserializer)?;
    Ok(raw
        .unwrap_or_default()
        .into_iter()
        .map(|(k, v)| {
            let rendered = stringify(&v).into_owned();
            (k, rendered)
        })
        .collect())
}
