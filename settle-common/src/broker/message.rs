//! Normalized consumed messages and the filter that accepts them.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rdkafka::message::{Headers, Message};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::duration;
use crate::error::ConfigError;
use crate::path;

/// A delivered message, decoded once and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConsumedMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: String,
    pub value: String,
    pub headers: BTreeMap<String, String>,
    pub timestamp: Option<DateTime<Utc>>,
    /// The value decoded as JSON, when it is valid JSON.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub json: Option<Value>,
}

impl ConsumedMessage {
    pub fn new(
        topic: impl Into<String>,
        partition: i32,
        offset: i64,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        let value = value.into();
        Self {
            topic: topic.into(),
            partition,
            offset,
            key: key.into(),
            json: serde_json::from_str(&value).ok(),
            value,
            headers: BTreeMap::new(),
            timestamp: None,
        }
    }

    #[must_use]
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub(crate) fn from_kafka<M: Message>(message: &M) -> Self {
        let lossy = |bytes: Option<&[u8]>| {
            bytes
                .map(|b| String::from_utf8_lossy(b).into_owned())
                .unwrap_or_default()
        };

        let mut decoded = Self::new(
            message.topic(),
            message.partition(),
            message.offset(),
            lossy(message.key()),
            lossy(message.payload()),
        );

        if let Some(headers) = message.headers() {
            for header in headers.iter() {
                decoded
                    .headers
                    .insert(header.key.to_string(), lossy(header.value));
            }
        }

        decoded.timestamp = message
            .timestamp()
            .to_millis()
            .and_then(DateTime::<Utc>::from_timestamp_millis);
        decoded
    }
}

/// Conjunctive filter over consumed messages. Unset predicates always pass.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MessageFilter {
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub key_pattern: Option<String>,
    #[serde(default, deserialize_with = "duration::string_map")]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub json_path: Option<String>,
    #[serde(default)]
    pub json_value: Option<Value>,
}

impl MessageFilter {
    /// Validate the filter and compile its key pattern.
    pub fn compile(&self) -> Result<MessageMatcher, ConfigError> {
        let key_pattern = match self.key_pattern.as_deref().filter(|p| !p.is_empty()) {
            Some(pattern) => Some(
                Regex::new(pattern).map_err(|err| ConfigError::invalid("filter.key_pattern", err))?,
            ),
            None => None,
        };
        let json_path = self.json_path.clone().filter(|p| !p.is_empty());
        if self.json_value.is_some() && json_path.is_none() {
            return Err(ConfigError::invalid("filter.json_value", "requires json_path"));
        }

        Ok(MessageMatcher {
            key: self.key.clone().filter(|k| !k.is_empty()),
            key_pattern,
            headers: self.headers.clone(),
            json_path,
            json_value: self.json_value.clone(),
        })
    }
}

/// A compiled [`MessageFilter`].
#[derive(Debug, Clone, Default)]
pub struct MessageMatcher {
    key: Option<String>,
    key_pattern: Option<Regex>,
    headers: BTreeMap<String, String>,
    json_path: Option<String>,
    json_value: Option<Value>,
}

impl MessageMatcher {
    /// Accepts every message.
    pub fn any() -> Self {
        Self::default()
    }

    pub fn matches(&self, message: &ConsumedMessage) -> bool {
        if let Some(key) = &self.key {
            if message.key != *key {
                return false;
            }
        }

        if let Some(pattern) = &self.key_pattern {
            if !pattern.is_match(&message.key) {
                return false;
            }
        }

        let headers_match = self
            .headers
            .iter()
            .all(|(name, value)| message.headers.get(name) == Some(value));
        if !headers_match {
            return false;
        }

        match (&self.json_path, &message.json) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some(json_path), Some(body)) => {
                path::matches(body, json_path, self.json_value.as_ref())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn compile(filter: Value) -> MessageMatcher {
        serde_json::from_value::<MessageFilter>(filter)
            .expect("decode filter")
            .compile()
            .expect("compile filter")
    }

    #[test]
    fn test_json_view_is_best_effort() {
        let msg = ConsumedMessage::new("orders", 0, 1, "k", r#"{"id": 7}"#);
        assert_eq!(msg.json, Some(json!({"id": 7})));

        let msg = ConsumedMessage::new("orders", 0, 2, "k", "plain text");
        assert!(msg.json.is_none());
    }

    #[test]
    fn test_key_pattern() {
        let matcher = compile(json!({"key_pattern": "^a"}));
        assert!(matcher.matches(&ConsumedMessage::new("t", 0, 0, "abc", "")));
        assert!(!matcher.matches(&ConsumedMessage::new("t", 0, 1, "xyz", "")));
    }

    #[test]
    fn test_exact_key_and_headers_are_conjunctive() {
        let matcher = compile(json!({
            "key": "order-1",
            "headers": {"type": "created", "version": 2}
        }));

        let good = ConsumedMessage::new("t", 0, 0, "order-1", "{}")
            .with_header("type", "created")
            .with_header("version", "2")
            .with_header("extra", "ignored");
        assert!(matcher.matches(&good));

        let wrong_header = ConsumedMessage::new("t", 0, 1, "order-1", "{}")
            .with_header("type", "deleted")
            .with_header("version", "2");
        assert!(!matcher.matches(&wrong_header));

        let missing_header = ConsumedMessage::new("t", 0, 2, "order-1", "{}").with_header("type", "created");
        assert!(!matcher.matches(&missing_header));

        let wrong_key = good.clone();
        let wrong_key = ConsumedMessage { key: "order-2".into(), ..wrong_key };
        assert!(!matcher.matches(&wrong_key));
    }

    #[test]
    fn test_json_body_predicate() {
        let matcher = compile(json!({"json_path": "order.status", "json_value": "PAID"}));
        assert!(matcher.matches(&ConsumedMessage::new("t", 0, 0, "", r#"{"order":{"status":"PAID"}}"#)));
        assert!(!matcher.matches(&ConsumedMessage::new("t", 0, 1, "", r#"{"order":{"status":"NEW"}}"#)));
        assert!(!matcher.matches(&ConsumedMessage::new("t", 0, 2, "", "PAID")));

        let presence = compile(json!({"json_path": "order.id"}));
        assert!(presence.matches(&ConsumedMessage::new("t", 0, 3, "", r#"{"order":{"id":1}}"#)));
        assert!(!presence.matches(&ConsumedMessage::new("t", 0, 4, "", r#"{"order":{"id":null}}"#)));
    }

    #[test]
    fn test_empty_filter_accepts_everything() {
        let matcher = MessageMatcher::any();
        assert!(matcher.matches(&ConsumedMessage::new("t", 3, 9, "", "not json")));
    }

    #[test]
    fn test_invalid_pattern_is_config_error() {
        let filter = MessageFilter {
            key_pattern: Some("(".into()),
            ..MessageFilter::default()
        };
        assert!(matches!(
            filter.compile(),
            Err(ConfigError::Invalid { field: "filter.key_pattern", .. })
        ));
    }

    #[test]
    fn test_serialized_shape() {
        let msg = ConsumedMessage::new("orders", 1, 5, "k", r#"{"a":1}"#).with_header("h", "v");
        let value = serde_json::to_value(&msg).expect("serialize");
        assert_eq!(value["partition"], json!(1));
        assert_eq!(value["offset"], json!(5));
        assert_eq!(value["headers"], json!({"h": "v"}));
        assert_eq!(value["timestamp"], Value::Null);
        assert_eq!(value["json"], json!({"a": 1}));
    }
}
