//! Acknowledged single-message publish.

use std::collections::BTreeMap;
use std::time::Duration;

use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::{Connection, SaslConfig, TlsConfig, deserialize_brokers};
use crate::config::duration;
use crate::error::{CheckError, ConfigError};

/// Default time to wait for the broker to confirm a send.
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(30);

/// Configuration for a `kafka_producer` step.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KafkaProducerConfig {
    #[serde(default, deserialize_with = "deserialize_brokers")]
    pub brokers: Vec<String>,
    #[serde(default)]
    pub topic: String,
    #[serde(default)]
    pub key: Option<String>,
    /// Strings are sent as-is; anything else is JSON-encoded.
    #[serde(default)]
    pub payload: Value,
    #[serde(default, deserialize_with = "duration::string_map")]
    pub headers: BTreeMap<String, String>,
    #[serde(default, with = "duration::option")]
    pub timeout: Option<Duration>,
    #[serde(default)]
    pub sasl: Option<SaslConfig>,
    #[serde(default)]
    pub tls: Option<TlsConfig>,
}

impl KafkaProducerConfig {
    pub fn from_value(value: &Value) -> Result<Self, ConfigError> {
        Ok(Self::deserialize(value)?)
    }

    fn connection(&self) -> Connection<'_> {
        Connection {
            brokers: &self.brokers,
            sasl: self.sasl.as_ref(),
            tls: self.tls.as_ref(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PublishResult {
    pub success: bool,
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    /// Empty when the message had no key.
    pub key: String,
    pub duration_ms: u64,
}

/// A validated publish.
#[derive(Debug)]
pub struct KafkaProducer {
    config: KafkaProducerConfig,
    payload: Vec<u8>,
    timeout: Duration,
}

impl KafkaProducer {
    pub fn new(config: KafkaProducerConfig) -> Result<Self, CheckError> {
        config.connection().validate()?;
        if config.topic.trim().is_empty() {
            return Err(ConfigError::Missing { field: "topic" }.into());
        }
        let payload = encode_payload(&config.payload)?;
        let timeout = config
            .timeout
            .filter(|t| !t.is_zero())
            .unwrap_or(DEFAULT_SEND_TIMEOUT);
        Ok(Self {
            config,
            payload,
            timeout,
        })
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Send one message and wait for the broker to confirm it.
    ///
    /// Failures are not retried here.
    pub async fn publish(&self, cancel: &CancellationToken) -> Result<PublishResult, CheckError> {
        let started = Instant::now();
        let timeout_ms = u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX);

        let producer: FutureProducer = self
            .config
            .connection()
            .client_config()
            .set("acks", "all")
            .set("message.timeout.ms", timeout_ms.to_string())
            .create()
            .map_err(|err| CheckError::setup("create producer", err))?;

        let headers = self
            .config
            .headers
            .iter()
            .fold(OwnedHeaders::new(), |headers, (key, value)| {
                headers.insert(Header {
                    key: key.as_str(),
                    value: Some(value.as_bytes()),
                })
            });

        let mut record = FutureRecord::<str, [u8]>::to(&self.config.topic)
            .payload(self.payload.as_slice())
            .headers(headers);
        if let Some(key) = self.config.key.as_deref() {
            record = record.key(key);
        }

        let delivery = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(CheckError::Cancelled),
            delivery = producer.send(record, self.timeout) => delivery,
        };
        let (partition, offset) =
            delivery.map_err(|(err, _)| CheckError::backend("failed to send message", err))?;

        let result = PublishResult {
            success: true,
            topic: self.config.topic.clone(),
            partition,
            offset,
            key: self.config.key.clone().unwrap_or_default(),
            duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        };
        info!(
            topic = %result.topic,
            partition = result.partition,
            offset = result.offset,
            key = %result.key,
            duration_ms = result.duration_ms,
            "Message published"
        );
        Ok(result)
    }
}

fn encode_payload(payload: &Value) -> Result<Vec<u8>, CheckError> {
    match payload {
        Value::String(s) => Ok(s.clone().into_bytes()),
        other => Ok(serde_json::to_vec(other)?),
    }
}
