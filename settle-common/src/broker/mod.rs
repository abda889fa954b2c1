//! Kafka consume-until-match and acknowledged publish.
//!
//! Every invocation opens its own client and tears it down before
//! returning. Nothing is cached across calls.

pub mod consumer;
pub mod message;
pub mod producer;

use std::fmt;
use std::path::PathBuf;

use rdkafka::ClientConfig;
use serde::de::Deserializer;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::redact::mask_secret;

pub use consumer::{
    CompletionSignal, ConsumeResult, KafkaConsumer, KafkaConsumerConfig, MessageStream,
};
pub use message::{ConsumedMessage, MessageFilter, MessageMatcher};
pub use producer::{KafkaProducer, KafkaProducerConfig, PublishResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SaslMechanism {
    #[serde(rename = "PLAIN")]
    Plain,
    #[serde(rename = "SCRAM-SHA-256")]
    ScramSha256,
    #[serde(rename = "SCRAM-SHA-512")]
    ScramSha512,
}

impl SaslMechanism {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Plain => "PLAIN",
            Self::ScramSha256 => "SCRAM-SHA-256",
            Self::ScramSha512 => "SCRAM-SHA-512",
        }
    }
}

/// SASL credentials.
#[derive(Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SaslConfig {
    pub mechanism: SaslMechanism,
    pub username: String,
    #[serde(default)]
    pub password: String,
}

impl fmt::Debug for SaslConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SaslConfig")
            .field("mechanism", &self.mechanism)
            .field("username", &self.username)
            .field("password", &mask_secret(&self.password))
            .finish()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TlsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub insecure_skip_verify: bool,
    #[serde(default)]
    pub cert_file: Option<PathBuf>,
    #[serde(default)]
    pub key_file: Option<PathBuf>,
    #[serde(default)]
    pub ca_file: Option<PathBuf>,
}

/// Connection settings shared by the consumer and the producer.
#[derive(Debug, Clone)]
pub(crate) struct Connection<'a> {
    pub brokers: &'a [String],
    pub sasl: Option<&'a SaslConfig>,
    pub tls: Option<&'a TlsConfig>,
}

impl Connection<'_> {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.brokers.is_empty() {
            return Err(ConfigError::Missing { field: "brokers" });
        }
        if let Some(sasl) = self.sasl {
            if sasl.username.trim().is_empty() {
                return Err(ConfigError::Missing {
                    field: "sasl.username",
                });
            }
        }
        if let Some(tls) = self.tls {
            if tls.key_file.is_some() && tls.cert_file.is_none() {
                return Err(ConfigError::invalid("tls.key_file", "requires tls.cert_file"));
            }
        }
        Ok(())
    }

    /// Base librdkafka configuration: bootstrap servers, security protocol,
    /// SASL and TLS.
    pub fn client_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        config.set("bootstrap.servers", self.brokers.join(","));

        let tls = self.tls.filter(|tls| tls.enabled);
        let protocol = match (self.sasl.is_some(), tls.is_some()) {
            (true, true) => "SASL_SSL",
            (true, false) => "SASL_PLAINTEXT",
            (false, true) => "SSL",
            (false, false) => "PLAINTEXT",
        };
        config.set("security.protocol", protocol);

        if let Some(sasl) = self.sasl {
            config
                .set("sasl.mechanism", sasl.mechanism.as_str())
                .set("sasl.username", &sasl.username)
                .set("sasl.password", &sasl.password);
        }

        if let Some(tls) = tls {
            if let Some(ca) = &tls.ca_file {
                config.set("ssl.ca.location", ca.to_string_lossy());
            }
            if let Some(cert) = &tls.cert_file {
                config.set("ssl.certificate.location", cert.to_string_lossy());
            }
            if let Some(key) = &tls.key_file {
                config.set("ssl.key.location", key.to_string_lossy());
            }
            if tls.insecure_skip_verify {
                config
                    .set("enable.ssl.certificate.verification", "false")
                    .set("ssl.endpoint.identification.algorithm", "none");
            }
        }

        config
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawBrokers {
    One(String),
    Many(Vec<String>),
}

/// Accept `"a:9092,b:9092"` or `["a:9092", "b:9092"]`; array entries may
/// themselves be comma-separated.
pub(crate) fn deserialize_brokers<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<RawBrokers>::deserialize(deserializer)?;
    let entries = match raw {
        None => Vec::new(),
        Some(RawBrokers::One(list)) => vec![list],
        Some(RawBrokers::Many(items)) => items,
    };
    Ok(entries
        .iter()
        .flat_map(|entry| entry.split(','))
        .map(str::trim)
        .filter(|broker| !broker.is_empty())
        .map(str::to_string)
        .collect())
}
