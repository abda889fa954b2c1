//! Consume-until-match.
//!
//! A background worker drains the subscription, acknowledges every
//! delivered message, and keeps the ones the filter accepts. The caller
//! waits for whichever comes first: the worker reaching the requested
//! count, the timeout, cancellation, or a fatal broker error.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::types::RDKafkaErrorCode;
use rdkafka::{Offset, TopicPartitionList};
use serde::{Deserialize, Serialize};
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::message::{ConsumedMessage, MessageFilter, MessageMatcher};
use super::{Connection, SaslConfig, TlsConfig, deserialize_brokers};
use crate::config::{Settings, duration};
use crate::error::{CheckError, CheckFailure, ConfigError};

/// Default consume budget.
pub const DEFAULT_CONSUME_TIMEOUT: Duration = Duration::from_secs(30);

/// Pause after a transient broker error before polling again.
const TRANSIENT_BACKOFF: Duration = Duration::from_millis(100);

fn default_count() -> usize {
    1
}

/// Configuration for a `kafka_consumer` step.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KafkaConsumerConfig {
    #[serde(default, deserialize_with = "deserialize_brokers")]
    pub brokers: Vec<String>,
    #[serde(default)]
    pub topic: String,
    /// Consumer group; a fresh one is generated when absent.
    #[serde(default)]
    pub group_id: Option<String>,
    #[serde(default, with = "duration::option")]
    pub timeout: Option<Duration>,
    /// Matching messages to collect; zero collects until the timeout.
    #[serde(default = "default_count")]
    pub count: usize,
    #[serde(default)]
    pub filter: Option<MessageFilter>,
    #[serde(default)]
    pub from_beginning: bool,
    #[serde(default)]
    pub sasl: Option<SaslConfig>,
    #[serde(default)]
    pub tls: Option<TlsConfig>,
}

impl KafkaConsumerConfig {
    pub fn from_value(value: &serde_json::Value) -> Result<Self, ConfigError> {
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

/// Outcome of a consume.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConsumeResult {
    pub success: bool,
    pub messages: Vec<ConsumedMessage>,
    pub count: usize,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// One-shot completion flag: raising it more than once is a no-op.
#[derive(Debug, Default)]
pub struct CompletionSignal {
    raised: AtomicBool,
    token: CancellationToken,
}

impl CompletionSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the signal. Returns `true` only for the call that raised it.
    pub fn raise(&self) -> bool {
        let first = self
            .raised
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if first {
            self.token.cancel();
        }
        first
    }

    pub fn is_raised(&self) -> bool {
        self.raised.load(Ordering::Acquire)
    }

    /// Resolves once the signal has been raised.
    pub async fn raised(&self) {
        self.token.cancelled().await;
    }
}

/// Source of delivered messages for the drain worker.
pub trait MessageStream: Send + Sync + 'static {
    /// Wait for the next message.
    ///
    /// `Ok(None)` means the broker reported a transient problem that was
    /// already logged; the worker polls again. `Err` is fatal.
    fn next_message(&self) -> impl Future<Output = Result<Option<ConsumedMessage>, CheckError>> + Send;

    /// Mark `message` as processed so the group offset moves past it.
    fn acknowledge(&self, message: &ConsumedMessage) -> Result<(), CheckError>;

    /// Durably commit every acknowledgement. Called once, after the drain
    /// worker has stopped and before the stream is released.
    fn finish(self: Arc<Self>) -> impl Future<Output = Result<(), CheckError>> + Send;
}

/// Shared state between the caller and the drain worker.
#[derive(Debug)]
struct Accumulator {
    messages: Mutex<Vec<ConsumedMessage>>,
    done: CompletionSignal,
    limit: usize,
}

impl Accumulator {
    fn new(limit: usize) -> Self {
        Self {
            messages: Mutex::new(Vec::new()),
            done: CompletionSignal::new(),
            limit,
        }
    }

    /// Append an accepted message; returns whether the limit is reached.
    fn push(&self, message: ConsumedMessage) -> bool {
        let mut messages = self.messages.lock().unwrap_or_else(PoisonError::into_inner);
        messages.push(message);
        self.limit > 0 && messages.len() >= self.limit
    }

    fn take(&self) -> Vec<ConsumedMessage> {
        std::mem::take(&mut *self.messages.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

async fn drain<S: MessageStream>(
    stream: Arc<S>,
    matcher: Arc<MessageMatcher>,
    accumulator: Arc<Accumulator>,
    stop: CancellationToken,
) -> Result<(), CheckError> {
    loop {
        let next = tokio::select! {
            biased;
            _ = stop.cancelled() => return Ok(()),
            next = stream.next_message() => next?,
        };
        let Some(message) = next else {
            continue;
        };

        let accepted = matcher.matches(&message);
        if let Err(err) = stream.acknowledge(&message) {
            warn!(
                topic = %message.topic,
                partition = message.partition,
                offset = message.offset,
                error = %err,
                "Failed to acknowledge message"
            );
        }
        debug!(
            partition = message.partition,
            offset = message.offset,
            accepted,
            "Message delivered"
        );

        if accepted && accumulator.push(message) {
            accumulator.done.raise();
            return Ok(());
        }
    }
}

/// Why collection stopped.
#[derive(Debug)]
enum Stop {
    Complete,
    TimedOut,
    Cancelled,
    Failed(CheckError),
}

/// Run the drain worker until the count is reached, `timeout` passes, the
/// caller cancels, or the stream fails. When this returns the worker has
/// exited, acknowledgements are committed and `stream` is released.
async fn collect<S: MessageStream>(
    stream: Arc<S>,
    matcher: Arc<MessageMatcher>,
    limit: usize,
    timeout: Duration,
    cancel: &CancellationToken,
) -> (Vec<ConsumedMessage>, Stop) {
    let accumulator = Arc::new(Accumulator::new(limit));
    let stop = CancellationToken::new();
    let mut worker = tokio::spawn(drain(
        Arc::clone(&stream),
        matcher,
        Arc::clone(&accumulator),
        stop.clone(),
    ));

    let mut joined = None;
    let mut reason = tokio::select! {
        biased;
        _ = cancel.cancelled() => Stop::Cancelled,
        _ = accumulator.done.raised() => Stop::Complete,
        result = &mut worker => {
            joined = Some(result);
            Stop::Complete
        }
        _ = sleep(timeout) => Stop::TimedOut,
    };

    stop.cancel();
    let joined = match joined {
        Some(result) => result,
        None => worker.await,
    };
    match joined {
        Ok(Ok(())) => {}
        Ok(Err(err)) => reason = Stop::Failed(err),
        Err(err) => reason = Stop::Failed(CheckError::backend("consumer worker failed", err)),
    }

    if let Err(err) = stream.finish().await {
        warn!(error = %err, "Failed to commit acknowledged offsets");
    }

    (accumulator.take(), reason)
}

/// A validated consume.
#[derive(Debug)]
pub struct KafkaConsumer {
    config: KafkaConsumerConfig,
    group_id: String,
    timeout: Duration,
    matcher: Arc<MessageMatcher>,
}

impl KafkaConsumer {
    pub fn new(config: KafkaConsumerConfig, settings: &Settings) -> Result<Self, ConfigError> {
        config.connection().validate()?;
        if config.topic.trim().is_empty() {
            return Err(ConfigError::Missing { field: "topic" });
        }
        let matcher = match &config.filter {
            Some(filter) => filter.compile()?,
            None => MessageMatcher::any(),
        };
        let group_id = config
            .group_id
            .clone()
            .filter(|g| !g.trim().is_empty())
            .unwrap_or_else(|| format!("{}-{}", settings.group_prefix, Uuid::new_v4()));
        let timeout = config
            .timeout
            .filter(|t| !t.is_zero())
            .unwrap_or(DEFAULT_CONSUME_TIMEOUT);

        Ok(Self {
            config,
            group_id,
            timeout,
            matcher: Arc::new(matcher),
        })
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Join the group, collect matching messages, leave the group.
    pub async fn consume(
        &self,
        cancel: &CancellationToken,
    ) -> Result<ConsumeResult, CheckFailure<ConsumeResult>> {
        info!(
            brokers = ?self.config.brokers,
            topic = %self.config.topic,
            group_id = %self.group_id,
            count = self.config.count,
            timeout = ?self.timeout,
            "Starting kafka_consumer"
        );

        let started = Instant::now();
        let stream = match KafkaStream::subscribe(&self.config, &self.group_id) {
            Ok(stream) => Arc::new(stream),
            Err(err) => {
                let result = ConsumeResult {
                    success: false,
                    messages: Vec::new(),
                    count: 0,
                    duration_ms: elapsed_ms(started),
                    error: Some(err.to_string()),
                };
                return Err(CheckFailure::new(result, err));
            }
        };

        self.collect_since(stream, cancel, started).await
    }

    /// Collect from an already-subscribed stream.
    pub async fn consume_from<S: MessageStream>(
        &self,
        stream: Arc<S>,
        cancel: &CancellationToken,
    ) -> Result<ConsumeResult, CheckFailure<ConsumeResult>> {
        self.collect_since(stream, cancel, Instant::now()).await
    }

    /// `duration_ms` in the result is measured from `started`.
    async fn collect_since<S: MessageStream>(
        &self,
        stream: Arc<S>,
        cancel: &CancellationToken,
        started: Instant,
    ) -> Result<ConsumeResult, CheckFailure<ConsumeResult>> {
        let (messages, stop) = collect(
            stream,
            Arc::clone(&self.matcher),
            self.config.count,
            self.timeout,
            cancel,
        )
        .await;

        let mut result = ConsumeResult {
            success: true,
            count: messages.len(),
            messages,
            duration_ms: elapsed_ms(started),
            error: None,
        };

        let failure = match stop {
            Stop::Complete | Stop::TimedOut => None,
            Stop::Cancelled => Some(CheckError::Cancelled),
            Stop::Failed(err) => Some(err),
        };

        match failure {
            None => {
                info!(
                    topic = %self.config.topic,
                    count = result.count,
                    duration_ms = result.duration_ms,
                    "kafka_consumer finished"
                );
                Ok(result)
            }
            Some(err) => {
                warn!(topic = %self.config.topic, count = result.count, error = %err, "kafka_consumer failed");
                result.success = false;
                result.error = Some(err.to_string());
                Err(CheckFailure::new(result, err))
            }
        }
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// A subscribed librdkafka consumer. Leaves the group when dropped.
pub struct KafkaStream {
    consumer: StreamConsumer,
}

impl KafkaStream {
    pub fn subscribe(config: &KafkaConsumerConfig, group_id: &str) -> Result<Self, CheckError> {
        let offset_reset = if config.from_beginning { "earliest" } else { "latest" };
        let consumer: StreamConsumer = config
            .connection()
            .client_config()
            .set("group.id", group_id)
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false")
            .set("auto.offset.reset", offset_reset)
            .set("enable.partition.eof", "false")
            .create()
            .map_err(|err| CheckError::setup("create consumer group", err))?;

        consumer
            .subscribe(&[config.topic.as_str()])
            .map_err(|err| CheckError::setup("subscribe", err))?;
        Ok(Self { consumer })
    }
}

impl MessageStream for KafkaStream {
    async fn next_message(&self) -> Result<Option<ConsumedMessage>, CheckError> {
        match self.consumer.recv().await {
            Ok(message) => Ok(Some(ConsumedMessage::from_kafka(&message))),
            Err(err) if is_fatal(&err) => Err(CheckError::backend("consume failed", err)),
            Err(err) => {
                warn!(error = %err, "Transient Kafka error, continuing");
                sleep(TRANSIENT_BACKOFF).await;
                Ok(None)
            }
        }
    }

    fn acknowledge(&self, message: &ConsumedMessage) -> Result<(), CheckError> {
        let mut offsets = TopicPartitionList::new();
        offsets
            .add_partition_offset(
                &message.topic,
                message.partition,
                Offset::Offset(message.offset + 1),
            )
            .map_err(|err| CheckError::backend("store offset failed", err))?;
        self.consumer
            .store_offsets(&offsets)
            .map_err(|err| CheckError::backend("store offset failed", err))
    }

    async fn finish(self: Arc<Self>) -> Result<(), CheckError> {
        let committed = tokio::task::spawn_blocking(move || {
            match self.consumer.commit_consumer_state(CommitMode::Sync) {
                Ok(()) | Err(KafkaError::ConsumerCommit(RDKafkaErrorCode::NoOffset)) => Ok(()),
                Err(err) => Err(CheckError::backend("commit failed", err)),
            }
        })
        .await;
        match committed {
            Ok(result) => result,
            Err(err) => Err(CheckError::backend("commit failed", err)),
        }
    }
}

impl Drop for KafkaStream {
    fn drop(&mut self) {
        self.consumer.unsubscribe();
        debug!("Kafka consumer left group");
    }
}

/// Errors that retrying within this invocation cannot fix.
fn is_fatal(err: &KafkaError) -> bool {
    matches!(
        err.rdkafka_error_code(),
        Some(
            RDKafkaErrorCode::Fatal
                | RDKafkaErrorCode::Authentication
                | RDKafkaErrorCode::SaslAuthenticationFailed
                | RDKafkaErrorCode::TopicAuthorizationFailed
                | RDKafkaErrorCode::GroupAuthorizationFailed
                | RDKafkaErrorCode::ClusterAuthorizationFailed
        )
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_completion_signal_raises_once() {
        let signal = Arc::new(CompletionSignal::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let signal = Arc::clone(&signal);
                std::thread::spawn(move || signal.raise())
            })
            .collect();
        let raised: usize = handles
            .into_iter()
            .map(|h| usize::from(h.join().expect("join")))
            .sum();
        assert_eq!(raised, 1);
        assert!(signal.is_raised());
    }

    #[tokio::test]
    async fn test_completion_signal_wakes_waiter() {
        let signal = Arc::new(CompletionSignal::new());
        let waiter = {
            let signal = Arc::clone(&signal);
            tokio::spawn(async move { signal.raised().await })
        };
        assert!(signal.raise());
        assert!(!signal.raise());
        waiter.await.expect("waiter");
    }

    #[test]
    fn test_config_defaults_and_group_id() {
        let config = KafkaConsumerConfig::from_value(&json!({
            "brokers": "localhost:9092",
            "topic": "orders"
        }))
        .expect("decode");
        assert_eq!(config.count, 1);
        assert!(!config.from_beginning);

        let settings = Settings::default();
        let first = KafkaConsumer::new(config.clone(), &settings).expect("consumer");
        let second = KafkaConsumer::new(config, &settings).expect("consumer");
        assert!(first.group_id().starts_with("settle-"));
        assert_ne!(first.group_id(), second.group_id());
        assert_eq!(first.timeout(), DEFAULT_CONSUME_TIMEOUT);
    }

    #[test]
    fn test_explicit_group_id_is_kept() {
        let config = KafkaConsumerConfig::from_value(&json!({
            "brokers": ["localhost:9092"],
            "topic": "orders",
            "group_id": "run-42",
            "timeout": "5s",
            "count": 0
        }))
        .expect("decode");
        let consumer = KafkaConsumer::new(config, &Settings::default()).expect("consumer");
        assert_eq!(consumer.group_id(), "run-42");
        assert_eq!(consumer.timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_config_validation() {
        let config = KafkaConsumerConfig::from_value(&json!({"brokers": "localhost:9092"}))
            .expect("decode");
        assert!(matches!(
            KafkaConsumer::new(config, &Settings::default()),
            Err(ConfigError::Missing { field: "topic" })
        ));

        let config = KafkaConsumerConfig::from_value(&json!({"topic": "orders"})).expect("decode");
        assert!(matches!(
            KafkaConsumer::new(config, &Settings::default()),
            Err(ConfigError::Missing { field: "brokers" })
        ));

        let config = KafkaConsumerConfig::from_value(&json!({
            "brokers": "localhost:9092",
            "topic": "orders",
            "filter": {"key_pattern": "(unclosed"}
        }))
        .expect("decode");
        assert!(matches!(
            KafkaConsumer::new(config, &Settings::default()),
            Err(ConfigError::Invalid { field: "filter.key_pattern", .. })
        ));
    }

    /// Yields one message, then idles.
    struct SingleMessage(Mutex<Option<ConsumedMessage>>);

    impl MessageStream for SingleMessage {
        async fn next_message(&self) -> Result<Option<ConsumedMessage>, CheckError> {
            let next = self.0.lock().unwrap_or_else(PoisonError::into_inner).take();
            match next {
                Some(message) => Ok(Some(message)),
                None => std::future::pending().await,
            }
        }

        fn acknowledge(&self, _message: &ConsumedMessage) -> Result<(), CheckError> {
            Ok(())
        }

        async fn finish(self: Arc<Self>) -> Result<(), CheckError> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_duration_counts_from_consume_start() {
        let config = KafkaConsumerConfig::from_value(&json!({
            "brokers": "localhost:9092",
            "topic": "orders"
        }))
        .expect("decode");
        let consumer = KafkaConsumer::new(config, &Settings::default()).expect("consumer");

        let started = Instant::now();
        // Stands in for consumer creation and group join.
        tokio::time::advance(Duration::from_millis(250)).await;
        let stream = Arc::new(SingleMessage(Mutex::new(Some(ConsumedMessage::new(
            "orders", 0, 0, "k", "v",
        )))));

        let result = consumer
            .collect_since(stream, &CancellationToken::new(), started)
            .await
            .expect("consume");
        assert_eq!(result.count, 1);
        assert!(result.duration_ms >= 250, "got {}ms", result.duration_ms);
    }
}
