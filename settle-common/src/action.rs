//! The `execute(cancel, config) -> OutputData` contract and the built-in
//! actions.
//!
//! Each action decodes the generic config map into its strict typed config,
//! runs the checker, and flattens the checker's result into an ordered
//! output map. A checker that completes without satisfying its condition
//! (timeout, attempt exhaustion) still returns `Ok` with `success: false`;
//! only configuration problems, setup failures, hard backend errors and
//! cancellation are `Err`.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use crate::broker::{KafkaConsumer, KafkaConsumerConfig, KafkaProducer, KafkaProducerConfig};
use crate::config::Settings;
use crate::db_poll::{DbPollConfig, DbPoller};
use crate::error::{ActionError, CheckError, ConfigError};
use crate::transform::{self, TransformConfig};
use crate::wait::{WaitFor, WaitForConfig};

/// Ordered string-keyed output of an action.
pub type OutputData = Map<String, Value>;

#[async_trait]
pub trait Action: Send + Sync {
    /// Name the action is registered under.
    fn name(&self) -> &'static str;

    async fn execute(
        &self,
        cancel: &CancellationToken,
        config: &Value,
    ) -> Result<OutputData, ActionError>;
}

fn config_error(action: &'static str) -> impl FnOnce(ConfigError) -> ActionError {
    move |source| ActionError::Config { action, source }
}

fn check_error(action: &'static str) -> impl FnOnce(CheckError) -> ActionError {
    move |source| match source {
        CheckError::Config(source) => ActionError::Config { action, source },
        source => ActionError::Check { action, source },
    }
}

fn to_output<T: Serialize>(action: &'static str, result: &T) -> Result<OutputData, ActionError> {
    match serde_json::to_value(result) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => {
            let mut map = Map::new();
            map.insert("result".into(), other);
            Ok(map)
        }
        Err(err) => Err(check_error(action)(err.into())),
    }
}

/// `wait_for`: HTTP or TCP readiness.
#[derive(Debug, Clone, Default)]
pub struct WaitForAction {
    settings: Settings,
}

impl WaitForAction {
    pub fn new(settings: Settings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl Action for WaitForAction {
    fn name(&self) -> &'static str {
        "wait_for"
    }

    async fn execute(
        &self,
        cancel: &CancellationToken,
        config: &Value,
    ) -> Result<OutputData, ActionError> {
        let config = WaitForConfig::from_value(config).map_err(config_error(self.name()))?;
        let waiter = WaitFor::new(&config, &self.settings).map_err(config_error(self.name()))?;
        let result = waiter
            .wait(cancel)
            .await
            .map_err(|failure| check_error(self.name())(failure.into_error()))?;
        to_output(self.name(), &result)
    }
}

/// `db_poll`: query until a row condition holds.
#[derive(Debug, Clone, Copy, Default)]
pub struct DbPollAction;

#[async_trait]
impl Action for DbPollAction {
    fn name(&self) -> &'static str {
        "db_poll"
    }

    async fn execute(
        &self,
        cancel: &CancellationToken,
        config: &Value,
    ) -> Result<OutputData, ActionError> {
        let config = DbPollConfig::from_value(config).map_err(config_error(self.name()))?;
        let poller = DbPoller::new(config).map_err(config_error(self.name()))?;
        let result = poller
            .poll(cancel)
            .await
            .map_err(|failure| check_error(self.name())(failure.into_error()))?;

        let mut output = to_output(self.name(), &result)?;
        if let Some(first) = result.first_row() {
            output.insert("first_row".into(), Value::Object(first.clone()));
        }
        Ok(output)
    }
}

/// `kafka_consumer`: collect matching messages from a topic.
#[derive(Debug, Clone, Default)]
pub struct KafkaConsumerAction {
    settings: Settings,
}

impl KafkaConsumerAction {
    pub fn new(settings: Settings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl Action for KafkaConsumerAction {
    fn name(&self) -> &'static str {
        "kafka_consumer"
    }

    async fn execute(
        &self,
        cancel: &CancellationToken,
        config: &Value,
    ) -> Result<OutputData, ActionError> {
        let config = KafkaConsumerConfig::from_value(config).map_err(config_error(self.name()))?;
        let consumer =
            KafkaConsumer::new(config, &self.settings).map_err(config_error(self.name()))?;
        let result = consumer
            .consume(cancel)
            .await
            .map_err(|failure| check_error(self.name())(failure.into_error()))?;
        to_output(self.name(), &result)
    }
}

/// `kafka_producer`: publish one message and wait for the broker ack.
#[derive(Debug, Clone, Copy, Default)]
pub struct KafkaProducerAction;

#[async_trait]
impl Action for KafkaProducerAction {
    fn name(&self) -> &'static str {
        "kafka_producer"
    }

    async fn execute(
        &self,
        cancel: &CancellationToken,
        config: &Value,
    ) -> Result<OutputData, ActionError> {
        let config = KafkaProducerConfig::from_value(config).map_err(config_error(self.name()))?;
        let producer = KafkaProducer::new(config).map_err(check_error(self.name()))?;
        let result = producer
            .publish(cancel)
            .await
            .map_err(check_error(self.name()))?;
        to_output(self.name(), &result)
    }
}

/// `transform`: path-based field extraction.
#[derive(Debug, Clone, Copy, Default)]
pub struct TransformAction;

#[async_trait]
impl Action for TransformAction {
    fn name(&self) -> &'static str {
        "transform"
    }

    async fn execute(
        &self,
        _cancel: &CancellationToken,
        config: &Value,
    ) -> Result<OutputData, ActionError> {
        let config = TransformConfig::from_value(config).map_err(config_error(self.name()))?;
        Ok(transform::apply(&config))
    }
}

/// Actions by name.
#[derive(Clone, Default)]
pub struct ActionRegistry {
    actions: BTreeMap<&'static str, Arc<dyn Action>>,
}

impl fmt::Debug for ActionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.actions.keys()).finish()
    }
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in action.
    pub fn with_defaults(settings: &Settings) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(WaitForAction::new(settings.clone())));
        registry.register(Arc::new(DbPollAction));
        registry.register(Arc::new(KafkaConsumerAction::new(settings.clone())));
        registry.register(Arc::new(KafkaProducerAction));
        registry.register(Arc::new(TransformAction));
        registry
    }

    /// Register `action`, returning any action it replaced.
    pub fn register(&mut self, action: Arc<dyn Action>) -> Option<Arc<dyn Action>> {
        self.actions.insert(action.name(), action)
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Action>> {
        self.actions.get(name).cloned()
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.actions.keys().copied()
    }

    pub async fn execute(
        &self,
        name: &str,
        cancel: &CancellationToken,
        config: &Value,
    ) -> Result<OutputData, ActionError> {
        let action = self
            .get(name)
            .ok_or_else(|| ActionError::UnknownAction(name.to_string()))?;
        action.execute(cancel, config).await
    }
}
