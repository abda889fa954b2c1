//! Readiness waits over HTTP and raw TCP.
//!
//! A [`WaitFor`] is built from a strict [`WaitForConfig`] and drives one
//! probe per poll attempt. Transport failures are never hard errors here:
//! a refused connection or a DNS miss just means "not yet".

pub mod http;
pub mod tcp;

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{Settings, duration};
use crate::error::{CheckError, CheckFailure, ConfigError};
use crate::poll::{self, PollSpec};

pub use self::http::{HttpChecker, HttpProbe};
pub use self::tcp::TcpChecker;

/// Default overall budget for a wait.
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WaitKind {
    Http,
    Tcp,
}

impl WaitKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Tcp => "tcp",
        }
    }
}

/// Configuration for a `wait_for` step.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WaitForConfig {
    #[serde(rename = "type")]
    pub kind: WaitKind,
    #[serde(default, with = "duration::option")]
    pub timeout: Option<Duration>,
    #[serde(default, with = "duration::option")]
    pub interval: Option<Duration>,
    #[serde(default)]
    pub max_attempts: u32,

    // HTTP
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default, deserialize_with = "duration::string_map")]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub status_code: Option<u16>,
    #[serde(default)]
    pub body_contains: Option<String>,
    #[serde(default)]
    pub json_path: Option<String>,
    #[serde(default)]
    pub json_value: Option<Value>,

    // TCP
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
}

impl WaitForConfig {
    pub fn from_value(value: &Value) -> Result<Self, ConfigError> {
        Ok(Self::deserialize(value)?)
    }

    /// An HTTP wait for `url` expecting 200.
    pub fn http(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            ..Self::empty(WaitKind::Http)
        }
    }

    /// A TCP wait for `host:port`.
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: Some(host.into()),
            port: Some(port),
            ..Self::empty(WaitKind::Tcp)
        }
    }

    fn empty(kind: WaitKind) -> Self {
        Self {
            kind,
            timeout: None,
            interval: None,
            max_attempts: 0,
            url: None,
            method: None,
            headers: BTreeMap::new(),
            status_code: None,
            body_contains: None,
            json_path: None,
            json_value: None,
            host: None,
            port: None,
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = Some(interval);
        self
    }

    pub fn poll_spec(&self) -> PollSpec {
        PollSpec::from_parts(
            self.timeout,
            self.interval,
            self.max_attempts,
            DEFAULT_WAIT_TIMEOUT,
        )
    }

    fn http_probe(&self) -> Result<HttpProbe, ConfigError> {
        let url = self
            .url
            .as_deref()
            .filter(|u| !u.trim().is_empty())
            .ok_or(ConfigError::Missing { field: "url" })?;
        if self.json_value.is_some() && self.json_path.is_none() {
            return Err(ConfigError::invalid("json_value", "requires json_path"));
        }

        let probe = HttpProbe {
            url: url.to_string(),
            method: self
                .method
                .as_deref()
                .map(|m| m.trim().to_uppercase())
                .filter(|m| !m.is_empty())
                .unwrap_or_else(|| "GET".to_string()),
            headers: self.headers.clone(),
            expected_status: self.status_code.filter(|s| *s != 0).unwrap_or(200),
            body_contains: self.body_contains.clone().filter(|s| !s.is_empty()),
            json_path: self.json_path.clone().filter(|s| !s.is_empty()),
            json_value: self.json_value.clone(),
        };
        probe.validate()?;
        Ok(probe)
    }

    fn tcp_target(&self) -> Result<(&str, u16), ConfigError> {
        let host = self
            .host
            .as_deref()
            .filter(|h| !h.trim().is_empty())
            .ok_or(ConfigError::Missing { field: "host" })?;
        let port = self
            .port
            .filter(|p| *p != 0)
            .ok_or(ConfigError::Missing { field: "port" })?;
        Ok((host, port))
    }
}

/// Outcome of a wait.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WaitResult {
    pub success: bool,
    pub attempts: u32,
    pub duration_ms: u64,
    /// Diagnostics of the most recent completed probe.
    pub last_result: Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug)]
enum Probe {
    Http(HttpChecker),
    Tcp(TcpChecker),
}

impl Probe {
    async fn check(&self) -> poll::Evaluation<Map<String, Value>> {
        match self {
            Self::Http(checker) => checker.check().await,
            Self::Tcp(checker) => checker.check().await,
        }
    }
}

/// A validated, ready-to-run wait.
#[derive(Debug)]
pub struct WaitFor {
    kind: WaitKind,
    spec: PollSpec,
    probe: Probe,
}

impl WaitFor {
    pub fn new(config: &WaitForConfig, settings: &Settings) -> Result<Self, ConfigError> {
        let probe = match config.kind {
            WaitKind::Http => Probe::Http(HttpChecker::new(
                config.http_probe()?,
                settings.http_request_timeout,
            )?),
            WaitKind::Tcp => {
                let (host, port) = config.tcp_target()?;
                Probe::Tcp(TcpChecker::new(host, port, settings.tcp_connect_timeout))
            }
        };
        Ok(Self {
            kind: config.kind,
            spec: config.poll_spec(),
            probe,
        })
    }

    pub fn spec(&self) -> &PollSpec {
        &self.spec
    }

    /// Probe until ready or the budget runs out.
    ///
    /// Timeout and exhaustion return `Ok` with `success == false`; only
    /// cancellation surfaces as an error.
    pub async fn wait(
        &self,
        cancel: &CancellationToken,
    ) -> Result<WaitResult, CheckFailure<WaitResult>> {
        info!(
            kind = self.kind.as_str(),
            timeout = ?self.spec.timeout,
            interval = ?self.spec.interval,
            max_attempts = self.spec.max_attempts,
            "Starting wait_for"
        );

        let probe = &self.probe;
        let outcome = poll::poll(&self.spec, cancel, move |_| async move {
            Ok::<_, CheckError>(probe.check().await)
        })
        .await;

        let settled = outcome.settle();
        let result = WaitResult {
            success: settled.success,
            attempts: settled.attempts,
            duration_ms: settled.duration_ms,
            last_result: settled.last.unwrap_or_default(),
            error: settled.message,
        };

        if result.success {
            info!(
                kind = self.kind.as_str(),
                attempts = result.attempts,
                duration_ms = result.duration_ms,
                "wait_for condition satisfied"
            );
        } else {
            warn!(
                kind = self.kind.as_str(),
                attempts = result.attempts,
                duration_ms = result.duration_ms,
                error = result.error.as_deref().unwrap_or_default(),
                "wait_for condition not satisfied"
            );
        }

        match settled.failure {
            Some(error) => Err(CheckFailure::new(result, error)),
            None => Ok(result),
        }
    }
}

/// Failure of the readiness helpers.
#[derive(Debug, Error)]
pub enum ReadyError {
    #[error("{target} not ready: {reason}")]
    NotReady { target: String, reason: String },

    #[error(transparent)]
    Check(#[from] CheckError),
}

impl From<ConfigError> for ReadyError {
    fn from(err: ConfigError) -> Self {
        Self::Check(err.into())
    }
}

async fn wait_ready(
    cancel: &CancellationToken,
    config: WaitForConfig,
    target: String,
) -> Result<(), ReadyError> {
    let waiter = WaitFor::new(&config, &Settings::default())?;
    let result = waiter
        .wait(cancel)
        .await
        .map_err(CheckFailure::into_error)?;
    if result.success {
        return Ok(());
    }
    Err(ReadyError::NotReady {
        target,
        reason: result.error.unwrap_or_default(),
    })
}

/// Wait until `url` answers 200, polling once a second.
pub async fn wait_for_http_ready(
    cancel: &CancellationToken,
    url: &str,
    timeout: Duration,
) -> Result<(), ReadyError> {
    let config = WaitForConfig::http(url)
        .with_timeout(timeout)
        .with_interval(Duration::from_secs(1));
    wait_ready(cancel, config, format!("endpoint {url}")).await
}

/// Wait until `host:port` accepts connections, polling once a second.
pub async fn wait_for_tcp_ready(
    cancel: &CancellationToken,
    host: &str,
    port: u16,
    timeout: Duration,
) -> Result<(), ReadyError> {
    let config = WaitForConfig::tcp(host, port)
        .with_timeout(timeout)
        .with_interval(Duration::from_secs(1));
    wait_ready(cancel, config, format!("port {host}:{port}")).await
}
