//! HTTP readiness probe.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use reqwest::{Client, Method, Url};
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::ConfigError;
use crate::path;
use crate::poll::Evaluation;

/// Methods sent without a request body.
const BODYLESS_METHODS: &[&str] = &["GET", "HEAD", "DELETE", "OPTIONS", "TRACE"];

/// Methods sent with an empty request body.
const BODY_METHODS: &[&str] = &["POST", "PUT", "PATCH"];

/// What a single HTTP probe sends and what it expects back.
#[derive(Debug, Clone)]
pub struct HttpProbe {
    pub url: String,
    pub method: String,
    pub headers: BTreeMap<String, String>,
    pub expected_status: u16,
    pub body_contains: Option<String>,
    pub json_path: Option<String>,
    pub json_value: Option<Value>,
}

impl HttpProbe {
    /// Probe `url` with GET expecting 200.
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: "GET".to_string(),
            headers: BTreeMap::new(),
            expected_status: 200,
            body_contains: None,
            json_path: None,
            json_value: None,
        }
    }

    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        if self.url.trim().is_empty() {
            return Err(ConfigError::Missing { field: "url" });
        }
        Url::parse(&self.url).map_err(|err| ConfigError::invalid("url", err))?;
        let method = self.method.as_str();
        if !BODYLESS_METHODS.contains(&method) && !BODY_METHODS.contains(&method) {
            return Err(ConfigError::Unsupported {
                kind: "HTTP method",
                value: self.method.clone(),
            });
        }
        Ok(())
    }
}

/// Executes [`HttpProbe`]s with a short per-request timeout.
///
/// Each request is a plain future: dropping it mid-flight closes its
/// connection. No idle connections are pooled between attempts.
#[derive(Debug, Clone)]
pub struct HttpChecker {
    probe: Arc<HttpProbe>,
    client: Client,
    request_timeout: Duration,
}

struct Observed {
    status: u16,
    body: String,
}

impl HttpChecker {
    pub fn new(probe: HttpProbe, request_timeout: Duration) -> Result<Self, ConfigError> {
        let client = Client::builder()
            .pool_max_idle_per_host(0)
            .build()
            .map_err(|err| ConfigError::invalid("http client", err))?;
        Ok(Self {
            probe: Arc::new(probe),
            client,
            request_timeout,
        })
    }

    /// Perform one probe.
    ///
    /// Transport failures are reported as "not yet satisfied" with the
    /// failure recorded under `error`; the status code and raw body of every
    /// response are kept for diagnostics.
    pub async fn check(&self) -> Evaluation<Map<String, Value>> {
        let mut detail = Map::new();

        let observed = match self.send().await {
            Ok(observed) => observed,
            Err(err) => {
                debug!(url = %self.probe.url, error = %err, "HTTP probe transport error");
                detail.insert("error".into(), Value::String(err.to_string()));
                return Evaluation::pending(detail);
            }
        };

        detail.insert("status_code".into(), Value::from(observed.status));
        detail.insert("body".into(), Value::String(observed.body.clone()));

        let satisfied = self.evaluate(&observed, &mut detail);
        Evaluation {
            satisfied,
            detail,
        }
    }

    async fn send(&self) -> Result<Observed, reqwest::Error> {
        let probe = &self.probe;
        let method = Method::from_bytes(probe.method.as_bytes()).unwrap_or(Method::GET);

        let mut request = self
            .client
            .request(method, probe.url.as_str())
            .timeout(self.request_timeout);
        for (name, value) in &probe.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if BODY_METHODS.contains(&probe.method.as_str()) {
            request = request.body(Vec::<u8>::new());
        }

        let response = request.send().await?;
        let status = response.status().as_u16();
        let bytes = response.bytes().await?;
        Ok(Observed {
            status,
            body: String::from_utf8_lossy(&bytes).into_owned(),
        })
    }

    fn evaluate(&self, observed: &Observed, detail: &mut Map<String, Value>) -> bool {
        let probe = &self.probe;
        if observed.status != probe.expected_status {
            return false;
        }

        if let Some(needle) = &probe.body_contains {
            if !observed.body.contains(needle.as_str()) {
                return false;
            }
        }

        if let Some(json_path) = &probe.json_path {
            let Ok(body) = serde_json::from_str::<Value>(&observed.body) else {
                return false;
            };
            let actual = path::extract(&body, json_path);
            detail.insert("json_value".into(), actual.cloned().unwrap_or(Value::Null));
            return path::matches(&body, json_path, probe.json_value.as_ref());
        }

        true
    }
}
