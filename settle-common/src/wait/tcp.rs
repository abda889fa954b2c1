//! TCP reachability probe.

use std::time::Duration;

use serde_json::{Map, Value};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::poll::Evaluation;

#[derive(Debug, Clone)]
pub struct TcpChecker {
    address: String,
    connect_timeout: Duration,
}

impl TcpChecker {
    pub fn new(host: &str, port: u16, connect_timeout: Duration) -> Self {
        let address = if host.contains(':') && !host.starts_with('[') {
            format!("[{host}]:{port}")
        } else {
            format!("{host}:{port}")
        };
        Self {
            address,
            connect_timeout,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Connect once and close immediately. No data is exchanged.
    pub async fn check(&self) -> Evaluation<Map<String, Value>> {
        let mut detail = Map::new();
        detail.insert("address".into(), Value::String(self.address.clone()));

        let error = match timeout(self.connect_timeout, TcpStream::connect(&self.address)).await {
            Ok(Ok(stream)) => {
                drop(stream);
                detail.insert("connected".into(), Value::Bool(true));
                return Evaluation::satisfied(detail);
            }
            Ok(Err(err)) => err.to_string(),
            Err(_) => format!("connect timed out after {:?}", self.connect_timeout),
        };

        debug!(address = %self.address, error = %error, "TCP probe not ready");
        detail.insert("error".into(), Value::String(error));
        Evaluation::pending(detail)
    }
}
