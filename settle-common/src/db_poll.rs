//! Database polling: run a parameterized query until its rows satisfy a
//! condition.
//!
//! The connection is opened once per [`DbPoller::poll`] call and closed
//! before it returns on every path. Queries run on the blocking pool; a
//! query still running when the budget ends is interrupted.

use std::sync::{Arc, Mutex, PoisonError, TryLockError};
use std::time::Duration;

use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{Connection, InterruptHandle, OpenFlags, params_from_iter};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::duration;
use crate::error::{CheckError, CheckFailure, ConfigError};
use crate::path;
use crate::poll::{self, Evaluation, PollSpec};
use crate::redact::mask_dsn;

/// Default overall budget for a database poll.
pub const DEFAULT_DB_POLL_TIMEOUT: Duration = Duration::from_secs(60);

/// Drivers accepted in `driver`.
const SQLITE_DRIVERS: &[&str] = &["sqlite", "sqlite3"];

/// One decoded row: column name to value, in select-list order.
pub type Row = Map<String, Value>;

/// When a poll counts as satisfied.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PollCondition {
    /// At least one row.
    #[default]
    RowExists,
    /// At least `min_count` rows; zero means one.
    RowCount {
        #[serde(default)]
        min_count: usize,
    },
    /// Some row's `column` string-compares equal to `value`.
    ValueEquals { column: String, value: Value },
    /// Some row has a non-null `column`.
    ValueNotNull { column: String },
}

impl PollCondition {
    pub fn evaluate(&self, rows: &[Row]) -> bool {
        match self {
            Self::RowExists => !rows.is_empty(),
            Self::RowCount { min_count } => rows.len() >= (*min_count).max(1),
            Self::ValueEquals { column, value } => rows
                .iter()
                .filter_map(|row| row.get(column))
                .any(|actual| path::values_equal(actual, value)),
            Self::ValueNotNull { column } => rows
                .iter()
                .filter_map(|row| row.get(column))
                .any(|actual| !actual.is_null()),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::RowExists => "row_exists",
            Self::RowCount { .. } => "row_count",
            Self::ValueEquals { .. } => "value_equals",
            Self::ValueNotNull { .. } => "value_not_null",
        }
    }
}

fn default_driver() -> String {
    "sqlite".to_string()
}

/// Configuration for a `db_poll` step.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DbPollConfig {
    #[serde(default = "default_driver")]
    pub driver: String,
    /// Database path or `file:` URI.
    #[serde(default, alias = "connection")]
    pub dsn: String,
    #[serde(default)]
    pub query: String,
    /// Positional query parameters.
    #[serde(default)]
    pub params: Vec<Value>,
    #[serde(default, with = "duration::option")]
    pub timeout: Option<Duration>,
    #[serde(default, with = "duration::option")]
    pub interval: Option<Duration>,
    #[serde(default)]
    pub max_attempts: u32,
    #[serde(default)]
    pub condition: PollCondition,
}

impl DbPollConfig {
    pub fn from_value(value: &Value) -> Result<Self, ConfigError> {
        Ok(Self::deserialize(value)?)
    }

    pub fn poll_spec(&self) -> PollSpec {
        PollSpec::from_parts(
            self.timeout,
            self.interval,
            self.max_attempts,
            DEFAULT_DB_POLL_TIMEOUT,
        )
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let driver = self.driver.trim().to_lowercase();
        if !SQLITE_DRIVERS.contains(&driver.as_str()) {
            return Err(ConfigError::Unsupported {
                kind: "database driver",
                value: self.driver.clone(),
            });
        }
        if self.dsn.trim().is_empty() {
            return Err(ConfigError::Missing { field: "dsn" });
        }
        if self.query.trim().is_empty() {
            return Err(ConfigError::Missing { field: "query" });
        }
        match &self.condition {
            PollCondition::ValueEquals { column, .. } | PollCondition::ValueNotNull { column }
                if column.trim().is_empty() =>
            {
                Err(ConfigError::Missing { field: "condition.column" })
            }
            _ => Ok(()),
        }
    }
}

/// Outcome of a database poll.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DbPollResult {
    pub success: bool,
    /// Rows returned by the most recent completed query.
    pub rows: Vec<Row>,
    pub row_count: usize,
    pub attempts: u32,
    pub duration_ms: u64,
    pub condition_satisfied: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DbPollResult {
    fn empty() -> Self {
        Self {
            success: false,
            rows: Vec::new(),
            row_count: 0,
            attempts: 0,
            duration_ms: 0,
            condition_satisfied: false,
            error: None,
        }
    }

    pub fn first_row(&self) -> Option<&Row> {
        self.rows.first()
    }
}

/// A validated database poll.
#[derive(Debug)]
pub struct DbPoller {
    dsn: String,
    query: Arc<str>,
    params: Arc<[SqlValue]>,
    condition: PollCondition,
    spec: PollSpec,
}

impl DbPoller {
    pub fn new(config: DbPollConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let spec = config.poll_spec();
        let params: Vec<SqlValue> = config.params.iter().map(to_sql_value).collect();
        Ok(Self {
            dsn: config.dsn,
            query: Arc::from(config.query),
            params: Arc::from(params),
            condition: config.condition,
            spec,
        })
    }

    pub fn spec(&self) -> &PollSpec {
        &self.spec
    }

    /// Query until the condition holds or the budget runs out.
    ///
    /// A connection failure or a query error is a hard error: the result is
    /// populated with the message and returned inside the failure.
    pub async fn poll(
        &self,
        cancel: &CancellationToken,
    ) -> Result<DbPollResult, CheckFailure<DbPollResult>> {
        info!(
            dsn = %mask_dsn(&self.dsn),
            query = %self.query,
            condition = self.condition.name(),
            timeout = ?self.spec.timeout,
            interval = ?self.spec.interval,
            "Starting db_poll"
        );

        let session = match Session::open(&self.dsn).await {
            Ok(session) => session,
            Err(err) => {
                let mut result = DbPollResult::empty();
                result.error = Some(err.to_string());
                return Err(CheckFailure::new(result, err));
            }
        };

        let outcome = {
            let session = &session;
            let condition = &self.condition;
            poll::poll(&self.spec, cancel, move |attempt| {
                let query = Arc::clone(&self.query);
                let params = Arc::clone(&self.params);
                async move {
                    let rows = session.query(query, params).await?;
                    let satisfied = condition.evaluate(&rows);
                    debug!(attempt, row_count = rows.len(), satisfied, "db_poll attempt completed");
                    Ok::<_, CheckError>(Evaluation {
                        satisfied,
                        detail: rows,
                    })
                }
            })
            .await
        };

        session.close().await;

        let settled = outcome.settle();
        let rows = settled.last.unwrap_or_default();
        let result = DbPollResult {
            success: settled.success,
            row_count: rows.len(),
            rows,
            attempts: settled.attempts,
            duration_ms: settled.duration_ms,
            condition_satisfied: settled.success,
            error: settled.message,
        };

        if result.success {
            info!(
                attempts = result.attempts,
                row_count = result.row_count,
                duration_ms = result.duration_ms,
                "db_poll condition satisfied"
            );
        } else {
            warn!(
                attempts = result.attempts,
                row_count = result.row_count,
                duration_ms = result.duration_ms,
                error = result.error.as_deref().unwrap_or_default(),
                "db_poll condition not satisfied"
            );
        }

        match settled.failure {
            Some(error) => Err(CheckFailure::new(result, error)),
            None => Ok(result),
        }
    }
}

/// Pause between interrupts while closing a busy connection.
const INTERRUPT_RETRY: Duration = Duration::from_millis(10);

/// An open connection owned by one poll.
struct Session {
    conn: Arc<Mutex<Option<Connection>>>,
    interrupt: InterruptHandle,
}

impl Session {
    async fn open(dsn: &str) -> Result<Self, CheckError> {
        let dsn = dsn.to_string();
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_URI
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;

        let conn = tokio::task::spawn_blocking(move || Connection::open_with_flags(&dsn, flags))
            .await
            .map_err(|err| CheckError::setup("connect", err))?
            .map_err(|err| CheckError::setup("connect", err))?;

        Ok(Self {
            interrupt: conn.get_interrupt_handle(),
            conn: Arc::new(Mutex::new(Some(conn))),
        })
    }

    async fn query(&self, sql: Arc<str>, params: Arc<[SqlValue]>) -> Result<Vec<Row>, CheckError> {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock().unwrap_or_else(PoisonError::into_inner);
            let conn = guard
                .as_ref()
                .ok_or_else(|| CheckError::Backend("database connection closed".into()))?;
            run_query(conn, &sql, &params).map_err(|err| CheckError::backend("query failed", err))
        })
        .await
        .map_err(|err| CheckError::backend("query failed", err))?
    }

    /// Interrupt any running query, wait for it to return, then close.
    /// The connection is closed when this returns.
    async fn close(self) {
        let Self { conn, interrupt } = self;
        let closed = tokio::task::spawn_blocking(move || {
            // A query that had not reached SQLite yet misses the first
            // interrupt, so keep interrupting until the lock is free.
            let mut guard = loop {
                interrupt.interrupt();
                match conn.try_lock() {
                    Ok(guard) => break guard,
                    Err(TryLockError::Poisoned(poisoned)) => break poisoned.into_inner(),
                    Err(TryLockError::WouldBlock) => std::thread::sleep(INTERRUPT_RETRY),
                }
            };
            match guard.take() {
                Some(conn) => conn.close().map_err(|(_, err)| err.to_string()),
                None => Ok(()),
            }
        })
        .await;

        match closed {
            Ok(Ok(())) => debug!("db_poll connection closed"),
            Ok(Err(err)) => warn!(error = %err, "Failed to close database connection"),
            Err(err) => warn!(error = %err, "Database close task failed"),
        }
    }
}

fn run_query(conn: &Connection, sql: &str, params: &[SqlValue]) -> rusqlite::Result<Vec<Row>> {
    let mut stmt = conn.prepare_cached(sql)?;
    let columns: Vec<String> = stmt
        .column_names()
        .into_iter()
        .map(str::to_string)
        .collect();

    let mut rows = stmt.query(params_from_iter(params.iter()))?;
    let mut decoded = Vec::new();
    while let Some(row) = rows.next()? {
        let mut out = Map::with_capacity(columns.len());
        for (idx, name) in columns.iter().enumerate() {
            out.insert(name.clone(), decode_column(row.get_ref(idx)?));
        }
        decoded.push(out);
    }
    Ok(decoded)
}

/// Convert a column value to JSON.
///
/// Blobs are decoded as JSON when possible and otherwise rendered as text.
/// Text is returned exactly as stored.
fn decode_column(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f).map_or(Value::Null, Value::Number),
        ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => serde_json::from_slice(bytes)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(bytes).into_owned())),
    }
}

/// Bind a JSON parameter. Arrays and objects are bound as JSON text.
fn to_sql_value(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or(f64::NAN)),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}
