mod common;

use std::path::Path;
use std::time::{Duration, Instant};

use common::init_test_logging;
use rusqlite::Connection;
use serde_json::{Value, json};
use settle_common::CheckError;
use settle_common::action::{Action, DbPollAction};
use settle_common::db_poll::{DbPollConfig, DbPoller};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use tracing::info;

fn seed(dir: &TempDir, rows: &[(&str, Option<&str>)]) -> String {
    let path = dir.path().join("orders.db");
    let conn = Connection::open(&path).expect("create database");
    conn.execute_batch(
        "CREATE TABLE orders (
            id INTEGER PRIMARY KEY,
            status TEXT NOT NULL,
            shipped_at TEXT,
            payload TEXT
        );",
    )
    .expect("create table");
    for (status, shipped_at) in rows {
        insert(&path, status, *shipped_at);
    }
    path.to_string_lossy().into_owned()
}

fn insert(path: &Path, status: &str, shipped_at: Option<&str>) {
    let conn = Connection::open(path).expect("open database");
    conn.execute(
        "INSERT INTO orders (status, shipped_at, payload) VALUES (?1, ?2, ?3)",
        rusqlite::params![status, shipped_at, r#"{"source":"test"}"#],
    )
    .expect("insert row");
}

fn poller(dsn: &str, extra: Value) -> DbPoller {
    let mut config = json!({
        "dsn": dsn,
        "query": "SELECT id, status, shipped_at, payload FROM orders ORDER BY id",
        "interval": "20ms",
        "timeout": "5s"
    });
    if let (Some(base), Some(extra)) = (config.as_object_mut(), extra.as_object()) {
        base.extend(extra.clone());
    }
    DbPoller::new(DbPollConfig::from_value(&config).expect("decode")).expect("validate")
}

#[tokio::test]
async fn test_row_count_not_satisfied_with_two_rows() {
    init_test_logging();
    info!(test = "test_row_count_not_satisfied_with_two_rows", phase = "setup");

    let dir = TempDir::new().expect("tempdir");
    let dsn = seed(&dir, &[("pending", None), ("pending", None)]);
    let poller = poller(
        &dsn,
        json!({"max_attempts": 3, "condition": {"type": "row_count", "min_count": 3}}),
    );

    info!(test = "test_row_count_not_satisfied_with_two_rows", phase = "execute");
    let result = poller
        .poll(&CancellationToken::new())
        .await
        .expect("exhaustion is not an error");

    info!(
        test = "test_row_count_not_satisfied_with_two_rows",
        phase = "assert",
        attempts = result.attempts,
        row_count = result.row_count
    );
    assert!(!result.success);
    assert!(!result.condition_satisfied);
    assert_eq!(result.attempts, 3);
    assert_eq!(result.row_count, 2);
    assert_eq!(result.rows.len(), 2);
    assert_eq!(result.error.as_deref(), Some("max attempts reached"));
}

#[tokio::test]
async fn test_row_count_satisfied_with_three_rows() {
    init_test_logging();

    let dir = TempDir::new().expect("tempdir");
    let dsn = seed(&dir, &[("pending", None), ("pending", None), ("paid", None)]);
    let poller = poller(&dsn, json!({"condition": {"type": "row_count", "min_count": 3}}));

    let result = poller
        .poll(&CancellationToken::new())
        .await
        .expect("poll should complete");

    assert!(result.success);
    assert!(result.condition_satisfied);
    assert_eq!(result.attempts, 1);
    assert_eq!(result.row_count, 3);
    assert_eq!(result.rows[2]["status"], json!("paid"));
    assert_eq!(result.rows[0]["payload"], json!(r#"{"source":"test"}"#));
    assert_eq!(result.rows[0]["shipped_at"], Value::Null);
}

#[tokio::test]
async fn test_condition_becomes_true_while_polling() {
    init_test_logging();

    let dir = TempDir::new().expect("tempdir");
    let dsn = seed(&dir, &[("pending", None)]);
    let poller = poller(
        &dsn,
        json!({
            "query": "SELECT id, shipped_at FROM orders WHERE status = ?",
            "params": ["shipped"],
            "condition": {"type": "value_not_null", "column": "shipped_at"}
        }),
    );

    let writer_path = dir.path().join("orders.db");
    let writer = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(150)).await;
        tokio::task::spawn_blocking(move || insert(&writer_path, "shipped", Some("2026-10-18T12:00:00Z")))
            .await
            .expect("writer");
    });

    let result = poller
        .poll(&CancellationToken::new())
        .await
        .expect("poll should complete");
    writer.await.expect("writer task");

    assert!(result.success);
    assert!(result.attempts > 1);
    assert_eq!(result.row_count, 1);
    assert_eq!(result.rows[0]["shipped_at"], json!("2026-10-18T12:00:00Z"));
}

#[tokio::test]
async fn test_value_equals_string_compares_integers() {
    init_test_logging();

    let dir = TempDir::new().expect("tempdir");
    let dsn = seed(&dir, &[("pending", None), ("paid", None)]);
    let poller = poller(
        &dsn,
        json!({"condition": {"type": "value_equals", "column": "id", "value": "2"}}),
    );

    let result = poller
        .poll(&CancellationToken::new())
        .await
        .expect("poll should complete");
    assert!(result.success);
}

#[tokio::test]
async fn test_malformed_query_is_a_hard_error() {
    init_test_logging();

    let dir = TempDir::new().expect("tempdir");
    let dsn = seed(&dir, &[]);
    let poller = poller(&dsn, json!({"query": "SELEC id FROM orders"}));

    let failure = poller
        .poll(&CancellationToken::new())
        .await
        .expect_err("syntax errors never succeed");

    assert!(matches!(failure.error, CheckError::Backend(_)));
    assert_eq!(failure.result.attempts, 1);
    assert!(!failure.result.success);
    let message = failure.result.error.as_deref().expect("error message");
    assert!(message.starts_with("query failed:"), "got {message}");
}

#[tokio::test]
async fn test_missing_database_is_a_setup_error() {
    init_test_logging();

    let dir = TempDir::new().expect("tempdir");
    let dsn = dir.path().join("absent.db").to_string_lossy().into_owned();
    let poller = poller(&dsn, json!({}));

    let failure = poller
        .poll(&CancellationToken::new())
        .await
        .expect_err("missing database");

    assert!(matches!(failure.error, CheckError::Setup { what: "connect", .. }));
    assert_eq!(failure.result.attempts, 0);
    assert!(
        failure
            .result
            .error
            .as_deref()
            .is_some_and(|m| m.starts_with("failed to connect"))
    );
    assert!(!dir.path().join("absent.db").exists());
}

#[tokio::test]
async fn test_timeout_keeps_last_rows() {
    init_test_logging();

    let dir = TempDir::new().expect("tempdir");
    let dsn = seed(&dir, &[("pending", None)]);
    let poller = poller(
        &dsn,
        json!({
            "timeout": "200ms",
            "condition": {"type": "value_equals", "column": "status", "value": "shipped"}
        }),
    );

    let result = poller
        .poll(&CancellationToken::new())
        .await
        .expect("timeout is not an error");

    assert!(!result.success);
    assert_eq!(result.error.as_deref(), Some("timeout waiting for condition"));
    assert_eq!(result.row_count, 1);
    assert_eq!(result.rows[0]["status"], json!("pending"));
}

#[tokio::test]
async fn test_action_output_includes_first_row() {
    init_test_logging();

    let dir = TempDir::new().expect("tempdir");
    let dsn = seed(&dir, &[("paid", None)]);

    let output = DbPollAction
        .execute(
            &CancellationToken::new(),
            &json!({
                "connection": dsn,
                "query": "SELECT id, status FROM orders",
                "interval": "20ms"
            }),
        )
        .await
        .expect("db_poll action");

    assert_eq!(output["success"], json!(true));
    assert_eq!(output["row_count"], json!(1));
    assert_eq!(output["first_row"], json!({"id": 1, "status": "paid"}));
    assert!(!output.contains_key("error"));
}

#[tokio::test]
async fn test_value_equals_compares_json_text_as_stored() {
    init_test_logging();

    let dir = TempDir::new().expect("tempdir");
    let dsn = seed(&dir, &[]);
    let stored = r#"{ "source" : "import",  "batch": [1, 2] }"#;
    Connection::open(&dsn)
        .expect("open database")
        .execute(
            "INSERT INTO orders (status, payload) VALUES ('new', ?1)",
            [stored],
        )
        .expect("insert row");

    let poller = poller(
        &dsn,
        json!({
            "max_attempts": 1,
            "condition": {"type": "value_equals", "column": "payload", "value": stored}
        }),
    );
    let result = poller
        .poll(&CancellationToken::new())
        .await
        .expect("poll should complete");

    assert!(result.success);
    assert_eq!(result.rows[0]["payload"], json!(stored));
}

#[tokio::test]
async fn test_json_blob_columns_are_decoded() {
    init_test_logging();

    let dir = TempDir::new().expect("tempdir");
    let dsn = seed(&dir, &[]);
    let poller = poller(
        &dsn,
        json!({"query": "SELECT CAST('{\"id\": 3}' AS BLOB) AS doc", "max_attempts": 1}),
    );
    let result = poller
        .poll(&CancellationToken::new())
        .await
        .expect("poll should complete");

    assert_eq!(result.rows[0]["doc"], json!({"id": 3}));
}

#[tokio::test]
async fn test_cancel_interrupts_running_query_and_releases_database() {
    init_test_logging();
    info!(test = "test_cancel_interrupts_running_query_and_releases_database", phase = "setup");

    let dir = TempDir::new().expect("tempdir");
    let dsn = seed(&dir, &[("new", None)]);
    // Never finishes on its own: an unbounded recursive CTE joined with a table.
    let poller = poller(
        &dsn,
        json!({
            "query": "WITH RECURSIVE n(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM n) \
                      SELECT count(*) AS c FROM n, orders",
            "timeout": "30s"
        }),
    );

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        trigger.cancel();
    });

    info!(test = "test_cancel_interrupts_running_query_and_releases_database", phase = "execute");
    let started = Instant::now();
    let failure = poller.poll(&cancel).await.expect_err("cancel should fail");
    let elapsed = started.elapsed();

    info!(
        test = "test_cancel_interrupts_running_query_and_releases_database",
        phase = "assert",
        elapsed_ms = elapsed.as_millis() as u64
    );
    assert!(matches!(failure.error, CheckError::Cancelled));
    assert_eq!(failure.result.attempts, 0);
    assert!(elapsed < Duration::from_secs(3), "took {elapsed:?}");

    let conn = Connection::open(&dsn).expect("reopen database");
    conn.busy_timeout(Duration::ZERO).expect("busy timeout");
    conn.execute_batch("BEGIN EXCLUSIVE; COMMIT;")
        .expect("no lock should remain after the poll returns");
}
