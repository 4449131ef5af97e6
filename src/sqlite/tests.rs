//! Tests for the SQLite driver, run through `Connection` and `ConnectionPool`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{NaiveDate, NaiveDateTime};
use tempfile::TempDir;

use super::*;
use crate::connection::{Connection, ConnectionConfig};
use crate::driver::Driver;
use crate::error::PoolError;
use crate::pool::{ConnectionPool, PoolConfig};
use crate::types::Value;

fn driver() -> Arc<dyn Driver> {
    Arc::new(SqliteDriver::new())
}

fn memory() -> Connection {
    let mut conn = Connection::new(driver(), false);
    conn.connect(&ConnectionConfig::new().database(":memory:"))
        .unwrap();
    conn.execute_affected_rows(
        "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT, score REAL, joined TEXT)",
    )
    .unwrap();
    conn
}

fn file_config(dir: &TempDir) -> ConnectionConfig {
    let path = dir.path().join("app.db");
    ConnectionConfig::new().database(path.to_string_lossy())
}

#[test]
fn test_execute_and_query() {
    let mut conn = memory();
    assert_eq!(
        conn.execute_affected_rows(
            "INSERT INTO users (name, score) VALUES ('alice', 9.5), ('bob', NULL)"
        )
        .unwrap(),
        2
    );

    let cursor = conn
        .execute_query("SELECT id, name, score FROM users ORDER BY id")
        .unwrap();
    assert_eq!(cursor.row_count().unwrap(), 2);
    assert_eq!(cursor.field_names(), vec!["id", "name", "score"]);

    cursor.next_row().unwrap();
    assert_eq!(cursor.get_field::<i64, _>("id").unwrap(), 1);
    assert_eq!(cursor.get_field::<String, _>("name").unwrap(), "alice");
    assert_eq!(cursor.get_field::<f64, _>("score").unwrap(), 9.5);

    cursor.next_row().unwrap();
    assert!(cursor.is_null("score").unwrap());
    assert_eq!(cursor.next_row(), Err(PoolError::EndOfRows));
}

#[test]
fn test_query_without_result_set() {
    let mut conn = memory();
    assert!(matches!(
        conn.execute_query("CREATE TABLE other (x INTEGER)"),
        Err(PoolError::NoResultSet)
    ));
    // The statement still ran.
    assert!(conn.execute_affected_rows("INSERT INTO other VALUES (1)").is_ok());
}

#[test]
fn test_syntax_error_is_transport_error() {
    let mut conn = memory();
    let err = conn.execute_affected_rows("INSRT INTO users").unwrap_err();
    assert!(matches!(err, PoolError::Transport { op: "execute", .. }));
    assert!(conn.last_error().contains("syntax error"));
}

#[test]
fn test_strict_execute_runs_batch() {
    let mut conn = memory();
    let changed = conn
        .execute_affected_rows_strict(
            "INSERT INTO users (name) VALUES ('a'); UPDATE users SET score = 1 WHERE name = 'a'",
        )
        .unwrap();
    assert_eq!(changed, 1);

    let err = conn
        .execute_affected_rows_strict([b'S', b'E', 0xff, 0xfe])
        .unwrap_err();
    assert!(err.is_transport());
}

#[test]
fn test_strict_execute_rejects_nul_byte() {
    let mut conn = memory();
    let err = conn
        .execute_affected_rows_strict(&b"INSERT INTO users (name) VALUES ('a\0b')"[..])
        .unwrap_err();
    assert!(matches!(err, PoolError::Transport { op: "execute_exact", .. }));
    assert!(conn.last_error().contains("NUL"));

    // Nothing ran and the session stays usable.
    let cursor = conn.execute_query("SELECT COUNT(*) AS n FROM users").unwrap();
    cursor.next_row().unwrap();
    assert_eq!(cursor.get_field::<u64, _>("n").unwrap(), 0);
}

#[test]
fn test_charset_must_be_utf8() {
    let mut conn = Connection::new(driver(), false);
    assert!(conn.connect(&ConnectionConfig::new().charset("UTF8MB4")).is_ok());

    let err = conn
        .connect(&ConnectionConfig::new().charset("latin1"))
        .unwrap_err();
    assert!(matches!(err, PoolError::Transport { op: "set_option", .. }));
    assert!(!conn.is_open());
}

#[test]
fn test_unopenable_path_fails() {
    let mut conn = Connection::new(driver(), false);
    let err = conn
        .connect(&ConnectionConfig::new().database("/nonexistent-dir/deeper/app.db"))
        .unwrap_err();
    assert!(matches!(err, PoolError::Transport { op: "connect", .. }));
}

#[test]
fn test_prepared_statement() {
    let mut conn = memory();
    conn.prepare("INSERT INTO users (name, score, joined) VALUES (?, ?, ?)")
        .unwrap();

    let joined = NaiveDate::from_ymd_opt(2021, 3, 31)
        .unwrap()
        .and_hms_opt(8, 30, 0)
        .unwrap();
    let first = conn
        .execute_prepared(&[Value::from("carol"), Value::from(7.25), Value::from(joined)])
        .unwrap();
    let second = conn
        .execute_prepared(&[Value::from("dave"), Value::Null, Value::Null])
        .unwrap();
    assert_eq!(first, Some(1));
    assert_eq!(second, Some(2));
    assert_eq!(conn.last_insert_id().unwrap(), 2);

    let cursor = conn
        .execute_query("SELECT joined FROM users WHERE name = 'carol'")
        .unwrap();
    cursor.next_row().unwrap();
    assert_eq!(cursor.get_field::<NaiveDateTime, _>(0usize).unwrap(), joined);

    assert!(conn.prepare("SELEKT nothing").is_err());
    assert!(!conn.has_statement());
}

#[test]
fn test_update_reports_no_insert_id() {
    let mut conn = memory();
    conn.execute_affected_rows("INSERT INTO users (name) VALUES ('a')")
        .unwrap();
    conn.prepare("UPDATE users SET score = ? WHERE name = ?")
        .unwrap();
    assert_eq!(
        conn.execute_prepared(&[Value::from(3), Value::from("a")])
            .unwrap(),
        None
    );
}

#[test]
fn test_transactions() {
    let mut conn = memory();
    conn.set_autocommit(false).unwrap();

    conn.execute_affected_rows("INSERT INTO users (name) VALUES ('gone')")
        .unwrap();
    conn.roll_back().unwrap();

    conn.execute_affected_rows("INSERT INTO users (name) VALUES ('kept')")
        .unwrap();
    conn.commit().unwrap();
    conn.set_autocommit(true).unwrap();

    let cursor = conn.execute_query("SELECT name FROM users").unwrap();
    assert_eq!(cursor.row_count().unwrap(), 1);
    cursor.next_row().unwrap();
    assert_eq!(cursor.get_field::<String, _>("name").unwrap(), "kept");
}

#[test]
fn test_ping_and_close() {
    let mut conn = memory();
    assert!(conn.ping().is_ok());
    conn.close();
    assert_eq!(conn.ping(), Err(PoolError::NotConnected));
}

#[test]
fn test_pool_over_file_database() {
    let dir = TempDir::new().unwrap();
    let pool = ConnectionPool::new(driver());
    pool.create(PoolConfig::new(file_config(&dir)).size(2).max_size(4))
        .unwrap();

    pool.execute_affected_rows("CREATE TABLE events (id INTEGER PRIMARY KEY, kind TEXT)")
        .unwrap();
    {
        let mut a = pool.checkout().unwrap();
        let mut b = pool.checkout().unwrap();
        a.execute_affected_rows("INSERT INTO events (kind) VALUES ('a')")
            .unwrap();
        b.execute_affected_rows("INSERT INTO events (kind) VALUES ('b')")
            .unwrap();
    }

    for i in 0..10 {
        pool.submit_async(format!("INSERT INTO events (kind) VALUES ('async-{}')", i))
            .unwrap();
    }
    let deadline = Instant::now() + Duration::from_secs(5);
    while pool.async_stats().executed < 10 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(pool.async_stats().executed, 10);

    let mut cursor = pool.query("SELECT COUNT(*) AS n FROM events").unwrap();
    cursor.next_row().unwrap();
    assert_eq!(cursor.get_field::<u64, _>("n").unwrap(), 12);

    pool.close();
    assert_eq!(pool.status().idle, 0);
}
