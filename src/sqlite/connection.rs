//! SQLite driver and session.

use std::collections::HashMap;
use std::time::Duration;

use rusqlite::{params_from_iter, Connection};
use tracing::{debug, warn};

use super::error::closed;
use super::types::text_bytes;
use crate::connection::ConnectionConfig;
use crate::driver::{
    Column, Driver, DriverError, DriverResult, RawResult, Session, SessionOption,
    StatementHandle, StatementOutcome,
};
use crate::types::Value;

/// Busy timeout used when the configuration sets no connect timeout.
const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Cached compiled statements per session.
const STATEMENT_CACHE_CAPACITY: usize = 100;

/// Character sets a session accepts. SQLite text is always UTF-8.
const UTF8_CHARSETS: &[&str] = &["utf8", "utf8mb4", "utf-8"];

/// Opens SQLite sessions.
///
/// `database` in the configuration is the file path; an empty name or
/// `:memory:` opens a private in-memory database per session. Host, port and
/// credentials are ignored.
///
/// SQLite reads statement text only up to the first NUL byte, so exact-length
/// execution rejects SQL containing one. Bind such values as parameters.
#[derive(Debug, Clone, Default)]
pub struct SqliteDriver;

impl SqliteDriver {
    pub fn new() -> Self {
        Self
    }
}

impl Driver for SqliteDriver {
    fn name(&self) -> &str {
        "sqlite"
    }

    fn connect(&self, config: &ConnectionConfig) -> DriverResult<Box<dyn Session>> {
        let path = config.database.as_str();
        let is_memory = path.is_empty() || path == ":memory:";
        let conn = if is_memory {
            Connection::open_in_memory()?
        } else {
            Connection::open(path)?
        };

        conn.busy_timeout(config.connect_timeout().unwrap_or(DEFAULT_BUSY_TIMEOUT))?;
        conn.set_prepared_statement_cache_capacity(STATEMENT_CACHE_CAPACITY);

        // WAL lets the pool's readers run alongside one writer.
        if !is_memory {
            conn.execute_batch(
                "PRAGMA journal_mode=WAL;
                 PRAGMA synchronous=NORMAL;",
            )?;
        }

        debug!(path = %path, memory = is_memory, "Opened SQLite database");
        Ok(Box::new(SqliteSession::new(conn)))
    }
}

/// One open SQLite database handle.
pub struct SqliteSession {
    /// None once closed
    conn: Option<Connection>,
    /// SQL of each prepared statement, compiled through the statement cache
    statements: HashMap<u64, String>,
    next_statement: u64,
    /// Whether the caller wants autocommit; when off a transaction is always open
    autocommit: bool,
    last_error: String,
}

impl SqliteSession {
    fn new(conn: Connection) -> Self {
        Self {
            conn: Some(conn),
            statements: HashMap::new(),
            next_statement: 0,
            autocommit: true,
            last_error: String::new(),
        }
    }

    /// Run `f` on the open connection, recording the error text on failure.
    fn run<T>(&mut self, f: impl FnOnce(&Connection) -> rusqlite::Result<T>) -> DriverResult<T> {
        let result = match self.conn.as_ref() {
            Some(conn) => f(conn).map_err(DriverError::from),
            None => Err(closed()),
        };
        if let Err(err) = &result {
            self.last_error = err.message.clone();
        }
        result
    }

    /// End the open transaction with `verb`, then open the next one while
    /// autocommit is off.
    fn finish_transaction(&mut self, verb: &str) -> DriverResult<()> {
        let reopen = !self.autocommit;
        self.run(|conn| {
            if !conn.is_autocommit() {
                conn.execute_batch(verb)?;
            }
            if reopen {
                conn.execute_batch("BEGIN")?;
            }
            Ok(())
        })
    }
}

impl Session for SqliteSession {
    fn set_option(&mut self, option: &SessionOption) -> DriverResult<()> {
        match option {
            // A local file never drops the session.
            SessionOption::Reconnect(_) => Ok(()),
            SessionOption::Charset(name) => {
                if UTF8_CHARSETS.contains(&name.to_ascii_lowercase().as_str()) {
                    Ok(())
                } else {
                    let err = DriverError::new(format!("Unsupported character set: '{}'", name));
                    self.last_error = err.message.clone();
                    Err(err)
                }
            }
        }
    }

    fn query(&mut self, sql: &str) -> DriverResult<Option<RawResult>> {
        self.run(|conn| {
            let mut stmt = conn.prepare(sql)?;
            let count = stmt.column_count();
            if count == 0 {
                stmt.execute([])?;
                return Ok(None);
            }

            let columns = stmt.column_names().into_iter().map(Column::new).collect();
            let mut result = RawResult::new(columns);
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                let values = (0..count)
                    .map(|i| row.get_ref(i).map(text_bytes))
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                result.push_row(values);
            }
            Ok(Some(result))
        })
    }

    fn execute(&mut self, sql: &str) -> DriverResult<u64> {
        self.run(|conn| Ok(conn.execute(sql, [])? as u64))
    }

    fn execute_exact(&mut self, sql: &[u8]) -> DriverResult<u64> {
        if sql.contains(&0) {
            let err = DriverError::new(
                "Statement contains an embedded NUL byte, which SQLite cannot execute",
            );
            self.last_error = err.message.clone();
            return Err(err);
        }
        self.run(|conn| {
            let sql = std::str::from_utf8(sql).map_err(rusqlite::Error::Utf8Error)?;
            conn.execute_batch(sql)?;
            Ok(conn.changes() as u64)
        })
    }

    fn last_insert_id(&mut self) -> DriverResult<u64> {
        self.run(|conn| Ok(conn.last_insert_rowid().max(0) as u64))
    }

    fn set_autocommit(&mut self, enabled: bool) -> DriverResult<()> {
        self.run(|conn| {
            match (enabled, conn.is_autocommit()) {
                // Switching autocommit on commits the pending transaction.
                (true, false) => conn.execute_batch("COMMIT")?,
                (false, true) => conn.execute_batch("BEGIN")?,
                _ => {}
            }
            Ok(())
        })?;
        self.autocommit = enabled;
        Ok(())
    }

    fn commit(&mut self) -> DriverResult<()> {
        self.finish_transaction("COMMIT")
    }

    fn rollback(&mut self) -> DriverResult<()> {
        self.finish_transaction("ROLLBACK")
    }

    fn prepare(&mut self, sql: &str) -> DriverResult<StatementHandle> {
        // Compile once now so syntax errors surface here.
        self.run(|conn| conn.prepare_cached(sql).map(drop))?;
        self.next_statement += 1;
        self.statements.insert(self.next_statement, sql.to_string());
        Ok(StatementHandle(self.next_statement))
    }

    fn execute_prepared(
        &mut self,
        stmt: StatementHandle,
        params: &[Value],
    ) -> DriverResult<StatementOutcome> {
        let Some(sql) = self.statements.get(&stmt.0).cloned() else {
            let err = DriverError::new(format!("Unknown prepared statement handle {}", stmt.0));
            self.last_error = err.message.clone();
            return Err(err);
        };

        self.run(|conn| {
            let before = conn.last_insert_rowid();
            let affected = conn.prepare_cached(&sql)?.execute(params_from_iter(params))?;
            let after = conn.last_insert_rowid();
            Ok(StatementOutcome {
                affected_rows: affected as u64,
                last_insert_id: (after != before && after > 0).then_some(after as u64),
            })
        })
    }

    fn close_statement(&mut self, stmt: StatementHandle) {
        self.statements.remove(&stmt.0);
    }

    fn ping(&mut self) -> DriverResult<()> {
        self.run(|conn| conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0)).map(drop))
    }

    fn last_error(&self) -> String {
        self.last_error.clone()
    }

    fn close(&mut self) {
        self.statements.clear();
        if let Some(conn) = self.conn.take() {
            if let Err((_, err)) = conn.close() {
                warn!(error = %err, "SQLite close failed");
                self.last_error = err.to_string();
            }
        }
    }
}

impl Drop for SqliteSession {
    fn drop(&mut self) {
        self.close();
    }
}
