//! Database driver capability.
//!
//! The pool never talks to a server directly. A [`Driver`] opens
//! [`Session`]s, and a session performs the wire-level work: queries,
//! length-aware execution, prepared statements, transaction control and
//! liveness checks. Any SQL client that can satisfy these traits plugs into
//! the pool unchanged.
//!
//! Query results come back fully buffered as a [`RawResult`]: column
//! metadata plus rows of text-protocol values, where `None` marks SQL NULL.

use std::sync::Arc;

use bytes::Bytes;
use smallvec::SmallVec;
use thiserror::Error;

use crate::connection::ConnectionConfig;
use crate::types::Value;

/// Failure reported by a driver, carrying the transport's error text.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct DriverError {
    pub message: String,
}

impl DriverError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

pub type DriverResult<T> = Result<T, DriverError>;

/// Session-level options applied after the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOption {
    /// Let the transport transparently reconnect a dropped session.
    Reconnect(bool),
    /// Force the session character set.
    Charset(String),
}

/// Opaque handle to a statement prepared on a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StatementHandle(pub u64);

/// What executing a prepared statement produced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatementOutcome {
    pub affected_rows: u64,
    /// Id generated by the statement, if it inserted into an auto-increment key.
    pub last_insert_id: Option<u64>,
}

/// Opens sessions to a single database server.
pub trait Driver: Send + Sync {
    /// Short driver name used in log output.
    fn name(&self) -> &str;

    /// Perform the handshake.
    ///
    /// The driver applies `connect_timeout` and `charset` from the config
    /// before connecting.
    fn connect(&self, config: &ConnectionConfig) -> DriverResult<Box<dyn Session>>;
}

/// One live session to the database server.
///
/// A session is used by one thread at a time; it only needs to be `Send`.
pub trait Session: Send {
    fn set_option(&mut self, option: &SessionOption) -> DriverResult<()>;

    /// Run a statement and buffer its result set.
    ///
    /// Returns `Ok(None)` for statements that produce no result set.
    fn query(&mut self, sql: &str) -> DriverResult<Option<RawResult>>;

    /// Run a statement through the simple send path and report affected rows.
    fn execute(&mut self, sql: &str) -> DriverResult<u64>;

    /// Run exactly `sql.len()` bytes and report affected rows.
    ///
    /// The statement may contain embedded NUL bytes.
    fn execute_exact(&mut self, sql: &[u8]) -> DriverResult<u64>;

    fn last_insert_id(&mut self) -> DriverResult<u64>;

    fn set_autocommit(&mut self, enabled: bool) -> DriverResult<()>;

    fn commit(&mut self) -> DriverResult<()>;

    fn rollback(&mut self) -> DriverResult<()>;

    fn prepare(&mut self, sql: &str) -> DriverResult<StatementHandle>;

    fn execute_prepared(
        &mut self,
        stmt: StatementHandle,
        params: &[Value],
    ) -> DriverResult<StatementOutcome>;

    fn close_statement(&mut self, stmt: StatementHandle);

    /// Liveness check. An error means the session is dead.
    fn ping(&mut self) -> DriverResult<()>;

    /// Text of the most recent transport error, empty if none.
    fn last_error(&self) -> String;

    /// Release the session. Must tolerate being called more than once.
    fn close(&mut self);
}

// ============================================================================
// Buffered results
// ============================================================================

/// Column metadata of a result set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    /// Declared type, if the server reports one.
    pub type_name: Option<String>,
}

impl Column {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_name: None,
        }
    }

    pub fn with_type(mut self, type_name: impl Into<String>) -> Self {
        self.type_name = Some(type_name.into());
        self
    }
}

/// One row of text-protocol values. Inline storage covers typical tables
/// without a heap allocation per row.
pub type RawRow = SmallVec<[Option<Bytes>; 16]>;

/// A fully buffered result set with a fetch position.
#[derive(Debug, Clone, Default)]
pub struct RawResult {
    columns: Arc<Vec<Column>>,
    rows: Vec<RawRow>,
    /// Index of the row the next fetch returns
    position: usize,
}

impl RawResult {
    pub fn new(columns: Vec<Column>) -> Self {
        Self {
            columns: Arc::new(columns),
            rows: Vec::new(),
            position: 0,
        }
    }

    /// Build a result from text rows. Handy for drivers that already hold strings.
    pub fn from_text<S: AsRef<str>>(columns: &[S], rows: Vec<Vec<Option<String>>>) -> Self {
        let mut result = Self::new(columns.iter().map(|c| Column::new(c.as_ref())).collect());
        for row in rows {
            result.push_row(row.into_iter().map(|v| v.map(Bytes::from)));
        }
        result
    }

    pub fn push_row<I>(&mut self, values: I)
    where
        I: IntoIterator<Item = Option<Bytes>>,
    {
        self.rows.push(values.into_iter().collect());
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn field_count(&self) -> usize {
        self.columns.len()
    }

    pub fn row_count(&self) -> u64 {
        self.rows.len() as u64
    }

    pub fn rows(&self) -> &[RawRow] {
        &self.rows
    }

    /// Advance the fetch position and return the row it pointed at.
    pub fn fetch_row(&mut self) -> Option<&RawRow> {
        let index = self.fetch_index()?;
        self.rows.get(index)
    }

    /// Reposition so the next fetch returns row `offset`.
    pub fn seek(&mut self, offset: u64) {
        self.position = usize::try_from(offset).unwrap_or(usize::MAX);
    }

    pub(crate) fn fetch_index(&mut self) -> Option<usize> {
        if self.position >= self.rows.len() {
            return None;
        }
        let index = self.position;
        self.position += 1;
        Some(index)
    }

    pub(crate) fn row(&self, index: usize) -> Option<&RawRow> {
        self.rows.get(index)
    }
}
