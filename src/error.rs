//! Error types for the connection pool.
//!
//! Every fallible operation reports through [`PoolError`]; nothing in the
//! library panics on a driver failure.

use thiserror::Error;

use crate::driver::DriverError;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PoolError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Not connected to database")]
    NotConnected,

    #[error("Failed to call {op}, last_error={message}")]
    Transport { op: &'static str, message: String },

    #[error("The count of db connections is beyond the max capacity ({max})")]
    CapacityExceeded { max: usize },

    #[error("Failed to find field: {0}")]
    UnknownField(String),

    #[error("Async queue is full ({capacity} pending statements)")]
    QueueFull { capacity: usize },

    #[error("Statement returned no result set")]
    NoResultSet,

    #[error("No more rows")]
    EndOfRows,

    #[error("No current row, call next_row first")]
    NoCurrentRow,

    #[error("Row cursor is not bound to a result")]
    NotBound,

    #[error("Field index {index} is out of range ({count} fields)")]
    FieldIndex { index: usize, count: usize },

    #[error("Type conversion error: {0}")]
    Conversion(String),

    #[error("No prepared statement on this connection")]
    NoStatement,

    #[error("Pool is not created or already closed")]
    Closed,

    #[error("Async worker error: {0}")]
    Worker(String),
}

impl PoolError {
    /// Wrap a driver failure with the name of the operation that raised it.
    pub fn transport(op: &'static str, err: DriverError) -> Self {
        PoolError::Transport {
            op,
            message: err.message,
        }
    }

    /// Whether this error came from the database transport.
    pub fn is_transport(&self) -> bool {
        matches!(self, PoolError::Transport { .. })
    }
}

pub type Result<T> = std::result::Result<T, PoolError>;
