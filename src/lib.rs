//! dbpool - a synchronous relational-database connection pool.
//!
//! A [`ConnectionPool`] keeps a bounded set of live connections, hands them
//! out under mutual exclusion and recycles them, replacing dead ones on
//! checkout. Next to it runs a best-effort asynchronous write path: a single
//! background worker that drains fire-and-forget statements with bounded
//! retry.
//!
//! The wire protocol is pluggable through the [`Driver`] and [`Session`]
//! traits. A SQLite driver ships behind the `sqlite` feature.
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use dbpool::{ConnectionConfig, ConnectionPool, PoolConfig};
//! use dbpool::sqlite::SqliteDriver;
//!
//! let pool = ConnectionPool::new(Arc::new(SqliteDriver::new()));
//! pool.create(PoolConfig::new(ConnectionConfig::new().database("app.db")).size(4))?;
//!
//! let mut cursor = pool.query("SELECT id, name FROM users")?;
//! while cursor.next_row().is_ok() {
//!     let name: String = cursor.get_field("name")?;
//! }
//!
//! pool.submit_async("UPDATE stats SET hits = hits + 1")?;
//! pool.close();
//! ```

pub mod connection;
pub mod cursor;
pub mod driver;
pub mod error;
pub mod executor;
pub mod pool;
pub mod types;

#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(test)]
mod testing;

pub use connection::{Connection, ConnectionConfig, ConnectionId};
pub use cursor::{FieldKey, RowCursor};
pub use driver::{
    Column, Driver, DriverError, DriverResult, RawResult, RawRow, Session, SessionOption,
    StatementHandle, StatementOutcome,
};
pub use error::{PoolError, Result};
pub use executor::{AsyncExecutor, AsyncTask, ExecutorStats, OverflowPolicy};
pub use pool::{ConnectionPool, PoolConfig, PoolLifecycle, PoolStatus, PooledConnection};
pub use types::{FromField, Value};
