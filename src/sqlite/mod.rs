//! SQLite driver.
//!
//! Implements the [`Driver`](crate::driver::Driver) capability on top of
//! rusqlite, so a [`ConnectionPool`](crate::pool::ConnectionPool) can run
//! against a local database file without a server.

pub mod connection;
pub mod error;
pub mod types;

#[cfg(test)]
mod tests;

pub use connection::{SqliteDriver, SqliteSession};
