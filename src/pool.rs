//! Connection pool.
//!
//! The pool keeps a FIFO set of idle connections and the bookkeeping for the
//! ones checked out, all behind one `parking_lot::Mutex`. The lock is held
//! for bookkeeping only: opening a temporary connection, the liveness check
//! and the reconnect at checkout all run outside it.
//!
//! A pool also owns the [`AsyncExecutor`] that runs fire-and-forget writes
//! on its own dedicated connection.

use std::collections::{HashMap, VecDeque};
use std::mem;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::connection::{Connection, ConnectionConfig, ConnectionId};
use crate::cursor::RowCursor;
use crate::driver::{Driver, RawResult};
use crate::error::{PoolError, Result};
use crate::executor::{
    AsyncExecutor, ExecutorSettings, ExecutorStats, OverflowPolicy, ASYNC_RECONNECT_BACKOFF,
    MAX_ASYNC_FAILURES, MAX_ASYNC_QUEUE_CAPACITY,
};

/// Smallest allowed `min_size`.
pub const MIN_POOL_SIZE: usize = 1;

/// Hard ceiling for `max_size`.
pub const MAX_POOL_SIZE: usize = 60;

// ============================================================================
// Pool Configuration
// ============================================================================

/// Pool configuration: connection settings plus sizing and async knobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Settings for every connection the pool opens
    #[serde(flatten)]
    pub connection: ConnectionConfig,
    /// Connections opened by `create`
    pub size: usize,
    pub min_size: usize,
    /// Ceiling for pooled plus temporary connections
    pub max_size: usize,
    pub async_queue_capacity: usize,
    /// Attempts before an async statement is dropped
    pub async_max_failures: u32,
    /// Pause after the async connection fails to reconnect
    pub async_reconnect_backoff_ms: u64,
    pub async_overflow: OverflowPolicy,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            size: 10,
            min_size: MIN_POOL_SIZE,
            max_size: MAX_POOL_SIZE,
            async_queue_capacity: MAX_ASYNC_QUEUE_CAPACITY,
            async_max_failures: MAX_ASYNC_FAILURES,
            async_reconnect_backoff_ms: ASYNC_RECONNECT_BACKOFF.as_millis() as u64,
            async_overflow: OverflowPolicy::Reject,
        }
    }
}

impl PoolConfig {
    pub fn new(connection: ConnectionConfig) -> Self {
        Self {
            connection,
            ..Self::default()
        }
    }

    /// Build from a connection URL with default sizing.
    pub fn from_url(url: &str) -> Result<Self> {
        Ok(Self::new(ConnectionConfig::from_url(url)?))
    }

    pub fn size(mut self, size: usize) -> Self {
        self.size = size;
        self
    }

    pub fn min_size(mut self, min: usize) -> Self {
        self.min_size = min;
        self
    }

    pub fn max_size(mut self, max: usize) -> Self {
        self.max_size = max;
        self
    }

    pub fn async_queue_capacity(mut self, capacity: usize) -> Self {
        self.async_queue_capacity = capacity;
        self
    }

    pub fn async_max_failures(mut self, failures: u32) -> Self {
        self.async_max_failures = failures;
        self
    }

    pub fn async_reconnect_backoff(mut self, backoff: Duration) -> Self {
        self.async_reconnect_backoff_ms = backoff.as_millis() as u64;
        self
    }

    pub fn async_overflow(mut self, policy: OverflowPolicy) -> Self {
        self.async_overflow = policy;
        self
    }

    /// Check `1 <= min_size <= size <= max_size <= 60` and the async knobs.
    pub fn validate(&self) -> Result<()> {
        if self.min_size < MIN_POOL_SIZE {
            return Err(PoolError::Config(format!(
                "min_size must be at least {}, got {}",
                MIN_POOL_SIZE, self.min_size
            )));
        }
        if self.max_size > MAX_POOL_SIZE {
            return Err(PoolError::Config(format!(
                "max_size must not exceed {}, got {}",
                MAX_POOL_SIZE, self.max_size
            )));
        }
        if self.size < self.min_size || self.size > self.max_size {
            return Err(PoolError::Config(format!(
                "size must be within [{}, {}], got {}",
                self.min_size, self.max_size, self.size
            )));
        }
        if self.async_queue_capacity == 0 {
            return Err(PoolError::Config(
                "async_queue_capacity must be at least 1".to_string(),
            ));
        }
        if self.async_max_failures == 0 {
            return Err(PoolError::Config(
                "async_max_failures must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    fn executor_settings(&self) -> ExecutorSettings {
        ExecutorSettings {
            connection: self.connection.clone(),
            queue_capacity: self.async_queue_capacity,
            max_failures: self.async_max_failures,
            reconnect_backoff: Duration::from_millis(self.async_reconnect_backoff_ms),
            overflow: self.async_overflow,
        }
    }
}

// ============================================================================
// Pool State
// ============================================================================

/// Lifecycle of a pool. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolLifecycle {
    Uninitialized,
    Created,
    Closed,
}

/// Point-in-time view of the pool's bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    pub state: PoolLifecycle,
    pub idle: usize,
    pub in_use: usize,
    /// Checked-out connections that are temporary
    pub temporary: usize,
}

struct PoolState {
    lifecycle: PoolLifecycle,
    config: Option<Arc<PoolConfig>>,
    idle: VecDeque<Connection>,
    /// Checked-out connections and whether each one is temporary
    in_use: HashMap<ConnectionId, bool>,
    /// Temporary connections being opened outside the lock
    reserved: usize,
}

impl PoolState {
    fn total(&self) -> usize {
        self.idle.len() + self.in_use.len() + self.reserved
    }

    fn pooled(&self) -> usize {
        self.idle.len() + self.in_use.values().filter(|temporary| !**temporary).count()
    }

    fn live_config(&self) -> Result<Arc<PoolConfig>> {
        match (&self.lifecycle, &self.config) {
            (PoolLifecycle::Created, Some(config)) => Ok(Arc::clone(config)),
            _ => Err(PoolError::Closed),
        }
    }
}

struct PoolShared {
    driver: Arc<dyn Driver>,
    state: Mutex<PoolState>,
    executor: AsyncExecutor,
}

impl PoolShared {
    /// Take a connection for a caller: the oldest idle one, or a new
    /// temporary one while below `max_size`.
    fn acquire(&self) -> Result<(Connection, Arc<PoolConfig>)> {
        let mut state = self.state.lock();
        let config = state.live_config()?;

        if let Some(conn) = state.idle.pop_front() {
            state.in_use.insert(conn.id(), false);
            return Ok((conn, config));
        }

        if state.total() >= config.max_size {
            return Err(PoolError::CapacityExceeded {
                max: config.max_size,
            });
        }
        state.reserved += 1;
        drop(state);

        let mut conn = Connection::new(Arc::clone(&self.driver), true);
        let opened = conn.open(&config.connection);

        let mut state = self.state.lock();
        state.reserved -= 1;
        opened?;
        if state.lifecycle != PoolLifecycle::Created {
            return Err(PoolError::Closed);
        }
        state.in_use.insert(conn.id(), true);
        debug!(conn = %conn.id(), in_use = state.in_use.len(), "Opened temporary connection");
        Ok((conn, config))
    }

    /// Take a connection back. Temporary connections, and any connection
    /// the pool no longer tracks, are destroyed.
    fn release(&self, conn: Connection) {
        let mut state = self.state.lock();
        let tracked = state.in_use.remove(&conn.id()).is_some();
        if tracked && !conn.is_temporary() && state.lifecycle == PoolLifecycle::Created {
            debug!(conn = %conn.id(), "Connection returned to idle");
            state.idle.push_back(conn);
            return;
        }
        drop(state);

        debug!(
            conn = %conn.id(),
            temporary = conn.is_temporary(),
            "Destroying returned connection"
        );
        drop(conn);
    }

    fn close(&self) {
        let (idle, in_use) = {
            let mut state = self.state.lock();
            if state.lifecycle != PoolLifecycle::Created {
                return;
            }
            state.lifecycle = PoolLifecycle::Closed;
            state.config = None;
            let in_use = state.in_use.len();
            state.in_use.clear();
            (mem::take(&mut state.idle), in_use)
        };

        self.executor.stop();

        let closed = idle.len();
        for mut conn in idle {
            if !conn.last_error().is_empty() {
                warn!(conn = %conn.id(), error = conn.last_error(), "Closing connection after error");
            }
            conn.close();
        }
        info!(
            closed,
            checked_out = in_use,
            driver = self.driver.name(),
            "Pool closed"
        );
    }
}

impl Drop for PoolShared {
    fn drop(&mut self) {
        self.close();
    }
}

// ============================================================================
// Pooled Connection
// ============================================================================

/// A connection checked out from the pool.
///
/// Dereferences to [`Connection`]. Dropping the guard, or passing it to
/// [`ConnectionPool::checkin`], returns the connection exactly once.
pub struct PooledConnection {
    /// The actual connection. Only `Drop` takes it, so it is `Some` for as
    /// long as the guard can be dereferenced.
    conn: Option<Connection>,
    pool: Arc<PoolShared>,
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        // `conn` is only taken in `Drop`.
        self.conn.as_ref().expect("pooled connection taken outside Drop")
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Connection {
        // `conn` is only taken in `Drop`.
        self.conn.as_mut().expect("pooled connection taken outside Drop")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn);
        }
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("PooledConnection").field(&self.conn).finish()
    }
}

// ============================================================================
// Connection Pool
// ============================================================================

/// A pool of database connections.
///
/// Cloning is cheap and every clone drives the same pool. The pool is closed
/// by [`close`](Self::close) or when the last handle and the last checked-out
/// connection are gone.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolShared>,
}

impl ConnectionPool {
    /// An uninitialized pool over `driver`. Call [`create`](Self::create) next.
    pub fn new(driver: Arc<dyn Driver>) -> Self {
        Self {
            inner: Arc::new(PoolShared {
                driver,
                state: Mutex::new(PoolState {
                    lifecycle: PoolLifecycle::Uninitialized,
                    config: None,
                    idle: VecDeque::new(),
                    in_use: HashMap::new(),
                    reserved: 0,
                }),
                executor: AsyncExecutor::new(),
            }),
        }
    }

    /// Open `size` connections and (re)start the async executor.
    pub fn create(&self, config: PoolConfig) -> Result<()> {
        self.create_with(config, true)
    }

    /// Open `size` connections; restart the async executor only if
    /// `restart_async` is set or it is not running yet.
    ///
    /// On an already created pool this stores the new configuration and tops
    /// the pooled connections up to `size`. Any failure leaves the pool
    /// untouched.
    pub fn create_with(&self, config: PoolConfig, restart_async: bool) -> Result<()> {
        config.validate()?;
        let config = Arc::new(config);

        {
            let mut state = self.inner.state.lock();
            if state.lifecycle == PoolLifecycle::Closed {
                return Err(PoolError::Closed);
            }

            let mut fresh = Vec::with_capacity(config.size.saturating_sub(state.pooled()));
            for _ in state.pooled()..config.size {
                let mut conn = Connection::new(Arc::clone(&self.inner.driver), false);
                conn.open(&config.connection)?;
                fresh.push(conn);
            }

            state.idle.extend(fresh);
            state.config = Some(Arc::clone(&config));
            state.lifecycle = PoolLifecycle::Created;
        }

        if restart_async || !self.inner.executor.is_running() {
            self.inner
                .executor
                .start(Arc::clone(&self.inner.driver), config.executor_settings())?;
        }

        info!(
            driver = self.inner.driver.name(),
            host = %config.connection.host,
            database = %config.connection.database,
            size = config.size,
            max_size = config.max_size,
            "Pool created"
        );
        Ok(())
    }

    /// Check a connection out, reconnecting it once if it turns out dead.
    pub fn checkout(&self) -> Result<PooledConnection> {
        let (mut conn, config) = self.inner.acquire()?;

        if let Err(err) = conn.ping() {
            warn!(conn = %conn.id(), error = %err, "Dead connection on checkout, reconnecting");
            if let Err(err) = conn.reconnect(&config.connection) {
                warn!(conn = %conn.id(), error = %err, "Reconnect failed");
                self.inner.release(conn);
                return Err(err);
            }
        }

        debug!(conn = %conn.id(), "Checked out");
        Ok(PooledConnection {
            conn: Some(conn),
            pool: Arc::clone(&self.inner),
        })
    }

    /// Return a checked-out connection. `None` is a no-op.
    pub fn checkin(&self, conn: impl Into<Option<PooledConnection>>) {
        drop(conn.into());
    }

    /// Stop the async executor and close every idle connection.
    ///
    /// Connections still checked out are destroyed when they come back.
    /// Safe to call repeatedly and on a pool that was never created.
    pub fn close(&self) {
        self.inner.close();
    }

    /// Run a query on a pooled connection and hand back its rows.
    pub fn query(&self, sql: &str) -> Result<RowCursor> {
        self.query_raw(sql).map(RowCursor::from)
    }

    pub fn query_raw(&self, sql: &str) -> Result<RawResult> {
        self.checkout()?.query_raw(sql)
    }

    pub fn execute_affected_rows(&self, sql: &str) -> Result<u64> {
        self.checkout()?.execute_affected_rows(sql)
    }

    pub fn execute_affected_rows_strict(&self, sql: impl AsRef<[u8]>) -> Result<u64> {
        self.checkout()?.execute_affected_rows_strict(sql)
    }

    /// Queue a statement for the async executor.
    ///
    /// Best effort: failures are retried a bounded number of times and then
    /// dropped. The caller is never told the outcome.
    pub fn submit_async(&self, sql: impl Into<String>) -> Result<()> {
        self.inner.executor.submit(sql)
    }

    pub fn status(&self) -> PoolStatus {
        let state = self.inner.state.lock();
        PoolStatus {
            state: state.lifecycle,
            idle: state.idle.len(),
            in_use: state.in_use.len(),
            temporary: state.in_use.values().filter(|temporary| **temporary).count(),
        }
    }

    /// Ids of the idle connections, next to be checked out first.
    pub fn idle_ids(&self) -> Vec<ConnectionId> {
        self.inner.state.lock().idle.iter().map(Connection::id).collect()
    }

    pub fn async_stats(&self) -> ExecutorStats {
        self.inner.executor.stats()
    }

    /// The active configuration, `None` unless created.
    pub fn config(&self) -> Option<Arc<PoolConfig>> {
        self.inner.state.lock().config.clone()
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("driver", &self.inner.driver.name())
            .field("status", &self.status())
            .finish()
    }
}
