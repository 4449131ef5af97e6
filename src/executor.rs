//! Best-effort asynchronous write path.
//!
//! Callers hand fire-and-forget statements to [`AsyncExecutor::submit`]. One
//! dedicated worker thread owns a private [`Connection`], swaps the whole
//! pending queue out under its lock and executes the batch in submission
//! order through the length-aware send path.
//!
//! A failed statement triggers a liveness check (and a reconnect if the
//! connection is dead) and goes back to the tail of the queue. After
//! `max_failures` attempts it is dropped. Submitters never learn the outcome;
//! [`ExecutorStats`] is the only record of what ran and what was lost.

use std::collections::VecDeque;
use std::iter;
use std::mem;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::connection::{Connection, ConnectionConfig};
use crate::driver::Driver;
use crate::error::{PoolError, Result};

/// Attempts before a failing statement is dropped.
pub const MAX_ASYNC_FAILURES: u32 = 3;

/// Pending statements allowed in the queue.
pub const MAX_ASYNC_QUEUE_CAPACITY: usize = 1 << 20;

/// Pause after a failed reconnect.
pub const ASYNC_RECONNECT_BACKOFF: Duration = Duration::from_millis(100);

/// What `submit` does when the queue is at capacity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Refuse the new statement with [`PoolError::QueueFull`].
    #[default]
    Reject,
    /// Accept it and drop the oldest pending statement.
    DropOldest,
}

/// A queued statement and how often it has failed so far.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AsyncTask {
    pub sql: String,
    pub failures: u32,
}

impl AsyncTask {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            failures: 0,
        }
    }
}

/// Settings the worker runs with, derived from the pool configuration.
#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    pub connection: ConnectionConfig,
    pub queue_capacity: usize,
    pub max_failures: u32,
    pub reconnect_backoff: Duration,
    pub overflow: OverflowPolicy,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            queue_capacity: MAX_ASYNC_QUEUE_CAPACITY,
            max_failures: MAX_ASYNC_FAILURES,
            reconnect_backoff: ASYNC_RECONNECT_BACKOFF,
            overflow: OverflowPolicy::Reject,
        }
    }
}

/// Snapshot of the executor counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecutorStats {
    /// Statements accepted by `submit`
    pub submitted: u64,
    /// Statements that ran successfully
    pub executed: u64,
    /// Failed execution attempts, retries included
    pub failed_attempts: u64,
    /// Statements put back on the queue after a failure
    pub retried: u64,
    /// Statements given up on: too many failures or no room to retry
    pub dropped: u64,
    /// Statements thrown away unexecuted at shutdown
    pub discarded: u64,
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    executed: AtomicU64,
    failed_attempts: AtomicU64,
    retried: AtomicU64,
    dropped: AtomicU64,
    discarded: AtomicU64,
}

impl Counters {
    fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    fn snapshot(&self) -> ExecutorStats {
        ExecutorStats {
            submitted: self.submitted.load(Ordering::Relaxed),
            executed: self.executed.load(Ordering::Relaxed),
            failed_attempts: self.failed_attempts.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
        }
    }
}

struct TaskQueue {
    tasks: VecDeque<AsyncTask>,
    capacity: usize,
    overflow: OverflowPolicy,
}

/// State shared between submitters and the worker.
struct ExecutorShared {
    queue: Mutex<TaskQueue>,
    /// Signalled on submit and on stop
    ready: Condvar,
    /// Keeps the current worker looping; cleared to halt it
    running: AtomicBool,
    /// Whether `submit` takes statements; only `stop` clears it
    accepting: AtomicBool,
    counters: Counters,
}

impl ExecutorShared {
    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

// ============================================================================
// Executor
// ============================================================================

/// Owner of the background worker and its queue.
pub struct AsyncExecutor {
    shared: Arc<ExecutorShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Default for AsyncExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl AsyncExecutor {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(ExecutorShared {
                queue: Mutex::new(TaskQueue {
                    tasks: VecDeque::new(),
                    capacity: MAX_ASYNC_QUEUE_CAPACITY,
                    overflow: OverflowPolicy::Reject,
                }),
                ready: Condvar::new(),
                running: AtomicBool::new(false),
                accepting: AtomicBool::new(false),
                counters: Counters::default(),
            }),
            worker: Mutex::new(None),
        }
    }

    /// Open the dedicated connection and start the worker thread.
    ///
    /// A running worker keeps draining while the new connection is opened,
    /// then is halted and replaced. Statements it had not run yet, and those
    /// still queued, carry over to the new worker, and `submit` keeps
    /// accepting throughout. If the connection cannot be opened now the
    /// worker starts anyway and connects before its first statement.
    pub fn start(&self, driver: Arc<dyn Driver>, settings: ExecutorSettings) -> Result<()> {
        let mut worker = self.worker.lock();

        let mut conn = Connection::new(driver, false);
        if let Err(err) = conn.connect(&settings.connection) {
            warn!(error = %err, "Async connection unavailable, will retry on first statement");
        }

        if let Some(handle) = worker.take() {
            self.halt(handle);
        }

        {
            let mut queue = self.shared.queue.lock();
            queue.capacity = settings.queue_capacity;
            queue.overflow = settings.overflow;
            self.shared.accepting.store(true, Ordering::SeqCst);
        }

        info!(
            capacity = settings.queue_capacity,
            max_failures = settings.max_failures,
            "Async executor started"
        );

        self.shared.running.store(true, Ordering::SeqCst);
        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name("dbpool-async".to_string())
            .spawn(move || {
                Worker {
                    shared,
                    conn,
                    settings,
                }
                .run()
            })
            .map_err(|e| {
                self.shared.running.store(false, Ordering::SeqCst);
                self.shared.accepting.store(false, Ordering::SeqCst);
                PoolError::Worker(e.to_string())
            })?;

        *worker = Some(handle);
        Ok(())
    }

    /// Stop the worker, wait for it to exit, then discard whatever is still
    /// queued. Safe to call when the worker never started.
    pub fn stop(&self) {
        self.shared.accepting.store(false, Ordering::SeqCst);
        let handle = self.worker.lock().take();
        let was_running = handle.is_some();
        if let Some(handle) = handle {
            self.halt(handle);
        }

        let leftovers = mem::take(&mut self.shared.queue.lock().tasks);
        if !leftovers.is_empty() {
            Counters::add(&self.shared.counters.discarded, leftovers.len() as u64);
            warn!(discarded = leftovers.len(), "Discarding pending async statements");
        }
        if was_running {
            info!("Async executor stopped");
        }
    }

    /// Queue a statement for background execution.
    ///
    /// Never blocks on I/O. Fails with [`PoolError::Closed`] before the first
    /// `start` or after `stop`, and with [`PoolError::QueueFull`] when the
    /// queue is at capacity under [`OverflowPolicy::Reject`].
    pub fn submit(&self, sql: impl Into<String>) -> Result<()> {
        let mut queue = self.shared.queue.lock();
        if !self.shared.accepting.load(Ordering::SeqCst) {
            return Err(PoolError::Closed);
        }

        if queue.tasks.len() >= queue.capacity {
            match queue.overflow {
                OverflowPolicy::Reject => {
                    return Err(PoolError::QueueFull {
                        capacity: queue.capacity,
                    });
                }
                OverflowPolicy::DropOldest => {
                    if let Some(oldest) = queue.tasks.pop_front() {
                        Counters::add(&self.shared.counters.dropped, 1);
                        warn!(sql = %oldest.sql, "Async queue full, dropping oldest statement");
                    }
                }
            }
        }

        queue.tasks.push_back(AsyncTask::new(sql));
        Counters::add(&self.shared.counters.submitted, 1);
        drop(queue);
        self.shared.ready.notify_one();
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }

    /// Statements waiting for the worker's next pass.
    pub fn pending(&self) -> usize {
        self.shared.queue.lock().tasks.len()
    }

    pub fn stats(&self) -> ExecutorStats {
        self.shared.counters.snapshot()
    }

    fn halt(&self, handle: JoinHandle<()>) {
        {
            // Flip the flag under the queue lock so a waiting worker cannot miss it.
            let _queue = self.shared.queue.lock();
            self.shared.running.store(false, Ordering::SeqCst);
        }
        self.shared.ready.notify_all();
        if handle.join().is_err() {
            warn!("Async worker panicked");
        }
    }
}

impl Drop for AsyncExecutor {
    fn drop(&mut self) {
        self.stop();
    }
}

// ============================================================================
// Worker
// ============================================================================

struct Worker {
    shared: Arc<ExecutorShared>,
    conn: Connection,
    settings: ExecutorSettings,
}

impl Worker {
    fn run(mut self) {
        debug!(conn = %self.conn.id(), "Async worker running");

        while let Some(batch) = self.next_batch() {
            let mut batch = batch.into_iter();
            while let Some(task) = batch.next() {
                if !self.shared.is_running() {
                    self.give_back(iter::once(task).chain(batch));
                    break;
                }
                self.execute(task);
            }
        }

        self.conn.close();
        debug!("Async worker exited");
    }

    /// Block until there is work, then take the whole queue.
    /// Returns `None` once the executor is stopping.
    fn next_batch(&self) -> Option<VecDeque<AsyncTask>> {
        let mut queue = self.shared.queue.lock();
        loop {
            if !self.shared.is_running() {
                return None;
            }
            if !queue.tasks.is_empty() {
                return Some(mem::take(&mut queue.tasks));
            }
            self.shared.ready.wait(&mut queue);
        }
    }

    /// Put unrun statements back at the head of the queue, in order, for
    /// whichever worker comes next. `stop` discards them.
    fn give_back(&self, tasks: impl DoubleEndedIterator<Item = AsyncTask>) {
        let mut queue = self.shared.queue.lock();
        for task in tasks.rev() {
            queue.tasks.push_front(task);
        }
    }

    fn execute(&mut self, mut task: AsyncTask) {
        // A failed reconnect here already paid the backoff for this attempt.
        let offline = !self.conn.is_open() && !self.reconnect();

        match self.conn.execute_affected_rows_strict(task.sql.as_bytes()) {
            Ok(rows) => {
                Counters::add(&self.shared.counters.executed, 1);
                debug!(rows, "Async statement executed");
            }
            Err(err) => {
                Counters::add(&self.shared.counters.failed_attempts, 1);
                task.failures += 1;
                warn!(
                    error = %err,
                    failures = task.failures,
                    sql = %task.sql,
                    "Async statement failed"
                );

                if !offline && self.conn.ping().is_err() {
                    self.reconnect();
                }

                if task.failures < self.settings.max_failures {
                    self.requeue(task);
                } else {
                    Counters::add(&self.shared.counters.dropped, 1);
                    warn!(
                        failures = task.failures,
                        sql = %task.sql,
                        "Dropping async statement"
                    );
                }
            }
        }
    }

    /// Reopen the connection, pausing for the backoff when that fails.
    fn reconnect(&mut self) -> bool {
        match self.conn.connect(&self.settings.connection) {
            Ok(()) => true,
            Err(err) => {
                warn!(error = %err, "Async connection reconnect failed");
                self.pause(self.settings.reconnect_backoff);
                false
            }
        }
    }

    /// Sleep for `duration` unless the executor is stopped first.
    fn pause(&self, duration: Duration) {
        let deadline = Instant::now() + duration;
        let mut queue = self.shared.queue.lock();
        while self.shared.is_running() {
            if self.shared.ready.wait_until(&mut queue, deadline).timed_out() {
                break;
            }
        }
    }

    fn requeue(&self, task: AsyncTask) {
        let mut queue = self.shared.queue.lock();
        if queue.tasks.len() >= queue.capacity {
            Counters::add(&self.shared.counters.dropped, 1);
            warn!(sql = %task.sql, "Async queue full, dropping failed statement");
            return;
        }
        queue.tasks.push_back(task);
        Counters::add(&self.shared.counters.retried, 1);
    }
}
