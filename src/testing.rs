//! Scriptable in-memory driver for unit tests.
//!
//! Every session shares one [`FakeState`], so a test can make the server
//! unreachable, kill live sessions, inject execution failures and then
//! inspect what actually ran.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::connection::ConnectionConfig;
use crate::driver::{
    Driver, DriverError, DriverResult, RawResult, Session, SessionOption, StatementHandle,
    StatementOutcome,
};
use crate::types::Value;

const CHARSETS: &[&str] = &["utf8", "utf8mb4", "latin1", "gbk"];

#[derive(Default)]
struct FakeState {
    reachable: AtomicBool,
    /// Sessions opened before the current generation are dead
    generation: AtomicU64,
    connect_attempts: AtomicUsize,
    connects: AtomicUsize,
    closes: AtomicUsize,
    closed_statements: AtomicUsize,
    fail_executes: AtomicUsize,
    connect_delay_ms: AtomicU64,
    execute_delay_ms: AtomicU64,
    executed: Mutex<Vec<String>>,
    options: Mutex<Vec<SessionOption>>,
    results: Mutex<HashMap<String, RawResult>>,
}

#[derive(Clone)]
pub(crate) struct FakeDriver {
    state: Arc<FakeState>,
}

impl FakeDriver {
    pub fn new() -> Self {
        let state = FakeState::default();
        state.reachable.store(true, Ordering::SeqCst);
        Self {
            state: Arc::new(state),
        }
    }

    pub fn handle(&self) -> Arc<dyn Driver> {
        Arc::new(self.clone())
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.state.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Drop every session opened so far, as a server restart would.
    pub fn kill_sessions(&self) {
        self.state.generation.fetch_add(1, Ordering::SeqCst);
    }

    pub fn fail_next_executes(&self, n: usize) {
        self.state.fail_executes.store(n, Ordering::SeqCst);
    }

    /// Make every handshake take `delay`, as a slow server would.
    pub fn set_connect_delay(&self, delay: Duration) {
        self.state
            .connect_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Make every statement take `delay`.
    pub fn set_execute_delay(&self, delay: Duration) {
        self.state
            .execute_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn add_result(&self, sql: &str, result: RawResult) {
        self.state.results.lock().insert(sql.to_string(), result);
    }

    /// Handshakes tried, successful or not.
    pub fn connect_attempts(&self) -> usize {
        self.state.connect_attempts.load(Ordering::SeqCst)
    }

    pub fn connects(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.state.closes.load(Ordering::SeqCst)
    }

    pub fn closed_statements(&self) -> usize {
        self.state.closed_statements.load(Ordering::SeqCst)
    }

    pub fn executed(&self) -> Vec<String> {
        self.state.executed.lock().clone()
    }

    pub fn options(&self) -> Vec<SessionOption> {
        self.state.options.lock().clone()
    }
}

impl Driver for FakeDriver {
    fn name(&self) -> &str {
        "fake"
    }

    fn connect(&self, config: &ConnectionConfig) -> DriverResult<Box<dyn Session>> {
        self.state.connect_attempts.fetch_add(1, Ordering::SeqCst);
        sleep_ms(&self.state.connect_delay_ms);
        if !self.state.reachable.load(Ordering::SeqCst) {
            return Err(DriverError::new(format!(
                "Can't connect to server on '{}'",
                config.host
            )));
        }
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeSession {
            state: Arc::clone(&self.state),
            generation: self.state.generation.load(Ordering::SeqCst),
            closed: false,
            statements: HashMap::new(),
            next_statement: 0,
            last_insert_id: 0,
            last_error: String::new(),
        }))
    }
}

struct FakeSession {
    state: Arc<FakeState>,
    generation: u64,
    closed: bool,
    statements: HashMap<u64, String>,
    next_statement: u64,
    last_insert_id: u64,
    last_error: String,
}

impl FakeSession {
    fn check_alive(&mut self) -> DriverResult<()> {
        let alive = !self.closed
            && self.state.reachable.load(Ordering::SeqCst)
            && self.generation == self.state.generation.load(Ordering::SeqCst);
        if alive {
            Ok(())
        } else {
            Err(self.fail("MySQL server has gone away"))
        }
    }

    fn fail(&mut self, message: &str) -> DriverError {
        self.last_error = message.to_string();
        DriverError::new(message)
    }

    fn log(&self, entry: String) {
        self.state.executed.lock().push(entry);
    }

    fn run(&mut self, sql: String) -> DriverResult<u64> {
        self.check_alive()?;
        sleep_ms(&self.state.execute_delay_ms);
        let injected = self
            .state
            .fail_executes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(self.fail("Deadlock found when trying to get lock"));
        }
        self.log(sql);
        Ok(1)
    }
}

impl Session for FakeSession {
    fn set_option(&mut self, option: &SessionOption) -> DriverResult<()> {
        if let SessionOption::Charset(name) = option {
            if !CHARSETS.contains(&name.as_str()) {
                return Err(self.fail(&format!("Unknown character set: '{}'", name)));
            }
        }
        self.state.options.lock().push(option.clone());
        Ok(())
    }

    fn query(&mut self, sql: &str) -> DriverResult<Option<RawResult>> {
        self.check_alive()?;
        Ok(self.state.results.lock().get(sql).cloned())
    }

    fn execute(&mut self, sql: &str) -> DriverResult<u64> {
        self.run(sql.to_string())
    }

    fn execute_exact(&mut self, sql: &[u8]) -> DriverResult<u64> {
        self.run(String::from_utf8_lossy(sql).into_owned())
    }

    fn last_insert_id(&mut self) -> DriverResult<u64> {
        self.check_alive()?;
        Ok(self.last_insert_id)
    }

    fn set_autocommit(&mut self, enabled: bool) -> DriverResult<()> {
        self.check_alive()?;
        self.log(format!("SET autocommit={}", u8::from(enabled)));
        Ok(())
    }

    fn commit(&mut self) -> DriverResult<()> {
        self.check_alive()?;
        self.log("COMMIT".to_string());
        Ok(())
    }

    fn rollback(&mut self) -> DriverResult<()> {
        self.check_alive()?;
        self.log("ROLLBACK".to_string());
        Ok(())
    }

    fn prepare(&mut self, sql: &str) -> DriverResult<StatementHandle> {
        self.check_alive()?;
        if sql.contains("SYNTAX ERROR") {
            return Err(self.fail("You have an error in your SQL syntax"));
        }
        self.next_statement += 1;
        self.statements.insert(self.next_statement, sql.to_string());
        Ok(StatementHandle(self.next_statement))
    }

    fn execute_prepared(
        &mut self,
        stmt: StatementHandle,
        params: &[Value],
    ) -> DriverResult<StatementOutcome> {
        self.check_alive()?;
        let Some(sql) = self.statements.get(&stmt.0).cloned() else {
            return Err(self.fail("Unknown prepared statement handler"));
        };
        self.log(format!("{} {:?}", sql, params));
        self.last_insert_id += 1;
        Ok(StatementOutcome {
            affected_rows: 1,
            last_insert_id: Some(self.last_insert_id),
        })
    }

    fn close_statement(&mut self, stmt: StatementHandle) {
        if self.statements.remove(&stmt.0).is_some() {
            self.state.closed_statements.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn ping(&mut self) -> DriverResult<()> {
        self.check_alive()
    }

    fn last_error(&self) -> String {
        self.last_error.clone()
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.state.closes.fetch_add(1, Ordering::SeqCst);
        }
    }
}

fn sleep_ms(delay: &AtomicU64) {
    let ms = delay.load(Ordering::SeqCst);
    if ms > 0 {
        std::thread::sleep(Duration::from_millis(ms));
    }
}

/// Poll `cond` until it holds or `timeout` passes.
pub(crate) fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    cond()
}
