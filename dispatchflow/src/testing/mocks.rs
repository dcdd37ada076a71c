//! Mock actions, connections, diagnostics and protocols.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::action::{Action, ActionBase};
use crate::connection::{Connection, SharedConnection};
use crate::diagnostics::Diagnostic;
use crate::errors::{Failure, FailureKind, Result};
use crate::job::JobContext;
use crate::protocols::Protocol;
use crate::timeout::Deadline;

fn mock_base(name: &str) -> ActionBase {
    ActionBase::new(name, format!("mock {name}"), format!("mock action {name}")).with_section("test")
}

/// Shared counters a test keeps after handing the action to a pipeline.
#[derive(Debug, Default)]
pub struct ActionProbe {
    runs: Mutex<u32>,
    cleanups: Mutex<u32>,
    cleanup_connections: Mutex<Vec<Option<String>>>,
    run_connections: Mutex<Vec<Option<String>>>,
    events: Mutex<Vec<String>>,
}

impl ActionProbe {
    /// Creates a probe.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Returns how many times `run` was called.
    #[must_use]
    pub fn runs(&self) -> u32 {
        *self.runs.lock()
    }

    /// Returns how many times `cleanup` was called.
    #[must_use]
    pub fn cleanups(&self) -> u32 {
        *self.cleanups.lock()
    }

    /// Returns the name of the connection each `cleanup` received.
    #[must_use]
    pub fn cleanup_connections(&self) -> Vec<Option<String>> {
        self.cleanup_connections.lock().clone()
    }

    /// Returns the name of the connection each `run` received.
    #[must_use]
    pub fn run_connections(&self) -> Vec<Option<String>> {
        self.run_connections.lock().clone()
    }

    /// Returns `run:<name>` and `cleanup:<name>` entries in call order.
    #[must_use]
    pub fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }

    fn record_run(&self, name: &str, connection: Option<&SharedConnection>) -> u32 {
        self.run_connections
            .lock()
            .push(connection.map(|c| c.name().to_string()));
        self.events.lock().push(format!("run:{name}"));
        let mut runs = self.runs.lock();
        *runs += 1;
        *runs
    }

    fn record_cleanup(&self, name: &str, connection: Option<&SharedConnection>) {
        self.cleanup_connections
            .lock()
            .push(connection.map(|c| c.name().to_string()));
        self.events.lock().push(format!("cleanup:{name}"));
        *self.cleanups.lock() += 1;
    }
}

macro_rules! probed_action {
    ($ty:ident, $kind:literal) => {
        #[async_trait]
        impl Action for $ty {
            fn base(&self) -> &ActionBase {
                &self.base
            }

            fn base_mut(&mut self) -> &mut ActionBase {
                &mut self.base
            }

            fn kind(&self) -> &'static str {
                $kind
            }

            async fn run(
                &mut self,
                connection: Option<SharedConnection>,
                max_end_time: Deadline,
            ) -> Result<Option<SharedConnection>> {
                let attempt = self.probe.record_run(self.base.name(), connection.as_ref());
                self.act(attempt, connection, max_end_time).await
            }

            async fn cleanup(&mut self, connection: Option<SharedConnection>) -> Result<()> {
                self.probe.record_cleanup(self.base.name(), connection.as_ref());
                self.base.cleanup_default(connection).await
            }
        }
    };
}

/// Succeeds, optionally handing on a new connection.
#[derive(Debug)]
pub struct SucceedingAction {
    base: ActionBase,
    probe: Arc<ActionProbe>,
    returns: Option<SharedConnection>,
}

impl SucceedingAction {
    /// Creates the action.
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            base: mock_base(name),
            probe: ActionProbe::new(),
            returns: None,
        }
    }

    /// Reports calls to `probe`.
    #[must_use]
    pub fn with_probe(mut self, probe: Arc<ActionProbe>) -> Self {
        self.probe = probe;
        self
    }

    /// Returns `connection` from `run`.
    #[must_use]
    pub fn returning(mut self, connection: SharedConnection) -> Self {
        self.returns = Some(connection);
        self
    }

    async fn act(
        &mut self,
        _attempt: u32,
        connection: Option<SharedConnection>,
        _max_end_time: Deadline,
    ) -> Result<Option<SharedConnection>> {
        self.base.set_result("success", json!(self.base.name()));
        Ok(self.returns.clone().or(connection))
    }
}

probed_action!(SucceedingAction, "succeeding");

/// Always fails with a given kind, optionally raising a diagnostic trigger.
#[derive(Debug)]
pub struct FailingAction {
    base: ActionBase,
    probe: Arc<ActionProbe>,
    failure: FailureKind,
    trigger: Option<String>,
}

impl FailingAction {
    /// Creates the action.
    #[must_use]
    pub fn new(name: &str, failure: FailureKind) -> Self {
        Self {
            base: mock_base(name),
            probe: ActionProbe::new(),
            failure,
            trigger: None,
        }
    }

    /// Reports calls to `probe`.
    #[must_use]
    pub fn with_probe(mut self, probe: Arc<ActionProbe>) -> Self {
        self.probe = probe;
        self
    }

    /// Raises `trigger` before failing.
    #[must_use]
    pub fn with_trigger(mut self, trigger: impl Into<String>) -> Self {
        self.trigger = Some(trigger.into());
        self
    }

    async fn act(
        &mut self,
        _attempt: u32,
        _connection: Option<SharedConnection>,
        _max_end_time: Deadline,
    ) -> Result<Option<SharedConnection>> {
        if let Some(ref trigger) = self.trigger {
            self.base.job()?.add_trigger(trigger.clone());
        }
        Err(Failure::new(self.failure, format!("{} failed", self.base.name())))
    }
}

probed_action!(FailingAction, "failing");

/// Fails on chosen attempts with an infrastructure failure.
#[derive(Debug)]
pub struct FlakyAction {
    base: ActionBase,
    probe: Arc<ActionProbe>,
    failing: Vec<u32>,
}

impl FlakyAction {
    /// Fails the first `failures` runs, then succeeds.
    #[must_use]
    pub fn new(name: &str, failures: u32) -> Self {
        Self::failing_on(name, (1..=failures).collect())
    }

    /// Fails on the listed 1-based attempts.
    #[must_use]
    pub fn failing_on(name: &str, attempts: Vec<u32>) -> Self {
        Self {
            base: mock_base(name),
            probe: ActionProbe::new(),
            failing: attempts,
        }
    }

    /// Reports calls to `probe`.
    #[must_use]
    pub fn with_probe(mut self, probe: Arc<ActionProbe>) -> Self {
        self.probe = probe;
        self
    }

    async fn act(
        &mut self,
        attempt: u32,
        connection: Option<SharedConnection>,
        _max_end_time: Deadline,
    ) -> Result<Option<SharedConnection>> {
        if self.failing.contains(&attempt) {
            return Err(Failure::infrastructure(format!(
                "{} failed on attempt {attempt}",
                self.base.name()
            )));
        }
        self.base.set_result("attempt", json!(attempt));
        Ok(connection)
    }
}

probed_action!(FlakyAction, "flaky");

/// Sleeps before succeeding; a deadline shorter than the delay stops it.
#[derive(Debug)]
pub struct SlowAction {
    base: ActionBase,
    probe: Arc<ActionProbe>,
    delay: Duration,
}

impl SlowAction {
    /// Creates the action.
    #[must_use]
    pub fn new(name: &str, delay: Duration) -> Self {
        Self {
            base: mock_base(name),
            probe: ActionProbe::new(),
            delay,
        }
    }

    /// Reports calls to `probe`.
    #[must_use]
    pub fn with_probe(mut self, probe: Arc<ActionProbe>) -> Self {
        self.probe = probe;
        self
    }

    async fn act(
        &mut self,
        _attempt: u32,
        connection: Option<SharedConnection>,
        _max_end_time: Deadline,
    ) -> Result<Option<SharedConnection>> {
        tokio::time::sleep(self.delay).await;
        Ok(connection)
    }
}

probed_action!(SlowAction, "slow");

/// Writes `value` to the context store, then reads back what an earlier
/// action wrote under `reads`.
#[derive(Debug)]
pub struct RecordingAction {
    base: ActionBase,
    probe: Arc<ActionProbe>,
    value: Value,
    reads: Option<String>,
    seen: Arc<Mutex<Vec<Option<Value>>>>,
}

impl RecordingAction {
    /// Creates an action storing `value` under `(ns, name, "recording", "value")`.
    #[must_use]
    pub fn new(name: &str, value: Value) -> Self {
        Self {
            base: mock_base(name),
            probe: ActionProbe::new(),
            value,
            reads: None,
            seen: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Also reads the value stored by the action called `producer`.
    #[must_use]
    pub fn reading(mut self, producer: &str) -> Self {
        self.reads = Some(producer.to_string());
        self
    }

    /// Returns a handle on the values read, one per run.
    #[must_use]
    pub fn seen(&self) -> Arc<Mutex<Vec<Option<Value>>>> {
        Arc::clone(&self.seen)
    }

    /// Reports calls to `probe`.
    #[must_use]
    pub fn with_probe(mut self, probe: Arc<ActionProbe>) -> Self {
        self.probe = probe;
        self
    }

    async fn act(
        &mut self,
        _attempt: u32,
        connection: Option<SharedConnection>,
        _max_end_time: Deadline,
    ) -> Result<Option<SharedConnection>> {
        if let Some(ref producer) = self.reads {
            let value = self.base.get_namespace_data(producer, "recording", "value")?;
            self.seen.lock().push(value);
        }
        self.base
            .set_namespace_data(self.base.name(), "recording", "value", self.value.clone())?;
        Ok(connection)
    }
}

probed_action!(RecordingAction, "recording");

/// In-memory connection recording what was sent to it.
#[derive(Debug)]
pub struct MockConnection {
    name: String,
    prompts: Mutex<Vec<String>>,
    timeout: Mutex<Duration>,
    sent: Mutex<Vec<String>>,
    connected: AtomicBool,
}

impl MockConnection {
    /// Creates a connected mock.
    #[must_use]
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            prompts: Mutex::new(Vec::new()),
            timeout: Mutex::new(Duration::from_secs(30)),
            sent: Mutex::new(Vec::new()),
            connected: AtomicBool::new(true),
        })
    }

    /// Returns the lines sent so far.
    #[must_use]
    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl Connection for MockConnection {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn prompt_str(&self) -> Vec<String> {
        self.prompts.lock().clone()
    }

    fn set_prompt_str(&self, prompts: Vec<String>) {
        *self.prompts.lock() = prompts;
    }

    fn timeout(&self) -> Duration {
        *self.timeout.lock()
    }

    fn set_timeout(&self, timeout: Duration) {
        *self.timeout.lock() = timeout;
    }

    fn before(&self) -> String {
        String::new()
    }

    async fn sendline(&self, line: &str, _delay_ms: u64) -> Result<()> {
        self.sent.lock().push(line.to_string());
        Ok(())
    }

    async fn sendcontrol(&self, c: char) -> Result<()> {
        self.sent.lock().push(format!("^{c}"));
        Ok(())
    }

    async fn wait(&self, _max_end_time: Option<Deadline>) -> Result<usize> {
        Ok(0)
    }

    async fn force_prompt_wait(&self, _remaining: Duration) -> Result<usize> {
        Ok(0)
    }

    async fn listen_feedback(&self, _window: Duration, _namespace: Option<&str>) -> Result<usize> {
        Ok(0)
    }

    async fn finalise(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }
}

/// Diagnostic that counts its runs.
#[derive(Debug)]
pub struct CountingDiagnostic {
    trigger: String,
    runs: Mutex<u32>,
    connections: Mutex<Vec<Option<String>>>,
}

impl CountingDiagnostic {
    /// Creates a diagnostic answering `trigger`.
    #[must_use]
    pub fn new(trigger: &str) -> Self {
        Self {
            trigger: trigger.to_string(),
            runs: Mutex::new(0),
            connections: Mutex::new(Vec::new()),
        }
    }

    /// Returns the number of runs.
    #[must_use]
    pub fn runs(&self) -> u32 {
        *self.runs.lock()
    }

    /// Returns the name of the connection each run received.
    #[must_use]
    pub fn connections(&self) -> Vec<Option<String>> {
        self.connections.lock().clone()
    }
}

#[async_trait]
impl Diagnostic for CountingDiagnostic {
    fn trigger(&self) -> &str {
        &self.trigger
    }

    fn name(&self) -> &str {
        "counting-diagnostic"
    }

    async fn run(&self, connection: Option<&SharedConnection>, _job: &JobContext) -> Result<()> {
        self.connections
            .lock()
            .push(connection.map(|c| c.name().to_string()));
        *self.runs.lock() += 1;
        Ok(())
    }
}

/// Protocol answering every call with a fixed reply.
#[derive(Debug)]
pub struct MockProtocol {
    name: String,
    level: u32,
    errors: Vec<String>,
    reply: Value,
    timeout_override: Option<Duration>,
    calls: Mutex<Vec<(Value, String)>>,
    set_ups: Mutex<u32>,
    finalised: Mutex<u32>,
}

impl MockProtocol {
    /// Creates a protocol replying `{"status": "ok"}`.
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            level: 0,
            errors: Vec::new(),
            reply: json!({"status": "ok"}),
            timeout_override: None,
            calls: Mutex::new(Vec::new()),
            set_ups: Mutex::new(0),
            finalised: Mutex::new(0),
        }
    }

    /// Sets the set-up level.
    #[must_use]
    pub const fn with_level(mut self, level: u32) -> Self {
        self.level = level;
        self
    }

    /// Reports configuration errors.
    #[must_use]
    pub fn with_errors(mut self, errors: Vec<String>) -> Self {
        self.errors = errors;
        self
    }

    /// Sets the reply of every call.
    #[must_use]
    pub fn with_reply(mut self, reply: Value) -> Self {
        self.reply = reply;
        self
    }

    /// Asks for a longer connection timeout on every call.
    #[must_use]
    pub const fn with_timeout_override(mut self, timeout: Duration) -> Self {
        self.timeout_override = Some(timeout);
        self
    }

    /// Returns `(call, action)` for every call made.
    #[must_use]
    pub fn calls(&self) -> Vec<(Value, String)> {
        self.calls.lock().clone()
    }

    /// Returns how many times the protocol was set up.
    #[must_use]
    pub fn set_ups(&self) -> u32 {
        *self.set_ups.lock()
    }

    /// Returns how many times the protocol was finalised.
    #[must_use]
    pub fn finalised(&self) -> u32 {
        *self.finalised.lock()
    }
}

#[async_trait]
impl Protocol for MockProtocol {
    fn name(&self) -> &str {
        &self.name
    }

    fn level(&self) -> u32 {
        self.level
    }

    fn errors(&self) -> Vec<String> {
        self.errors.clone()
    }

    async fn set_up(&self) -> Result<()> {
        *self.set_ups.lock() += 1;
        Ok(())
    }

    fn check_timeout(&self, connection_timeout: Duration, _call: &Value) -> Result<Option<Duration>> {
        Ok(self.timeout_override.filter(|timeout| *timeout > connection_timeout))
    }

    async fn call(&self, call: &Value, action: &str) -> Result<Value> {
        self.calls.lock().push((call.clone(), action.to_string()));
        Ok(self.reply.clone())
    }

    /// Stores the reply under the call's `request` (or `reply`).
    fn collate(&self, reply: &Value, call: &Value) -> Option<(String, Value)> {
        let key = call
            .get("request")
            .and_then(Value::as_str)
            .unwrap_or("reply")
            .to_string();
        Some((key, reply.clone()))
    }

    async fn finalise_protocol(&self) -> Result<()> {
        *self.finalised.lock() += 1;
        Ok(())
    }
}
