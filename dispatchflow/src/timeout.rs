//! Hierarchical timeouts.
//!
//! Every scope of execution is bounded by a [`Deadline`]. Entering a
//! [`Timeout`] narrows the parent's deadline to `min(parent, now + duration)`
//! so a nested scope can never outlive the scope that contains it.

use serde_json::Value;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

use crate::errors::{Failure, Result};

/// An absolute point in (tokio) time beyond which a scope must not continue.
pub type Deadline = Instant;

/// Default budget of a single action.
pub const ACTION_TIMEOUT: Duration = Duration::from_secs(30);

/// Default budget applied to a connection handed on by an action.
pub const CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);

/// Budget given to the job cleanup after a failure.
pub const CLEANUP_TIMEOUT: Duration = Duration::from_secs(60);

/// Default sleep between two retry attempts.
pub const FAILURE_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Budgets longer than this are clamped when turned into a deadline.
const LONGEST_BUDGET: Duration = Duration::from_secs(86_400 * 365 * 30);

const UNITS: [(&str, u64); 4] = [("days", 86_400), ("hours", 3_600), ("minutes", 60), ("seconds", 1)];

/// Returns `now + duration`, clamped so the instant cannot overflow.
#[must_use]
pub fn deadline_after(now: Instant, duration: Duration) -> Deadline {
    now.checked_add(duration.min(LONGEST_BUDGET)).unwrap_or(now)
}

/// A named duration with the bookkeeping of its last scoped entry.
#[derive(Debug, Clone)]
pub struct Timeout {
    name: String,
    duration: Duration,
    start: Option<Instant>,
    elapsed: Option<Duration>,
}

impl Timeout {
    /// Creates a new timeout.
    #[must_use]
    pub fn new(name: impl Into<String>, duration: Duration) -> Self {
        Self {
            name: name.into(),
            duration,
            start: None,
            elapsed: None,
        }
    }

    /// Parses a `{days, hours, minutes, seconds}` map into a duration.
    ///
    /// An empty map yields [`ACTION_TIMEOUT`]. A `skip` flag is accepted and
    /// ignored here; see [`Timeout::can_skip`].
    pub fn parse(value: &Value) -> Result<Duration> {
        let Value::Object(map) = value else {
            return Err(Failure::bug(format!("Invalid timeout data: {value}")));
        };

        let mut total = 0_u64;
        let mut seen = false;
        for (key, item) in map {
            if key == "skip" {
                continue;
            }
            let Some((_, factor)) = UNITS.iter().find(|(unit, _)| unit == key) else {
                return Err(Failure::bug(format!("Invalid timeout unit '{key}'")));
            };
            let Some(amount) = item.as_u64() else {
                return Err(Failure::bug(format!("Invalid timeout value for '{key}': {item}")));
            };
            total = amount
                .checked_mul(*factor)
                .and_then(|seconds| total.checked_add(seconds))
                .ok_or_else(|| Failure::bug(format!("Timeout value for '{key}' is out of range: {item}")))?;
            seen = true;
        }

        if seen {
            Ok(Duration::from_secs(total))
        } else {
            Ok(ACTION_TIMEOUT)
        }
    }

    /// Returns true when the parameters mark the action as skippable on timeout.
    #[must_use]
    pub fn can_skip(parameters: &serde_json::Map<String, Value>) -> bool {
        parameters
            .get("timeout")
            .and_then(|t| t.get("skip"))
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Returns the name used in timeout messages.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Renames the timeout.
    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    /// Returns the target budget.
    #[must_use]
    pub const fn duration(&self) -> Duration {
        self.duration
    }

    /// Replaces the target budget.
    pub fn set_duration(&mut self, duration: Duration) {
        self.duration = duration;
    }

    /// Returns when the last scope was entered.
    #[must_use]
    pub const fn start(&self) -> Option<Instant> {
        self.start
    }

    /// Returns the time spent in the last completed scope.
    #[must_use]
    pub const fn elapsed(&self) -> Option<Duration> {
        self.elapsed
    }

    /// Returns what is left of the budget since the scope was entered.
    ///
    /// Before any scope was entered this is the full duration.
    #[must_use]
    pub fn remaining(&self) -> Duration {
        self.start.map_or(self.duration, |start| {
            self.duration.saturating_sub(start.elapsed())
        })
    }

    /// Restarts the budget from now without touching the elapsed record.
    pub fn reset(&mut self) {
        self.start = Some(Instant::now());
    }

    /// Enters a scope bounded by `parent`.
    ///
    /// Returns the effective deadline, or a timeout failure if the parent
    /// deadline has already passed.
    pub fn begin(&mut self, parent: Deadline) -> Result<Deadline> {
        let now = Instant::now();
        self.start = Some(now);
        self.elapsed = None;
        if parent <= now {
            self.elapsed = Some(Duration::ZERO);
            return Err(Failure::timeout(format!(
                "{} timed out: no time left in the enclosing scope",
                self.name
            )));
        }
        Ok(parent.min(deadline_after(now, self.duration)))
    }

    /// Leaves the current scope and records the elapsed time.
    pub fn finish(&mut self) -> Duration {
        let elapsed = self.start.map_or(Duration::ZERO, |start| start.elapsed());
        self.elapsed = Some(elapsed);
        elapsed
    }

    /// Builds the failure raised when a scope overruns.
    #[must_use]
    pub fn expired(&self) -> Failure {
        let spent = self.start.map_or(self.duration, |start| start.elapsed());
        Failure::timeout(format!(
            "{} timed out after {} seconds",
            self.name,
            spent.as_secs()
        ))
    }

    /// Runs `operation` inside a scope bounded by `parent`.
    ///
    /// The closure receives the effective deadline. Overrunning it drops the
    /// operation and yields a timeout failure.
    pub async fn scope<F, Fut, T>(&mut self, parent: Deadline, operation: F) -> Result<T>
    where
        F: FnOnce(Deadline) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let deadline = self.begin(parent)?;
        let outcome = tokio::time::timeout_at(deadline, operation(deadline)).await;
        self.finish();
        match outcome {
            Ok(result) => result,
            Err(_) => Err(self.expired()),
        }
    }
}
