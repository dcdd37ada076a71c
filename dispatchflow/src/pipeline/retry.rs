//! Composite action that re-runs its child pipeline.
//!
//! `failure_retry: N` stops at the first successful attempt and fails only
//! once N attempts have failed. `repeat: N` always runs all N attempts and
//! fails if any of them failed. Engine bugs are never retried.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{error, info, warn};

use super::Pipeline;
use crate::action::{Action, ActionBase, Parameters};
use crate::connection::SharedConnection;
use crate::errors::{Failure, Result};
use crate::timeout::{Deadline, FAILURE_RETRY_INTERVAL};

/// Builds a fresh child action each time the retry wrapper is populated.
pub type ActionFactory = Arc<dyn Fn() -> Box<dyn Action> + Send + Sync>;

/// Action that runs its children again after a retryable failure.
pub struct RetryAction {
    base: ActionBase,
    sleep: Duration,
    children: Vec<ActionFactory>,
}

impl RetryAction {
    /// Creates a retry wrapper without children.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        summary: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            base: ActionBase::new(name, summary, description),
            sleep: FAILURE_RETRY_INTERVAL,
            children: Vec::new(),
        }
    }

    /// Sets the section of the wrapper and of its children.
    #[must_use]
    pub fn with_section(self, section: impl Into<String>) -> Self {
        Self {
            base: self.base.with_section(section),
            ..self
        }
    }

    /// Adds a child, built when the wrapper is attached to a pipeline.
    #[must_use]
    pub fn with_child<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> Box<dyn Action> + Send + Sync + 'static,
    {
        self.children.push(Arc::new(factory));
        self
    }

    /// Returns the pause between two attempts.
    #[must_use]
    pub const fn sleep(&self) -> Duration {
        self.sleep
    }

    fn failed_connection(&self, fallback: Option<SharedConnection>) -> Option<SharedConnection> {
        self.base
            .pipeline()
            .map_or(fallback, Pipeline::last_connection)
    }
}

impl fmt::Debug for RetryAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryAction")
            .field("base", &self.base)
            .field("sleep", &self.sleep)
            .field("children", &self.children.len())
            .finish()
    }
}

#[async_trait]
impl Action for RetryAction {
    fn base(&self) -> &ActionBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut ActionBase {
        &mut self.base
    }

    fn kind(&self) -> &'static str {
        "retry"
    }

    fn populate(&mut self, parameters: &Parameters) -> Result<()> {
        if let Some(value) = parameters.get("failure_retry_interval") {
            let seconds = value.as_u64().ok_or_else(|| {
                Failure::job(format!(
                    "Invalid failure_retry_interval for {}: {value}",
                    self.base.name()
                ))
            })?;
            self.sleep = Duration::from_secs(seconds);
        }
        if self.children.is_empty() {
            return Ok(());
        }
        let mut pipeline = self.base.new_pipeline()?;
        for factory in &self.children {
            pipeline.add_action(factory(), None)?;
        }
        self.base.set_pipeline(pipeline);
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        if self.base.pipeline().is_none() {
            let error = format!(
                "Retry action {} needs to implement an internal pipeline",
                self.base.name()
            );
            self.base.add_error(error);
        }
        self.base.validate_base()
    }

    async fn run(
        &mut self,
        connection: Option<SharedConnection>,
        max_end_time: Deadline,
    ) -> Result<Option<SharedConnection>> {
        let name = self.base.name().to_string();
        let max = self.base.max_retries();
        let repeat = self.base.is_repeat();
        let mut current = connection.clone();
        let mut last_failure = None;
        let mut failures = 0_u32;
        let mut attempt = 0_u32;
        let mut out_of_time = false;

        self.base.call_protocols().await?;
        while attempt < max {
            attempt += 1;
            if repeat {
                info!(action = %name, "{}: attempt {} of {}", name, attempt, max);
            }
            match self.base.run_pipeline(connection.clone(), max_end_time).await {
                Ok(returned) => {
                    if returned.is_some() {
                        current = returned;
                    }
                    if !repeat {
                        self.base.set_result("attempts", json!(attempt));
                        return Ok(current);
                    }
                }
                Err(failure) if failure.is_bug() => return Err(failure),
                Err(failure) => {
                    failures += 1;
                    warn!(action = %name, "{} failed: {} of {} attempts. '{}'", name, attempt, max, failure);
                    let in_effect = self.failed_connection(connection.clone());
                    if let Err(cleanup) = self.cleanup(in_effect).await {
                        error!(action = %name, "Cleanup after attempt {} failed: {}", attempt, cleanup);
                    }
                    last_failure = Some(failure);
                    if attempt >= max {
                        break;
                    }
                    let remaining = max_end_time.saturating_duration_since(Instant::now());
                    if remaining < self.sleep {
                        out_of_time = true;
                        break;
                    }
                    self.base.clear_state();
                    info!(action = %name, "{}: Retrying in {} seconds", name, self.sleep.as_secs());
                    tokio::time::sleep(self.sleep).await;
                }
            }
        }

        self.base.set_result("attempts", json!(attempt));
        let Some(failure) = last_failure else {
            return Ok(current);
        };
        let message = if out_of_time {
            format!("{name} ran out of time after {attempt} of {max} attempts")
        } else {
            format!("{failures} of {max} retries failed for {name}")
        };
        self.base.add_error(message.clone());
        self.base.set_result("fail", Value::String(message.clone()));
        Err(Failure::new(failure.kind(), message).with_cause(failure))
    }
}
