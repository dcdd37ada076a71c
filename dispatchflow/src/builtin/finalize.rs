//! The finalize phase appended to every job.

use async_trait::async_trait;
use serde_json::json;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::action::{Action, ActionBase, CommandPolicy, Parameters};
use crate::connection::{listen_feedback_all, SharedConnection};
use crate::errors::Result;
use crate::timeout::{Deadline, CLEANUP_TIMEOUT};

/// How long each background connection is drained.
pub const FEEDBACK_WINDOW: Duration = Duration::from_secs(1);

/// Last root action of every job: powers the device off, drains and closes
/// the background connections, closes the active connection and releases
/// the protocols.
///
/// Also runs from the job cleanup when a failure stopped the pipeline
/// before reaching it.
#[derive(Debug)]
pub struct FinalizeAction {
    base: ActionBase,
    ran: bool,
}

impl FinalizeAction {
    /// Creates the finalize action.
    #[must_use]
    pub fn new() -> Self {
        Self {
            base: ActionBase::new("finalize", "finalize the job", "finish the process and cleanup")
                .with_section("finalize"),
            ran: false,
        }
    }

    /// Returns true once the finalize phase ran.
    #[must_use]
    pub const fn ran(&self) -> bool {
        self.ran
    }
}

impl Default for FinalizeAction {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Action for FinalizeAction {
    fn base(&self) -> &ActionBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut ActionBase {
        &mut self.base
    }

    fn kind(&self) -> &'static str {
        "finalize"
    }

    fn populate(&mut self, _parameters: &Parameters) -> Result<()> {
        let mut pipeline = self.base.new_pipeline()?;
        pipeline.add_action(Box::new(PowerOff::new()), None)?;
        pipeline.add_action(Box::new(ReadFeedback::new(true, true)), None)?;
        self.base.set_pipeline(pipeline);
        Ok(())
    }

    async fn run(
        &mut self,
        connection: Option<SharedConnection>,
        max_end_time: Deadline,
    ) -> Result<Option<SharedConnection>> {
        self.ran = true;
        let connection = match self.base.run_pipeline(connection.clone(), max_end_time).await {
            Ok(connection) => connection,
            Err(failure) => {
                warn!("Finalize steps failed: {}", failure);
                connection
            }
        };
        if let Some(ref connection) = connection {
            connection.finalise().await;
        }
        let job = self.base.job()?;
        for protocol in job.protocols() {
            if let Err(failure) = protocol.finalise_protocol().await {
                warn!(protocol = %protocol.name(), "Unable to finalise protocol: {}", failure);
            }
        }
        Ok(connection)
    }

    async fn cleanup(&mut self, connection: Option<SharedConnection>) -> Result<()> {
        let job = self.base.job()?;
        if !self.ran && job.is_started() {
            let deadline = Instant::now() + CLEANUP_TIMEOUT;
            Action::run(self, connection, deadline).await?;
        }
        Ok(())
    }
}

/// Runs the device's `power_off` commands.
#[derive(Debug)]
pub struct PowerOff {
    base: ActionBase,
}

impl PowerOff {
    /// Creates the action.
    #[must_use]
    pub fn new() -> Self {
        Self {
            base: ActionBase::new("power-off", "send power_off command", "discontinue power to device"),
        }
    }
}

impl Default for PowerOff {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Action for PowerOff {
    fn base(&self) -> &ActionBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut ActionBase {
        &mut self.base
    }

    fn kind(&self) -> &'static str {
        "power-off"
    }

    async fn run(
        &mut self,
        connection: Option<SharedConnection>,
        max_end_time: Deadline,
    ) -> Result<Option<SharedConnection>> {
        let connection = self.base.run_default(connection, max_end_time).await?;
        let job = self.base.job()?;
        let Some(ref commands) = job.device().commands.power_off else {
            return Ok(connection);
        };
        for line in commands.lines() {
            self.base
                .run_command(line, CommandPolicy::default().allow_silent(), max_end_time)
                .await?;
        }
        self.base.set_result("status", json!("success"));
        Ok(connection)
    }
}

/// Drains the shared connections of the other namespaces.
///
/// In finalize mode the drained connections are closed afterwards.
#[derive(Debug)]
pub struct ReadFeedback {
    base: ActionBase,
    finalize: bool,
    repeat: bool,
    window: Duration,
}

impl ReadFeedback {
    /// Creates the action. With `repeat` the action's own namespace is
    /// drained as well.
    #[must_use]
    pub fn new(finalize: bool, repeat: bool) -> Self {
        Self {
            base: ActionBase::new(
                "read-feedback",
                "Read from other namespaces",
                "Check for messages on all other namespaces",
            ),
            finalize,
            repeat,
            window: FEEDBACK_WINDOW,
        }
    }

    /// Overrides the drain window.
    #[must_use]
    pub const fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }
}

#[async_trait]
impl Action for ReadFeedback {
    fn base(&self) -> &ActionBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut ActionBase {
        &mut self.base
    }

    fn kind(&self) -> &'static str {
        "read-feedback"
    }

    async fn run(
        &mut self,
        connection: Option<SharedConnection>,
        max_end_time: Deadline,
    ) -> Result<Option<SharedConnection>> {
        let job = self.base.job()?;
        let own = self.base.namespace().to_string();
        let mut feedbacks = Vec::new();
        for namespace in job.store().namespaces() {
            if namespace == own && !self.repeat {
                continue;
            }
            match job.store().shared_connection(&namespace) {
                Some(feedback) => feedbacks.push((namespace, feedback)),
                None => debug!("No connection for namespace {}", namespace),
            }
        }

        for (namespace, read) in listen_feedback_all(&feedbacks, self.window).await {
            match read {
                Ok(bytes) if bytes > 1 => debug!(
                    namespace = %namespace,
                    "Listened to connection for namespace '{}' for {}s",
                    namespace,
                    self.window.as_secs()
                ),
                Ok(_) => {}
                Err(failure) => warn!(namespace = %namespace, "Unable to read feedback: {}", failure),
            }
        }
        if self.finalize {
            for (namespace, feedback) in &feedbacks {
                info!("Finalising connection for namespace '{}'", namespace);
                feedback.finalise().await;
            }
        }
        self.base.run_default(connection, max_end_time).await
    }
}
