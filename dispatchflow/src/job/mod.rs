//! Jobs: configuration, shared context, parsing and the top-level run.

mod config;
mod context;
mod parser;

pub use config::{CommandList, DeviceCommands, DeviceConfig, JobDefinition, TimeoutsConfig, UserCommand};
pub use context::JobContext;
pub use parser::JobParser;

use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{error, info};

use crate::context::DEFAULT_NAMESPACE;
use crate::errors::{Failure, FailureKind, Result};
use crate::events::{ResultRecord, ResultStatus, JOB_RESULT, JOB_VALIDATE};
use crate::observability::SpanTimer;
use crate::pipeline::Pipeline;
use crate::timeout::{deadline_after, Timeout, CLEANUP_TIMEOUT};
use crate::utils::{format_duration, format_iso8601, now_utc, Timestamp};

/// Summary of a finished job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobOutcome {
    /// Pass or fail.
    pub result: ResultStatus,
    /// Kind of the failure that ended the job.
    pub kind: Option<FailureKind>,
    /// Message of the failure that ended the job.
    pub message: Option<String>,
    /// Wall-clock duration of the run.
    pub duration: Duration,
    /// When the job finished.
    pub finished: Timestamp,
}

impl JobOutcome {
    fn new(result: &Result<()>, duration: Duration) -> Self {
        match result {
            Ok(()) => Self {
                result: ResultStatus::Pass,
                kind: None,
                message: None,
                duration,
                finished: now_utc(),
            },
            Err(failure) => Self {
                result: ResultStatus::Fail,
                kind: Some(failure.kind()),
                message: Some(failure.message.clone()),
                duration,
                finished: now_utc(),
            },
        }
    }

    /// Returns true when the job passed.
    #[must_use]
    pub fn passed(&self) -> bool {
        self.result == ResultStatus::Pass
    }

    /// Converts to the JSON payload of the job result record.
    #[must_use]
    pub fn to_value(&self) -> Value {
        json!({
            "result": self.result.to_string(),
            "error_type": self.kind.map(FailureKind::as_str),
            "error_msg": self.message,
            "duration": format_duration(self.duration),
            "end_time": format_iso8601(&self.finished),
        })
    }
}

/// A parsed job: the shared context and the root pipeline.
#[derive(Debug)]
pub struct Job {
    context: Arc<JobContext>,
    definition: JobDefinition,
    pipeline: Pipeline,
    timeout: Timeout,
    cleaned: bool,
}

impl Job {
    /// Assembles a job from its parts.
    ///
    /// [`JobParser`] is the usual way to get one; this is for callers that
    /// build the root pipeline themselves.
    #[must_use]
    pub fn new(context: Arc<JobContext>, definition: JobDefinition, pipeline: Pipeline, timeout: Duration) -> Self {
        Self {
            context,
            definition,
            pipeline,
            timeout: Timeout::new("job", timeout),
            cleaned: false,
        }
    }

    /// Returns the shared context.
    #[must_use]
    pub const fn context(&self) -> &Arc<JobContext> {
        &self.context
    }

    /// Returns the definition the job was built from.
    #[must_use]
    pub const fn definition(&self) -> &JobDefinition {
        &self.definition
    }

    /// Returns the root pipeline.
    #[must_use]
    pub const fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// Returns the job timeout.
    #[must_use]
    pub const fn timeout(&self) -> &Timeout {
        &self.timeout
    }

    /// Validates the job before anything runs.
    ///
    /// Emits a `job.validate` record; a failed validation also runs the job
    /// cleanup.
    pub async fn validate(&mut self) -> Result<()> {
        info!("start: 0 validate");
        let timer = SpanTimer::start("validate");
        let outcome = self.check();
        let duration = timer.finish();
        info!("validate duration: {}", format_duration(duration));

        let record = ResultRecord::new(
            DEFAULT_NAMESPACE,
            "validate",
            "0",
            duration,
            ResultStatus::from_failed(outcome.is_err()),
        );
        self.context.sink().emit(JOB_VALIDATE, Some(record.to_value())).await;
        if outcome.is_err() {
            self.cleanup().await;
        }
        outcome
    }

    fn check(&mut self) -> Result<()> {
        let namespaces: BTreeSet<&str> = self
            .definition
            .actions
            .iter()
            .flat_map(|block| block.values())
            .map(|parameters| {
                parameters
                    .get("namespace")
                    .and_then(Value::as_str)
                    .unwrap_or(DEFAULT_NAMESPACE)
            })
            .collect();
        if namespaces.len() > 1 && namespaces.contains(DEFAULT_NAMESPACE) {
            return Err(Failure::job(format!(
                "'{DEFAULT_NAMESPACE}' is a reserved namespace that should not be present with other namespaces"
            )));
        }

        for protocol in self.context.protocols() {
            let errors = protocol.errors();
            if !errors.is_empty() {
                return Err(Failure::job(format!(
                    "protocol {} has errors: {errors:?}",
                    protocol.name()
                )));
            }
        }
        self.pipeline.validate_actions()
    }

    /// Runs the job under its timeout.
    ///
    /// A failure runs the job cleanup before the outcome is reported.
    pub async fn run(&mut self) -> JobOutcome {
        let timer = SpanTimer::start(self.context.job_id());
        let result = self.execute().await;
        if let Err(ref failure) = result {
            error!(kind = %failure.kind(), "Job failed: {}", failure);
            self.cleanup().await;
        }
        let outcome = JobOutcome::new(&result, timer.finish());
        info!(result = %outcome.result, "Job finished in {} seconds", format_duration(outcome.duration));
        self.context.sink().emit(JOB_RESULT, Some(outcome.to_value())).await;
        outcome
    }

    async fn execute(&mut self) -> Result<()> {
        let context = Arc::clone(&self.context);
        context.mark_started();
        for protocol in context.protocols() {
            protocol.set_up().await?;
            let errors = protocol.errors();
            if !errors.is_empty() {
                return Err(Failure::job(format!(
                    "protocol {} has errors: {errors:?}",
                    protocol.name()
                )));
            }
        }

        let pipeline = &mut self.pipeline;
        let parent = deadline_after(Instant::now(), self.timeout.duration());
        self.timeout
            .scope(parent, |deadline| pipeline.run_actions(None, deadline))
            .await?;
        Ok(())
    }

    /// Cleans the root pipeline within the cleanup timeout.
    ///
    /// Only the first call does anything.
    pub async fn cleanup(&mut self) {
        if self.cleaned {
            info!("Cleanup already called, skipping");
            return;
        }
        info!("Cleaning after the job");
        let connection = self.pipeline.last_connection();
        let pipeline = &mut self.pipeline;
        let mut timeout = Timeout::new("job-cleanup", CLEANUP_TIMEOUT);
        let result = timeout
            .scope(Instant::now() + CLEANUP_TIMEOUT, |_| async move {
                pipeline.cleanup(connection).await;
                Ok(())
            })
            .await;
        if let Err(failure) = result {
            error!("Job cleanup did not complete: {}", failure);
        }
        self.cleaned = true;
    }

    /// Describes the job and its whole action tree.
    #[must_use]
    pub fn describe(&self) -> Value {
        json!({
            "job_id": self.context.job_id(),
            "job_name": self.definition.job_name,
            "pipeline": self.pipeline.describe(true),
        })
    }
}
