//! The ordered container of actions.
//!
//! A [`Pipeline`] owns its actions outright. A composite action owns the
//! pipeline of its children, so the whole job is a tree of owned nodes with
//! no back-references: what a child needs from its parent (dotted level,
//! section, parameters) is copied into the child pipeline as a
//! [`ParentInfo`] when the composite builds it.
//!
//! Execution is strictly sequential. Every level receives a deadline
//! (`max_end_time`) rather than a duration, and narrows it to its own
//! budget before running an action, so nested retries never outlive the
//! budget of their parent.

#[cfg(test)]
mod integration_tests;
mod overrides;
mod retry;

pub use retry::{ActionFactory, RetryAction};

use futures::FutureExt;
use serde_json::{json, Value};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::action::{Action, Parameters};
use crate::connection::SharedConnection;
use crate::errors::{Failure, FailureKind, Result};
use crate::events::{action_end_record, action_start_record, ACTION_END, ACTION_START};
use crate::job::JobContext;
use crate::timeout::{Deadline, Timeout};
use crate::utils::seconds_to_str;

/// What a child pipeline keeps of the composite action that owns it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParentInfo {
    /// Name of the owning action.
    pub name: String,
    /// Dotted level of the owning action.
    pub level: String,
    /// Section inherited by every child.
    pub section: String,
}

/// Ordered sequence of actions run under one deadline.
#[derive(Debug)]
pub struct Pipeline {
    actions: Vec<Box<dyn Action>>,
    parent: Option<ParentInfo>,
    job: Arc<JobContext>,
    parameters: Parameters,
    connection: Option<SharedConnection>,
}

impl Pipeline {
    /// Creates the root pipeline of a job.
    #[must_use]
    pub fn new(job: Arc<JobContext>) -> Self {
        Self {
            actions: Vec::new(),
            parent: None,
            job,
            parameters: Parameters::new(),
            connection: None,
        }
    }

    /// Creates the child pipeline of a composite action.
    ///
    /// `parameters` are handed to children added without parameters of
    /// their own.
    #[must_use]
    pub fn with_parent(job: Arc<JobContext>, parent: ParentInfo, parameters: Parameters) -> Self {
        Self {
            actions: Vec::new(),
            parent: Some(parent),
            job,
            parameters,
            connection: None,
        }
    }

    /// Returns the owning action, `None` for the root pipeline.
    #[must_use]
    pub const fn parent(&self) -> Option<&ParentInfo> {
        self.parent.as_ref()
    }

    /// Returns true for the root pipeline of a job.
    #[must_use]
    pub const fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    /// Returns the job this pipeline belongs to.
    #[must_use]
    pub const fn job(&self) -> &Arc<JobContext> {
        &self.job
    }

    /// Returns the actions in attachment order.
    #[must_use]
    pub fn actions(&self) -> &[Box<dyn Action>] {
        &self.actions
    }

    /// Returns the action called `name`, searching the whole subtree.
    #[must_use]
    pub fn find(&self, name: &str) -> Option<&dyn Action> {
        self.actions.iter().find_map(|action| {
            if action.base().name() == name {
                Some(action.as_ref())
            } else {
                action.base().pipeline().and_then(|pipeline| pipeline.find(name))
            }
        })
    }

    /// Returns the number of actions directly in this pipeline.
    #[must_use]
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    /// Returns true when no action has been added.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Returns the connection in effect after the last action that ran.
    #[must_use]
    pub fn last_connection(&self) -> Option<SharedConnection> {
        self.connection.clone()
    }

    /// Attaches `action` as the next child.
    ///
    /// Assigns the level, inherits the section, merges `parameters` (or the
    /// pipeline's own when `None`), resolves both timeout chains and then
    /// lets the action populate its own pipeline. The action's parameters
    /// are frozen afterwards.
    pub fn add_action(&mut self, mut action: Box<dyn Action>, parameters: Option<Parameters>) -> Result<()> {
        let index = self.actions.len() + 1;
        let level = match self.parent {
            Some(ref parent) => format!("{}.{}", parent.level, index),
            None => index.to_string(),
        };
        let section = self.parent.as_ref().map(|parent| parent.section.as_str());
        action.base_mut().attach(Arc::clone(&self.job), level, section);

        let parameters = parameters.unwrap_or_else(|| self.parameters.clone());
        action.base_mut().apply_parameters(&parameters)?;

        let (action_timeout, connection_timeout) = overrides::resolve(
            &self.job.device().timeouts,
            self.job.timeouts(),
            action.base().name(),
            action.base().parameters(),
        )?;
        action.base_mut().set_timeouts(action_timeout, connection_timeout);

        let merged = action.base().parameters().clone();
        action.populate(&merged)?;
        action.base_mut().freeze();
        self.actions.push(action);
        Ok(())
    }

    /// Validates every action, collecting configuration problems.
    ///
    /// A job-configuration failure from one action is recorded as that
    /// action's error and the loop goes on; any other failure aborts. On
    /// the root pipeline a non-empty error list fails the job.
    pub fn validate_actions(&mut self) -> Result<()> {
        for action in &mut self.actions {
            match action.validate() {
                Ok(()) => {}
                Err(failure) if failure.kind() == FailureKind::JobConfig => {
                    let base = action.base_mut();
                    let error = format!("{} {}: {}", base.level(), base.name(), failure.message);
                    base.add_error(error);
                }
                Err(failure) => return Err(failure),
            }
        }
        if self.is_root() {
            let errors = self.errors();
            if !errors.is_empty() {
                return Err(Failure::job(format!("Invalid job data: {errors:?}")));
            }
        }
        Ok(())
    }

    /// Returns every error recorded in the subtree, in tree order.
    #[must_use]
    pub fn errors(&self) -> Vec<String> {
        self.actions
            .iter()
            .flat_map(|action| action.base().all_errors())
            .collect()
    }

    /// Clears results and errors of the whole subtree before a new attempt.
    pub fn clear_state(&mut self) {
        for action in &mut self.actions {
            action.base_mut().clear_state();
        }
    }

    /// Runs the actions in order within `max_end_time`.
    ///
    /// A connection returned by an action replaces the current one for the
    /// next action. The connection in effect at the end is returned.
    pub async fn run_actions(
        &mut self,
        connection: Option<SharedConnection>,
        max_end_time: Deadline,
    ) -> Result<Option<SharedConnection>> {
        let job = Arc::clone(&self.job);
        let root = self.is_root();
        let mut connection = connection;
        self.connection.clone_from(&connection);

        for index in 0..self.actions.len() {
            let action = &mut self.actions[index];
            let (level, name, namespace) = {
                let base = action.base();
                (
                    base.level().to_string(),
                    base.name().to_string(),
                    base.namespace().to_string(),
                )
            };

            action.base_mut().set_cleaned(false);
            let entered = action.base_mut().timeout_mut().begin(max_end_time);
            let ran = entered.is_ok();
            // The record carries the budget left after clamping to the parent.
            let budget = match (&entered, action.base().timeout().start()) {
                (Ok(deadline), Some(start)) => deadline.saturating_duration_since(start),
                _ => Duration::ZERO,
            };
            if root {
                info!(level = %level, namespace = %namespace, "start: {} {} (timeout {}) [{}]", level, name, seconds_to_str(budget), namespace);
            } else {
                debug!(level = %level, namespace = %namespace, "start: {} {} (timeout {}) [{}]", level, name, seconds_to_str(budget), namespace);
            }
            job.sink()
                .emit(ACTION_START, Some(action_start_record(&level, &name, &namespace, budget)))
                .await;

            let outcome = match entered {
                Ok(deadline) => {
                    let attempt = AssertUnwindSafe(action.run(connection.clone(), deadline)).catch_unwind();
                    let timed = tokio::time::timeout_at(deadline, attempt).await;
                    match timed {
                        Ok(Ok(result)) => result,
                        Ok(Err(panic)) => Err(Failure::bug(format!(
                            "{name} panicked: {}",
                            panic_message(panic.as_ref())
                        ))),
                        Err(_) => Err(action.base().timeout().expired()),
                    }
                }
                Err(failure) => Err(failure),
            };
            let duration = action.base_mut().timeout_mut().finish();

            let failure = match outcome {
                Ok(returned) => {
                    if returned.is_some() {
                        connection = returned;
                        self.connection.clone_from(&connection);
                    }
                    report_end(&job, root, &level, &name, &namespace, budget, duration).await;
                    action.base_mut().log_action_results(false, duration).await;
                    continue;
                }
                Err(failure) => failure,
            };

            action.base_mut().set_result("fail", json!(failure.message));
            report_end(&job, root, &level, &name, &namespace, budget, duration).await;
            action.base_mut().log_action_results(true, duration).await;

            if failure.kind() == FailureKind::Timeout
                && root
                && Timeout::can_skip(action.base().parameters())
            {
                warn!(level = %level, "{} timed out, skipping to the next action", name);
                if ran {
                    self.cleanup_action(index, connection.clone()).await;
                }
                continue;
            }

            error!(level = %level, kind = %failure.kind(), "{} failed: {}", name, failure);
            let failure = if failure.triggers_diagnostics() {
                match self.diagnose(connection.as_ref()).await {
                    Ok(()) => failure,
                    Err(bug) => bug,
                }
            } else {
                failure
            };
            // An action whose scope could not be entered never ran.
            if ran {
                self.cleanup_action(index, connection).await;
            }
            return Err(failure);
        }
        Ok(connection)
    }

    /// Cleans every action that has not been cleaned since it last ran.
    ///
    /// Best effort: a failing cleanup is logged and the siblings are still
    /// cleaned.
    pub async fn cleanup(&mut self, connection: Option<SharedConnection>) {
        for index in 0..self.actions.len() {
            self.cleanup_action(index, connection.clone()).await;
        }
    }

    async fn cleanup_action(&mut self, index: usize, connection: Option<SharedConnection>) {
        let Some(action) = self.actions.get_mut(index) else {
            return;
        };
        if action.base().is_cleaned() {
            return;
        }
        debug!(level = %action.base().level(), "cleanup: {}", action.base().name());
        if let Err(failure) = action.cleanup(connection).await {
            error!(
                level = %action.base().level(),
                "Cleanup of {} failed: {}",
                action.base().name(),
                failure
            );
        }
        action.base_mut().set_cleaned(true);
    }

    /// Runs the diagnostics matching the triggers raised so far.
    ///
    /// Diagnostics only read; a failing diagnostic is logged. An unknown
    /// trigger is an engine bug.
    pub async fn diagnose(&self, connection: Option<&SharedConnection>) -> Result<()> {
        for trigger in self.job.take_triggers() {
            let diagnostic = self
                .job
                .diagnostics()
                .get(&trigger)
                .ok_or_else(|| Failure::bug(format!("Unknown diagnostic trigger '{trigger}'")))?;
            info!(trigger = %trigger, "Running diagnostic {}", diagnostic.name());
            if let Err(failure) = diagnostic.run(connection, &self.job).await {
                warn!(trigger = %trigger, "Diagnostic {} failed: {}", diagnostic.name(), failure);
            }
        }
        Ok(())
    }

    /// Describes the tree below this pipeline.
    ///
    /// Each entry carries the kind and name of the action; `verbose` adds
    /// the full attribute dump. Child pipelines nest under `pipeline`.
    #[must_use]
    pub fn describe(&self, verbose: bool) -> Value {
        let entries = self
            .actions
            .iter()
            .map(|action| {
                let mut entry = if verbose {
                    action.describe()
                } else {
                    json!({
                        "class": action.kind(),
                        "name": action.base().name(),
                        "level": action.base().level(),
                    })
                };
                if let (Some(pipeline), Value::Object(ref mut map)) =
                    (action.base().pipeline(), &mut entry)
                {
                    map.insert("pipeline".to_string(), pipeline.describe(verbose));
                }
                entry
            })
            .collect();
        Value::Array(entries)
    }
}

async fn report_end(
    job: &JobContext,
    root: bool,
    level: &str,
    name: &str,
    namespace: &str,
    budget: Duration,
    duration: Duration,
) {
    if root {
        info!(level = %level, namespace = %namespace, "end: {} {} (duration {}) [{}]", level, name, seconds_to_str(duration), namespace);
    } else {
        debug!(level = %level, namespace = %namespace, "end: {} {} (duration {}) [{}]", level, name, seconds_to_str(duration), namespace);
    }
    job.sink()
        .emit(ACTION_END, Some(action_end_record(level, name, namespace, budget, duration)))
        .await;
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}
