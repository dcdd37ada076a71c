//! State and default behaviour shared by every action.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info};

use crate::connection::SharedConnection;
use crate::context::{DataPath, DEFAULT_NAMESPACE};
use crate::errors::{Failure, Result};
use crate::events::{ResultRecord, ResultStatus, ACTION_RESULT};
use crate::job::JobContext;
use crate::pipeline::{ParentInfo, Pipeline};
use crate::process::{self, CommandOutput};
use crate::timeout::{Deadline, Timeout, ACTION_TIMEOUT, CONNECTION_TIMEOUT};
use crate::utils::format_duration;

/// Parameters of an action: the block from the job definition.
pub type Parameters = Map<String, Value>;

/// How [`ActionBase::run_command`] treats the command outcome.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommandPolicy {
    /// A non-zero exit is logged instead of failing the action.
    pub allow_fail: bool,
    /// A command without output is not worth a log line.
    pub allow_silent: bool,
}

impl CommandPolicy {
    /// Tolerates a non-zero exit.
    #[must_use]
    pub const fn allow_fail(mut self) -> Self {
        self.allow_fail = true;
        self
    }

    /// Tolerates a command without output.
    #[must_use]
    pub const fn allow_silent(mut self) -> Self {
        self.allow_silent = true;
        self
    }
}

fn positive_count(value: &Value, key: &str, action: &str) -> Result<u32> {
    value
        .as_u64()
        .filter(|n| *n > 0)
        .and_then(|n| u32::try_from(n).ok())
        .ok_or_else(|| Failure::job(format!("Invalid {key} value for {action}: {value}")))
}

/// State carried by every action.
///
/// Concrete actions embed one and expose it through
/// [`Action::base`](super::Action::base).
#[derive(Debug)]
pub struct ActionBase {
    name: String,
    summary: String,
    description: String,
    section: String,
    level: String,
    parameters: Parameters,
    frozen: bool,
    results: Map<String, Value>,
    errors: Vec<String>,
    timeout: Timeout,
    connection_timeout: Timeout,
    max_retries: u32,
    character_delay: u64,
    force_prompt: bool,
    pipeline: Option<Pipeline>,
    job: Option<Arc<JobContext>>,
    cleaned: bool,
}

impl ActionBase {
    /// Creates the state of an action.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        summary: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        let name = name.into();
        Self {
            timeout: Timeout::new(name.clone(), ACTION_TIMEOUT),
            connection_timeout: Timeout::new(name.clone(), CONNECTION_TIMEOUT),
            name,
            summary: summary.into(),
            description: description.into(),
            section: String::new(),
            level: String::new(),
            parameters: Parameters::new(),
            frozen: false,
            results: Map::new(),
            errors: Vec::new(),
            max_retries: 1,
            character_delay: 0,
            force_prompt: false,
            pipeline: None,
            job: None,
            cleaned: false,
        }
    }

    /// Sets the section (deploy, boot, test, finalize...).
    ///
    /// Actions attached below a composite inherit the composite's section.
    #[must_use]
    pub fn with_section(mut self, section: impl Into<String>) -> Self {
        self.section = section.into();
        self
    }

    /// Sets default parameters, merged under whatever the job supplies.
    #[must_use]
    pub fn with_default_parameters(mut self, parameters: Parameters) -> Self {
        self.parameters = parameters;
        self
    }

    /// Enables the corruption-tolerant prompt wait.
    #[must_use]
    pub const fn with_force_prompt(mut self) -> Self {
        self.force_prompt = true;
        self
    }

    /// Returns the action name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the one-line summary.
    #[must_use]
    pub fn summary(&self) -> &str {
        &self.summary
    }

    /// Returns the description.
    #[must_use]
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Returns the section.
    #[must_use]
    pub fn section(&self) -> &str {
        &self.section
    }

    /// Returns the dotted level, empty until attached.
    #[must_use]
    pub fn level(&self) -> &str {
        &self.level
    }

    /// Returns the parameters.
    #[must_use]
    pub const fn parameters(&self) -> &Parameters {
        &self.parameters
    }

    /// Returns the namespace the action works in.
    #[must_use]
    pub fn namespace(&self) -> &str {
        self.parameters
            .get("namespace")
            .and_then(Value::as_str)
            .unwrap_or(DEFAULT_NAMESPACE)
    }

    /// Returns the results recorded so far.
    #[must_use]
    pub const fn results(&self) -> &Map<String, Value> {
        &self.results
    }

    /// Records a result value.
    pub fn set_result(&mut self, key: impl Into<String>, value: Value) {
        self.results.insert(key.into(), value);
    }

    /// Returns the errors of this action alone.
    #[must_use]
    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    /// Records a validation error.
    pub fn add_error(&mut self, error: impl Into<String>) {
        self.errors.push(error.into());
    }

    /// Returns the errors of this action followed by those of its subtree.
    #[must_use]
    pub fn all_errors(&self) -> Vec<String> {
        let mut errors = self.errors.clone();
        if let Some(ref pipeline) = self.pipeline {
            errors.extend(pipeline.errors());
        }
        errors
    }

    /// Returns true when neither this action nor its subtree has errors.
    #[must_use]
    pub fn valid(&self) -> bool {
        self.all_errors().is_empty()
    }

    /// Returns the action timeout.
    #[must_use]
    pub const fn timeout(&self) -> &Timeout {
        &self.timeout
    }

    /// Returns the action timeout, mutably.
    pub fn timeout_mut(&mut self) -> &mut Timeout {
        &mut self.timeout
    }

    /// Returns the timeout applied to the connection handed on.
    #[must_use]
    pub const fn connection_timeout(&self) -> &Timeout {
        &self.connection_timeout
    }

    /// Returns how many attempts a retry wrapper makes.
    #[must_use]
    pub const fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Returns true when attempts repeat regardless of success.
    #[must_use]
    pub fn is_repeat(&self) -> bool {
        self.parameters.contains_key("repeat")
    }

    /// Returns the per-character send delay in milliseconds.
    #[must_use]
    pub const fn character_delay(&self) -> u64 {
        self.character_delay
    }

    /// Returns true when prompt waits probe the device.
    #[must_use]
    pub const fn force_prompt(&self) -> bool {
        self.force_prompt
    }

    /// Switches the corruption-tolerant prompt wait on or off.
    pub fn set_force_prompt(&mut self, force_prompt: bool) {
        self.force_prompt = force_prompt;
    }

    /// Returns the child pipeline of a composite action.
    #[must_use]
    pub const fn pipeline(&self) -> Option<&Pipeline> {
        self.pipeline.as_ref()
    }

    /// Returns the child pipeline, mutably.
    pub fn pipeline_mut(&mut self) -> Option<&mut Pipeline> {
        self.pipeline.as_mut()
    }

    /// Installs the child pipeline built in `populate`.
    pub fn set_pipeline(&mut self, pipeline: Pipeline) {
        self.pipeline = Some(pipeline);
    }

    /// Returns the owning job.
    pub fn job(&self) -> Result<Arc<JobContext>> {
        self.job
            .clone()
            .ok_or_else(|| Failure::bug(format!("{} is not attached to a job", self.name)))
    }

    /// Creates an empty pipeline whose actions will sit below this one.
    pub fn new_pipeline(&self) -> Result<Pipeline> {
        let parent = ParentInfo {
            name: self.name.clone(),
            level: self.level.clone(),
            section: self.section.clone(),
        };
        Ok(Pipeline::with_parent(self.job()?, parent, self.parameters.clone()))
    }

    pub(crate) fn attach(&mut self, job: Arc<JobContext>, level: String, section: Option<&str>) {
        self.job = Some(job);
        self.level = level;
        if let Some(section) = section {
            self.section = section.to_string();
        }
    }

    /// Merges `parameters` over the defaults and derives the retry and
    /// delay settings from them and from the device constants.
    pub(crate) fn apply_parameters(&mut self, parameters: &Parameters) -> Result<()> {
        if self.frozen {
            return Err(Failure::bug(format!(
                "Parameters of {} cannot change after population",
                self.name
            )));
        }
        for (key, value) in parameters {
            self.parameters.insert(key.clone(), value.clone());
        }

        let job = self.job()?;
        let device = job.device();
        match (self.parameters.get("failure_retry"), self.parameters.get("repeat")) {
            (Some(_), Some(_)) => {
                return Err(Failure::job(format!(
                    "Unable to use repeat and failure_retry in {}",
                    self.name
                )));
            }
            (Some(value), None) => self.max_retries = positive_count(value, "failure_retry", &self.name)?,
            (None, Some(value)) => self.max_retries = positive_count(value, "repeat", &self.name)?,
            (None, None) => {
                if let Some(retries) = device.constant_count("failure_retry") {
                    self.max_retries = retries;
                }
                if self.section == "boot" {
                    if let Some(retries) = device.constant_count("boot_retry") {
                        self.max_retries = retries;
                    }
                }
            }
        }
        if let Some(delay) = device.character_delay(&self.section) {
            self.character_delay = delay;
        }
        Ok(())
    }

    pub(crate) fn set_timeouts(&mut self, action: Option<Duration>, connection: Option<Duration>) {
        if let Some(duration) = action {
            self.timeout.set_duration(duration);
        }
        if let Some(duration) = connection {
            self.connection_timeout.set_duration(duration);
        }
    }

    pub(crate) fn freeze(&mut self) {
        self.frozen = true;
    }

    pub(crate) const fn is_cleaned(&self) -> bool {
        self.cleaned
    }

    pub(crate) fn set_cleaned(&mut self, cleaned: bool) {
        self.cleaned = cleaned;
    }

    /// Clears results and errors of this action and its whole subtree.
    pub(crate) fn clear_state(&mut self) {
        self.results.clear();
        self.errors.clear();
        if let Some(ref mut pipeline) = self.pipeline {
            pipeline.clear_state();
        }
    }

    /// Generic validation: naming rules, mandatory texts, then the subtree.
    pub fn validate_base(&mut self) -> Result<()> {
        if self.name.is_empty() {
            self.add_error("Invalid name for action");
        } else {
            if self.name.chars().any(char::is_whitespace) {
                self.add_error(format!(
                    "Whitespace must not be used in action names, only descriptive names: '{}'",
                    self.name
                ));
            }
            if self.name.contains('_') {
                self.add_error(format!("Use - instead of _ in action names: '{}'", self.name));
            }
        }
        if self.summary.is_empty() {
            self.add_error(format!("action {} does not have a summary", self.name));
        }
        if self.description.is_empty() {
            self.add_error(format!("action {} does not have a description", self.name));
        }
        if self.section.is_empty() {
            self.add_error(format!("{} action has no section set", self.name));
        }
        if let Some(ref mut pipeline) = self.pipeline {
            pipeline.validate_actions()?;
        }
        Ok(())
    }

    /// Default `run`: protocol calls, then the child pipeline if any,
    /// otherwise hand the connection on with this action's connection timeout.
    pub async fn run_default(
        &mut self,
        connection: Option<SharedConnection>,
        max_end_time: Deadline,
    ) -> Result<Option<SharedConnection>> {
        self.call_protocols().await?;
        if let Some(ref mut pipeline) = self.pipeline {
            return pipeline.run_actions(connection, max_end_time).await;
        }
        if let Some(ref conn) = connection {
            conn.set_timeout(self.connection_timeout.duration());
        }
        Ok(connection)
    }

    /// Runs the child pipeline, failing if the action has none.
    pub async fn run_pipeline(
        &mut self,
        connection: Option<SharedConnection>,
        max_end_time: Deadline,
    ) -> Result<Option<SharedConnection>> {
        match self.pipeline {
            Some(ref mut pipeline) => pipeline.run_actions(connection, max_end_time).await,
            None => Err(Failure::bug(format!("{} has no internal pipeline", self.name))),
        }
    }

    /// Default `cleanup`: clean the subtree, best effort.
    pub async fn cleanup_default(&mut self, connection: Option<SharedConnection>) -> Result<()> {
        if let Some(ref mut pipeline) = self.pipeline {
            pipeline.cleanup(connection).await;
        }
        Ok(())
    }

    /// Makes the protocol calls this action declares.
    ///
    /// `parameters.protocols[<protocol>]` lists call specifications; those
    /// whose `action` is this action's name run in declaration order and
    /// each collated reply is stored under the protocol's name.
    pub async fn call_protocols(&mut self) -> Result<()> {
        let Some(Value::Object(declared)) = self.parameters.get("protocols").cloned() else {
            return Ok(());
        };
        let job = self.job()?;
        for protocol in job.protocols() {
            let Some(Value::Array(calls)) = declared.get(protocol.name()) else {
                continue;
            };
            for call in calls {
                if call.get("action").and_then(Value::as_str) != Some(self.name.as_str()) {
                    continue;
                }
                if let Some(duration) =
                    protocol.check_timeout(self.connection_timeout.duration(), call)?
                {
                    self.connection_timeout.set_duration(duration);
                }
                debug!(action = %self.name, protocol = %protocol.name(), "Calling protocol");
                let reply = protocol.call(call, &self.name).await?;
                if let Some((key, value)) = protocol.collate(&reply, call) {
                    self.set_namespace_data(protocol.name(), protocol.name(), &key, value)?;
                }
            }
        }
        Ok(())
    }

    fn data_path<'a>(&'a self, action: &'a str, label: &'a str, key: &'a str) -> DataPath<'a> {
        DataPath::new(self.namespace(), action, label, key)
    }

    /// Reads a deep copy of a value from this action's namespace.
    pub fn get_namespace_data(&self, action: &str, label: &str, key: &str) -> Result<Option<Value>> {
        Ok(self.job()?.store().get(self.data_path(action, label, key)))
    }

    /// Reads a value from this action's namespace without copying it.
    pub fn get_namespace_data_shared(
        &self,
        action: &str,
        label: &str,
        key: &str,
    ) -> Result<Option<Arc<Value>>> {
        Ok(self.job()?.store().get_shared(self.data_path(action, label, key)))
    }

    /// Reads and deserializes a value from this action's namespace.
    pub fn get_namespace_value<T: DeserializeOwned>(
        &self,
        action: &str,
        label: &str,
        key: &str,
    ) -> Result<Option<T>> {
        self.get_namespace_data(action, label, key)?
            .map(|value| {
                serde_json::from_value(value).map_err(|err| {
                    Failure::bug(format!("Unexpected data at {action}/{label}/{key}: {err}"))
                })
            })
            .transpose()
    }

    /// Stores a value in this action's namespace.
    pub fn set_namespace_data(&self, action: &str, label: &str, key: &str, value: Value) -> Result<()> {
        self.job()?.store().set(self.data_path(action, label, key), value);
        Ok(())
    }

    /// Serializes and stores a value in this action's namespace.
    pub fn set_namespace_value<T: Serialize>(
        &self,
        action: &str,
        label: &str,
        key: &str,
        value: &T,
    ) -> Result<()> {
        let value = serde_json::to_value(value)
            .map_err(|err| Failure::bug(format!("Unable to store {action}/{label}/{key}: {err}")))?;
        self.set_namespace_data(action, label, key, value)
    }

    /// Waits for the connection prompt within this action's budget.
    ///
    /// Without `max_end_time` the deadline is the start of the current
    /// scope plus the action timeout.
    pub async fn wait(
        &self,
        connection: &SharedConnection,
        max_end_time: Option<Deadline>,
    ) -> Result<usize> {
        if !connection.is_connected() {
            return Err(Failure::infrastructure(format!(
                "{}: connection {} is closed",
                self.name,
                connection.name()
            )));
        }
        let deadline = max_end_time.unwrap_or_else(|| {
            self.timeout.start().unwrap_or_else(Instant::now) + self.timeout.duration()
        });
        let remaining = deadline.saturating_duration_since(Instant::now());
        debug!(
            action = %self.name,
            prompts = ?connection.prompt_str(),
            "Waiting for prompt ({} seconds)",
            remaining.as_secs()
        );
        if self.force_prompt {
            connection.force_prompt_wait(remaining).await
        } else {
            connection.wait(Some(deadline)).await
        }
    }

    /// Runs an external command and records its return code.
    pub async fn run_command(
        &mut self,
        command_line: &str,
        policy: CommandPolicy,
        deadline: Deadline,
    ) -> Result<CommandOutput> {
        let output = process::run_command_line(command_line, deadline).await?;
        if let Some(code) = output.status.code() {
            self.results.insert("returncode".to_string(), json!(code));
        }
        if !output.status.success() {
            if policy.allow_fail {
                info!(action = %self.name, "Ignoring failure of '{}'", command_line);
            } else {
                error!(action = %self.name, "'{}' failed", command_line);
                return Err(Failure::infrastructure(format!(
                    "Unable to run '{command_line}': {}",
                    output.combined().trim()
                )));
            }
        }
        if output.stdout.is_empty() && output.stderr.is_empty() && !policy.allow_silent {
            debug!(action = %self.name, "'{}' produced no output", command_line);
        }
        Ok(output)
    }

    /// Emits the result record of this run.
    ///
    /// Nothing is emitted for a successful run without results.
    pub async fn log_action_results(&mut self, failed: bool, duration: Duration) {
        if self.results.is_empty() && !failed {
            return;
        }
        let Some(job) = self.job.clone() else {
            return;
        };
        let record = ResultRecord::new(
            self.namespace(),
            self.name.clone(),
            self.level.clone(),
            duration,
            ResultStatus::from_failed(failed),
        )
        .with_extra(self.results.clone());
        job.sink().emit(ACTION_RESULT, Some(record.to_value())).await;

        self.results
            .insert("duration".to_string(), json!(format_duration(duration)));
        self.results.insert(
            "timeout".to_string(),
            json!(self.timeout.duration().as_secs()),
        );
    }

    /// Structured dump of the public attributes.
    #[must_use]
    pub fn describe(&self, kind: &str) -> Value {
        json!({
            "class": kind,
            "name": self.name,
            "summary": self.summary,
            "description": self.description,
            "section": self.section,
            "level": self.level,
            "max_retries": self.max_retries,
            "timeout": self.timeout.duration().as_secs(),
            "connection_timeout": self.connection_timeout.duration().as_secs(),
            "character_delay": self.character_delay,
            "force_prompt": self.force_prompt,
            "parameters": Value::Object(self.parameters.clone()),
        })
    }
}
