//! A local interactive shell driven by the job.
//!
//! ```yaml
//! - shell:
//!     namespace: host
//!     shell: /bin/bash
//!     commands:
//!       - uname -a
//!       - lsusb
//! ```
//!
//! The session is left in the namespace's shared connection slot so the
//! finalize phase can drain and close it.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::info;

use crate::action::{Action, ActionBase, Parameters};
use crate::connection::{SharedConnection, ShellSession};
use crate::errors::{Failure, Result};
use crate::timeout::Deadline;

/// Shell spawned when the job block does not name one.
pub const DEFAULT_SHELL: &str = "/bin/sh";

/// Marker echoed after each command when no prompt is configured.
const DONE_MARKER: &str = "dispatchflow-done";

fn string_list(parameters: &Parameters, key: &str) -> Result<Vec<String>> {
    match parameters.get(key) {
        None => Ok(Vec::new()),
        Some(Value::String(single)) => Ok(vec![single.clone()]),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| {
                item.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| Failure::job(format!("'{key}' must only hold strings, found {item}")))
            })
            .collect(),
        Some(other) => Err(Failure::job(format!("'{key}' must be a string or a list, found {other}"))),
    }
}

/// Composite: spawn the shell, then run the commands in it.
#[derive(Debug)]
pub struct ShellAction {
    base: ActionBase,
}

impl ShellAction {
    /// Creates the action.
    #[must_use]
    pub fn new() -> Self {
        Self {
            base: ActionBase::new(
                "shell-session",
                "run commands in a local shell",
                "spawn a local shell and run the listed commands in it",
            )
            .with_section("test"),
        }
    }
}

impl Default for ShellAction {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Action for ShellAction {
    fn base(&self) -> &ActionBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut ActionBase {
        &mut self.base
    }

    fn kind(&self) -> &'static str {
        "shell"
    }

    fn populate(&mut self, parameters: &Parameters) -> Result<()> {
        let mut pipeline = self.base.new_pipeline()?;
        pipeline.add_action(Box::new(ConnectShell::new()), None)?;
        let commands = string_list(parameters, "commands")?;
        pipeline.add_action(Box::new(RunShellCommands::new(commands)), None)?;
        self.base.set_pipeline(pipeline);
        Ok(())
    }
}

/// Spawns the shell and hands it on as the active connection.
#[derive(Debug)]
pub struct ConnectShell {
    base: ActionBase,
    session: Option<SharedConnection>,
}

impl ConnectShell {
    /// Creates the action.
    #[must_use]
    pub fn new() -> Self {
        Self {
            base: ActionBase::new("connect-shell", "spawn a shell", "start the local shell process"),
            session: None,
        }
    }
}

impl Default for ConnectShell {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Action for ConnectShell {
    fn base(&self) -> &ActionBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut ActionBase {
        &mut self.base
    }

    fn kind(&self) -> &'static str {
        "connect-shell"
    }

    fn validate(&mut self) -> Result<()> {
        if let Err(failure) = string_list(self.base.parameters(), "prompts") {
            self.base.add_error(failure.message);
        }
        self.base.validate_base()
    }

    async fn run(
        &mut self,
        _connection: Option<SharedConnection>,
        _max_end_time: Deadline,
    ) -> Result<Option<SharedConnection>> {
        let shell = self
            .base
            .parameters()
            .get("shell")
            .and_then(Value::as_str)
            .unwrap_or(DEFAULT_SHELL)
            .to_string();
        let mut prompts = string_list(self.base.parameters(), "prompts")?;
        if prompts.is_empty() {
            prompts.push(format!(r"{DONE_MARKER}-(\d+)"));
        }

        let session = ShellSession::spawn(self.base.namespace(), &shell)?
            .with_prompts(prompts)
            .with_timeout(self.base.connection_timeout().duration());
        let session: SharedConnection = Arc::new(session);
        self.base
            .job()?
            .store()
            .set_shared_connection(self.base.namespace(), Arc::clone(&session));
        self.base.set_result("shell", json!(shell));
        self.session = Some(Arc::clone(&session));
        Ok(Some(session))
    }

    async fn cleanup(&mut self, _connection: Option<SharedConnection>) -> Result<()> {
        if let Some(session) = self.session.take() {
            info!("Closing shell {}", session.name());
            session.finalise().await;
        }
        Ok(())
    }
}

/// Sends each command and records its output.
#[derive(Debug)]
pub struct RunShellCommands {
    base: ActionBase,
    commands: Vec<String>,
}

impl RunShellCommands {
    /// Creates the action for `commands`.
    #[must_use]
    pub fn new(commands: Vec<String>) -> Self {
        Self {
            base: ActionBase::new(
                "run-shell-commands",
                "run shell commands",
                "send each command to the shell and wait for it to complete",
            ),
            commands,
        }
    }
}

#[async_trait]
impl Action for RunShellCommands {
    fn base(&self) -> &ActionBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut ActionBase {
        &mut self.base
    }

    fn kind(&self) -> &'static str {
        "run-shell-commands"
    }

    fn validate(&mut self) -> Result<()> {
        if self.commands.is_empty() {
            self.base.add_error("No commands to run in the shell");
        }
        self.base.validate_base()
    }

    async fn run(
        &mut self,
        connection: Option<SharedConnection>,
        max_end_time: Deadline,
    ) -> Result<Option<SharedConnection>> {
        let connection = connection.ok_or_else(|| {
            Failure::bug(format!("{} needs an active connection", self.base.name()))
        })?;
        let marked = string_list(self.base.parameters(), "prompts")?.is_empty();

        let mut outputs = Vec::with_capacity(self.commands.len());
        for command in self.commands.clone() {
            let line = if marked {
                format!("{command}; echo {DONE_MARKER}-$?")
            } else {
                command.clone()
            };
            connection.sendline(&line, self.base.character_delay()).await?;
            self.base.wait(&connection, Some(max_end_time)).await?;
            let output = connection.before();
            info!("{}: {}", command, output.trim_end());
            outputs.push(json!({ "command": command, "output": output }));
        }
        let outputs = Value::Array(outputs);
        self.base
            .set_namespace_data(self.base.name(), "shell", "outputs", outputs.clone())?;
        self.base.set_result("outputs", outputs);
        Ok(Some(connection))
    }
}
