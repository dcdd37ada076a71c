//! Admin-defined device commands callable from a job.

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::time::Instant;
use tracing::info;

use crate::action::{Action, ActionBase, CommandPolicy, Parameters};
use crate::connection::SharedConnection;
use crate::errors::{Failure, Result};
use crate::job::UserCommand;
use crate::timeout::{Deadline, CLEANUP_TIMEOUT};

/// Runs `commands.users[name].do` from the device configuration, and its
/// `undo` on cleanup.
///
/// Job block: `- command: {name: usb-mux}`.
#[derive(Debug)]
pub struct CommandAction {
    base: ActionBase,
    command: Option<UserCommand>,
    ran: bool,
}

impl CommandAction {
    /// Creates the action.
    #[must_use]
    pub fn new() -> Self {
        Self {
            base: ActionBase::new(
                "user-command",
                "execute one of the commands listed by the admin",
                "execute user command",
            )
            .with_section("command"),
            command: None,
            ran: false,
        }
    }

    fn command_name(&self) -> Option<&str> {
        self.base.parameters().get("name").and_then(Value::as_str)
    }
}

impl Default for CommandAction {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Action for CommandAction {
    fn base(&self) -> &ActionBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut ActionBase {
        &mut self.base
    }

    fn kind(&self) -> &'static str {
        "command"
    }

    fn populate(&mut self, parameters: &Parameters) -> Result<()> {
        let job = self.base.job()?;
        self.command = parameters
            .get("name")
            .and_then(Value::as_str)
            .and_then(|name| job.device().commands.users.get(name))
            .cloned();
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        match self.command_name().map(str::to_string) {
            None => self.base.add_error("missing 'name' of the user command"),
            Some(name) if self.command.is_none() => {
                self.base.add_error(format!("Unknown user command '{name}'"));
            }
            Some(_) => {}
        }
        self.base.validate_base()
    }

    async fn run(
        &mut self,
        connection: Option<SharedConnection>,
        max_end_time: Deadline,
    ) -> Result<Option<SharedConnection>> {
        let connection = self.base.run_default(connection, max_end_time).await?;
        let command = self
            .command
            .clone()
            .ok_or_else(|| Failure::bug(format!("{} ran without a command", self.base.name())))?;
        let name = self.command_name().unwrap_or_default().to_string();

        info!("Running user command '{}'", name);
        self.ran = true;
        self.base
            .run_command(&command.run, CommandPolicy::default().allow_silent(), max_end_time)
            .await?;
        self.base.set_result("success", json!(name));
        Ok(connection)
    }

    async fn cleanup(&mut self, _connection: Option<SharedConnection>) -> Result<()> {
        if !self.ran {
            return Ok(());
        }
        let Some(undo) = self.command.as_ref().and_then(|c| c.undo.clone()) else {
            return Ok(());
        };
        info!("Running cleanup for user command '{}'", self.command_name().unwrap_or_default());
        self.ran = false;
        let deadline = Instant::now() + CLEANUP_TIMEOUT;
        self.base
            .run_command(&undo, CommandPolicy::default().allow_fail().allow_silent(), deadline)
            .await?;
        Ok(())
    }
}
