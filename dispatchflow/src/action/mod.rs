//! The action abstraction.
//!
//! An action is one node of the execution tree. Leaves do the actual work
//! (power a board, flash an image, type into a console); composites own a
//! child [`Pipeline`](crate::pipeline::Pipeline) built in
//! [`Action::populate`] and delegate `validate`, `run` and `cleanup` to it.
//!
//! Lifecycle of every action in a job:
//!
//! 1. created by a registry factory and attached with `Pipeline::add_action`
//!    (level, section, parameters and timeouts are assigned, then `populate`);
//! 2. `validate` once, before anything runs;
//! 3. `run` once per attempt;
//! 4. `cleanup` when `run` failed, or from the job-level cleanup.

mod base;
mod registry;

pub use base::{ActionBase, CommandPolicy, Parameters};
pub use registry::{ActionConstructor, ActionRegistry};

use async_trait::async_trait;
use serde_json::Value;
use std::fmt::Debug;

use crate::connection::SharedConnection;
use crate::errors::Result;
use crate::timeout::Deadline;

/// Capability interface implemented by every action kind.
///
/// Only [`Action::base`], [`Action::base_mut`] and [`Action::kind`] are
/// required; the other methods default to the generic behaviour of
/// [`ActionBase`].
#[async_trait]
pub trait Action: Send + Sync + Debug {
    /// Returns the shared state of the action.
    fn base(&self) -> &ActionBase;

    /// Returns the shared state of the action, mutably.
    fn base_mut(&mut self) -> &mut ActionBase;

    /// Returns the kind of the action, used in tree descriptions.
    fn kind(&self) -> &'static str;

    /// Builds the child pipeline of a composite action.
    ///
    /// Called by `Pipeline::add_action` once parameters and timeouts are
    /// resolved.
    fn populate(&mut self, _parameters: &Parameters) -> Result<()> {
        Ok(())
    }

    /// Checks the action before the job runs.
    ///
    /// Problems are recorded with [`ActionBase::add_error`]; returning a
    /// job-configuration failure records its message the same way. Must not
    /// change any dynamic state.
    fn validate(&mut self) -> Result<()> {
        self.base_mut().validate_base()
    }

    /// Runs the action within `max_end_time`.
    ///
    /// Returns the connection the next action should use; `None` keeps the
    /// previous one.
    async fn run(
        &mut self,
        connection: Option<SharedConnection>,
        max_end_time: Deadline,
    ) -> Result<Option<SharedConnection>> {
        self.base_mut().run_default(connection, max_end_time).await
    }

    /// Undoes what a failed `run` may have left behind.
    ///
    /// Must be safe after a partially completed `run`.
    async fn cleanup(&mut self, connection: Option<SharedConnection>) -> Result<()> {
        self.base_mut().cleanup_default(connection).await
    }

    /// Returns a structured dump of the action's attributes.
    fn describe(&self) -> Value {
        self.base().describe(self.kind())
    }
}
