//! Named coordination channels shared by the actions of a job.
//!
//! A protocol is enabled when the job definition names it. Actions declare
//! calls under `parameters.protocols[<name>]`; each call spec carries the
//! name of the action that makes it, plus whatever the protocol needs.

use async_trait::async_trait;
use serde_json::Value;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use crate::errors::Result;

/// A coordination channel (multinode messaging, VLAN setup, containers).
#[async_trait]
pub trait Protocol: Send + Sync + Debug {
    /// Returns the name used as key in job definitions.
    fn name(&self) -> &str;

    /// Returns the set-up order; lower levels are set up first.
    fn level(&self) -> u32 {
        0
    }

    /// Returns configuration problems found when the protocol was built.
    fn errors(&self) -> Vec<String> {
        Vec::new()
    }

    /// Prepares the protocol before the first action runs.
    async fn set_up(&self) -> Result<()> {
        Ok(())
    }

    /// Returns a replacement connection timeout when `call` needs longer
    /// than `connection_timeout` allows.
    fn check_timeout(&self, _connection_timeout: Duration, _call: &Value) -> Result<Option<Duration>> {
        Ok(None)
    }

    /// Makes one call on behalf of `action` and returns the reply.
    async fn call(&self, call: &Value, action: &str) -> Result<Value>;

    /// Extracts the `(key, value)` to store from a reply, if any.
    fn collate(&self, _reply: &Value, _call: &Value) -> Option<(String, Value)> {
        None
    }

    /// Releases whatever `set_up` acquired. Runs in the finalize phase.
    async fn finalise_protocol(&self) -> Result<()> {
        Ok(())
    }
}

/// Keeps the protocols named in `definitions`, ordered by level.
#[must_use]
pub fn select(
    available: &[Arc<dyn Protocol>],
    definitions: &serde_json::Map<String, Value>,
) -> Vec<Arc<dyn Protocol>> {
    let mut selected: Vec<Arc<dyn Protocol>> = available
        .iter()
        .filter(|protocol| definitions.contains_key(protocol.name()))
        .cloned()
        .collect();
    selected.sort_by_key(|protocol| protocol.level());
    selected
}
