//! Side-channel checks run after a failure.
//!
//! An action that wants a diagnostic adds a trigger key to the job before
//! failing; the pipeline consumes the keys and runs the matching
//! diagnostics before re-raising. Diagnostics only observe: they never
//! change the connection or the context store.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::connection::SharedConnection;
use crate::errors::Result;
use crate::job::JobContext;
use crate::process;

/// Budget of each command a built-in diagnostic runs.
pub const DIAGNOSTIC_COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

/// A read-only check run when its trigger was raised.
#[async_trait]
pub trait Diagnostic: Send + Sync + Debug {
    /// Returns the key actions raise to request this diagnostic.
    fn trigger(&self) -> &str;

    /// Returns the name used in logs.
    fn name(&self) -> &str {
        "diagnose"
    }

    /// Runs the check.
    async fn run(&self, connection: Option<&SharedConnection>, job: &JobContext) -> Result<()>;
}

/// Lookup from trigger keys to diagnostics.
#[derive(Debug, Clone, Default)]
pub struct DiagnosticRegistry {
    entries: BTreeMap<String, Arc<dyn Diagnostic>>,
}

impl DiagnosticRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry holding the built-in diagnostics.
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(DiagnoseNetwork));
        registry
    }

    /// Registers `diagnostic` under its trigger, replacing any previous one.
    pub fn register(&mut self, diagnostic: Arc<dyn Diagnostic>) {
        self.entries.insert(diagnostic.trigger().to_string(), diagnostic);
    }

    /// Returns the diagnostic for `trigger`.
    #[must_use]
    pub fn get(&self, trigger: &str) -> Option<Arc<dyn Diagnostic>> {
        self.entries.get(trigger).cloned()
    }

    /// Returns the registered triggers in sorted order.
    #[must_use]
    pub fn triggers(&self) -> Vec<&str> {
        self.entries.keys().map(String::as_str).collect()
    }
}

/// Logs the network state of the dispatcher host.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiagnoseNetwork;

#[async_trait]
impl Diagnostic for DiagnoseNetwork {
    fn trigger(&self) -> &str {
        "network"
    }

    fn name(&self) -> &str {
        "diagnose-network"
    }

    async fn run(&self, _connection: Option<&SharedConnection>, _job: &JobContext) -> Result<()> {
        for command in ["ip addr", "ip route"] {
            let deadline = Instant::now() + DIAGNOSTIC_COMMAND_TIMEOUT;
            match process::run_command_line(command, deadline).await {
                Ok(output) => {
                    info!(target: "dispatchflow::diagnostics", "{}:\n{}", command, output.combined());
                }
                Err(failure) => {
                    warn!(target: "dispatchflow::diagnostics", "Unable to run '{}': {}", command, failure);
                }
            }
        }
        Ok(())
    }
}
