//! Builds a [`Job`] from a job definition and a device configuration.

use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;

use super::{DeviceConfig, Job, JobContext, JobDefinition};
use crate::action::{ActionRegistry, Parameters};
use crate::builtin::FinalizeAction;
use crate::context::DEFAULT_NAMESPACE;
use crate::diagnostics::DiagnosticRegistry;
use crate::errors::{Failure, Result};
use crate::events::{EventSink, NoOpEventSink};
use crate::pipeline::Pipeline;
use crate::protocols::{self, Protocol};
use crate::timeout::Timeout;

/// Turns job definitions into runnable jobs.
///
/// Holds what stays the same between jobs on one dispatcher: the action
/// registry, the available protocols, the diagnostics and the record sink.
#[derive(Clone)]
pub struct JobParser {
    registry: ActionRegistry,
    protocols: Vec<Arc<dyn Protocol>>,
    diagnostics: DiagnosticRegistry,
    sink: Arc<dyn EventSink>,
}

impl Default for JobParser {
    fn default() -> Self {
        Self {
            registry: ActionRegistry::with_builtins(),
            protocols: Vec::new(),
            diagnostics: DiagnosticRegistry::with_builtins(),
            sink: Arc::new(NoOpEventSink),
        }
    }
}

impl JobParser {
    /// Creates a parser with the built-in actions and diagnostics.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the action registry.
    #[must_use]
    pub fn with_registry(mut self, registry: ActionRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Sets the protocols a job may enable.
    #[must_use]
    pub fn with_protocols(mut self, protocols: Vec<Arc<dyn Protocol>>) -> Self {
        self.protocols = protocols;
        self
    }

    /// Replaces the diagnostic registry.
    #[must_use]
    pub fn with_diagnostics(mut self, diagnostics: DiagnosticRegistry) -> Self {
        self.diagnostics = diagnostics;
        self
    }

    /// Sets the sink the parsed jobs report to.
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Returns the action registry, for registering more kinds.
    pub fn registry_mut(&mut self) -> &mut ActionRegistry {
        &mut self.registry
    }

    /// Parses a YAML job definition into a job with a fresh id.
    pub fn parse(&self, yaml: &str, device: DeviceConfig) -> Result<Job> {
        let definition = JobDefinition::from_yaml_str(yaml)?;
        self.build(definition, device, uuid::Uuid::new_v4().to_string())
    }

    /// Builds the job `job_id` from an already parsed definition.
    ///
    /// Every action block gets the `common` namespace unless it names one,
    /// protocols named in the definition are enabled in level order, and a
    /// finalize action closes the root pipeline.
    pub fn build(&self, mut definition: JobDefinition, device: DeviceConfig, job_id: impl Into<String>) -> Result<Job> {
        let job_timeout = definition
            .timeouts
            .job
            .as_ref()
            .ok_or_else(|| Failure::job("Missing job timeout (timeouts.job)"))?;
        let duration = Timeout::parse(job_timeout)?;

        let context = Arc::new(
            JobContext::new(job_id, device)
                .with_timeouts(definition.timeouts.clone())
                .with_diagnostics(self.diagnostics.clone())
                .with_protocols(protocols::select(&self.protocols, &definition.protocols))
                .with_sink(Arc::clone(&self.sink)),
        );

        let mut pipeline = Pipeline::new(Arc::clone(&context));
        for block in &mut definition.actions {
            let (kind, parameters) = block_parameters(block)?;
            let action = self.registry.create(&kind, parameters)?;
            pipeline.add_action(action, Some(parameters.clone()))?;
        }

        let mut finalize = Parameters::new();
        finalize.insert("namespace".to_string(), Value::String(DEFAULT_NAMESPACE.to_string()));
        pipeline.add_action(Box::new(FinalizeAction::new()), Some(finalize))?;

        Ok(Job::new(context, definition, pipeline, duration))
    }
}

impl fmt::Debug for JobParser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobParser")
            .field("registry", &self.registry)
            .field("protocols", &self.protocols)
            .field("diagnostics", &self.diagnostics)
            .finish_non_exhaustive()
    }
}

// A block is `{kind: parameters}`; missing parameters become an empty map.
fn block_parameters(block: &mut Map<String, Value>) -> Result<(String, &mut Parameters)> {
    if block.len() != 1 {
        return Err(Failure::job(format!(
            "An action block needs exactly one kind, found {}",
            block.len()
        )));
    }
    let Some((kind, value)) = block.iter_mut().next() else {
        return Err(Failure::job("Empty action block"));
    };
    if value.is_null() {
        *value = Value::Object(Map::new());
    }
    let Value::Object(parameters) = value else {
        return Err(Failure::job(format!("Parameters of '{kind}' must be a mapping")));
    };
    parameters
        .entry("namespace")
        .or_insert_with(|| Value::String(DEFAULT_NAMESPACE.to_string()));
    Ok((kind.clone(), parameters))
}
