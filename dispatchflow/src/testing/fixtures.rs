//! Job fixtures.

use serde_json::{json, Value};
use std::fmt;
use std::sync::Arc;

use crate::diagnostics::{Diagnostic, DiagnosticRegistry};
use crate::events::EventSink;
use crate::job::{DeviceConfig, JobContext, TimeoutsConfig};
use crate::pipeline::Pipeline;
use crate::protocols::Protocol;

/// Builder for the [`JobContext`] of a unit test.
///
/// Defaults: job id `"test-job"`, a device called `"test-device"` with no
/// timeouts, the builtin diagnostics, no protocols and a no-op sink.
pub struct TestJob {
    job_id: String,
    device: DeviceConfig,
    timeouts: TimeoutsConfig,
    diagnostics: DiagnosticRegistry,
    protocols: Vec<Arc<dyn Protocol>>,
    sink: Option<Arc<dyn EventSink>>,
}

impl TestJob {
    /// Creates the builder.
    #[must_use]
    pub fn new() -> Self {
        Self {
            job_id: "test-job".to_string(),
            device: DeviceConfig {
                hostname: "test-device".to_string(),
                device_type: "qemu".to_string(),
                ..DeviceConfig::default()
            },
            timeouts: TimeoutsConfig::default(),
            diagnostics: DiagnosticRegistry::with_builtins(),
            protocols: Vec::new(),
            sink: None,
        }
    }

    /// Replaces the device configuration.
    #[must_use]
    pub fn with_device(mut self, device: DeviceConfig) -> Self {
        self.device = device;
        self
    }

    /// Replaces the job-level timeouts.
    #[must_use]
    pub fn with_timeouts(mut self, timeouts: TimeoutsConfig) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Sets `timeouts.actions[name]` of the job to `seconds`.
    #[must_use]
    pub fn with_action_timeout(mut self, name: &str, seconds: u64) -> Self {
        self.timeouts
            .actions
            .insert(name.to_string(), json!({ "seconds": seconds }));
        self
    }

    /// Sets a device constant.
    #[must_use]
    pub fn with_constant(mut self, key: &str, value: Value) -> Self {
        self.device.constants.insert(key.to_string(), value);
        self
    }

    /// Registers a diagnostic.
    #[must_use]
    pub fn with_diagnostic(mut self, diagnostic: Arc<dyn Diagnostic>) -> Self {
        self.diagnostics.register(diagnostic);
        self
    }

    /// Enables a protocol. Protocols run in the order they are added.
    #[must_use]
    pub fn with_protocol(mut self, protocol: Arc<dyn Protocol>) -> Self {
        self.protocols.push(protocol);
        self
    }

    /// Sets the record sink.
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Builds the job context.
    #[must_use]
    pub fn build(self) -> Arc<JobContext> {
        let mut job = JobContext::new(self.job_id, self.device)
            .with_timeouts(self.timeouts)
            .with_diagnostics(self.diagnostics)
            .with_protocols(self.protocols);
        if let Some(sink) = self.sink {
            job = job.with_sink(sink);
        }
        Arc::new(job)
    }

    /// Builds the job context and an empty root pipeline for it.
    #[must_use]
    pub fn root(self) -> (Arc<JobContext>, Pipeline) {
        let job = self.build();
        let pipeline = Pipeline::new(Arc::clone(&job));
        (job, pipeline)
    }
}

impl fmt::Debug for TestJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestJob")
            .field("job_id", &self.job_id)
            .field("device", &self.device)
            .field("timeouts", &self.timeouts)
            .field("diagnostics", &self.diagnostics)
            .field("protocols", &self.protocols)
            .field("has_sink", &self.sink.is_some())
            .finish_non_exhaustive()
    }
}

impl Default for TestJob {
    fn default() -> Self {
        Self::new()
    }
}
