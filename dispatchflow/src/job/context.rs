//! The handle every action of a job shares.

use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::config::{DeviceConfig, TimeoutsConfig};
use crate::context::ContextStore;
use crate::diagnostics::DiagnosticRegistry;
use crate::events::{EventSink, NoOpEventSink};
use crate::protocols::Protocol;

/// Job-wide state, shared by `Arc` between every pipeline of a job.
///
/// Configuration is fixed once the job is built. The mutable parts are the
/// context store, the pending diagnostic triggers and the `started` flag.
pub struct JobContext {
    job_id: String,
    device: DeviceConfig,
    timeouts: TimeoutsConfig,
    store: ContextStore,
    triggers: Mutex<Vec<String>>,
    diagnostics: DiagnosticRegistry,
    protocols: Vec<Arc<dyn Protocol>>,
    sink: Arc<dyn EventSink>,
    started: AtomicBool,
}

impl JobContext {
    /// Creates the context of job `job_id` running on `device`.
    #[must_use]
    pub fn new(job_id: impl Into<String>, device: DeviceConfig) -> Self {
        Self {
            job_id: job_id.into(),
            device,
            timeouts: TimeoutsConfig::default(),
            store: ContextStore::new(),
            triggers: Mutex::new(Vec::new()),
            diagnostics: DiagnosticRegistry::with_builtins(),
            protocols: Vec::new(),
            sink: Arc::new(NoOpEventSink),
            started: AtomicBool::new(false),
        }
    }

    /// Sets the job-level timeouts.
    #[must_use]
    pub fn with_timeouts(mut self, timeouts: TimeoutsConfig) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Replaces the diagnostic registry.
    #[must_use]
    pub fn with_diagnostics(mut self, diagnostics: DiagnosticRegistry) -> Self {
        self.diagnostics = diagnostics;
        self
    }

    /// Sets the enabled protocols, already in set-up order.
    #[must_use]
    pub fn with_protocols(mut self, protocols: Vec<Arc<dyn Protocol>>) -> Self {
        self.protocols = protocols;
        self
    }

    /// Sets the sink receiving the structured records.
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Returns the job id.
    #[must_use]
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Returns the device configuration.
    #[must_use]
    pub const fn device(&self) -> &DeviceConfig {
        &self.device
    }

    /// Returns the job-level timeouts.
    #[must_use]
    pub const fn timeouts(&self) -> &TimeoutsConfig {
        &self.timeouts
    }

    /// Returns the context store.
    #[must_use]
    pub const fn store(&self) -> &ContextStore {
        &self.store
    }

    /// Returns the diagnostic registry.
    #[must_use]
    pub const fn diagnostics(&self) -> &DiagnosticRegistry {
        &self.diagnostics
    }

    /// Returns the enabled protocols in set-up order.
    #[must_use]
    pub fn protocols(&self) -> &[Arc<dyn Protocol>] {
        &self.protocols
    }

    /// Returns the record sink.
    #[must_use]
    pub fn sink(&self) -> &Arc<dyn EventSink> {
        &self.sink
    }

    /// Requests the diagnostic registered under `trigger`.
    pub fn add_trigger(&self, trigger: impl Into<String>) {
        self.triggers.lock().push(trigger.into());
    }

    /// Returns and forgets the pending triggers.
    pub fn take_triggers(&self) -> Vec<String> {
        std::mem::take(&mut *self.triggers.lock())
    }

    /// Returns the pending triggers without consuming them.
    #[must_use]
    pub fn pending_triggers(&self) -> Vec<String> {
        self.triggers.lock().clone()
    }

    /// Records that the job started running.
    pub fn mark_started(&self) {
        self.started.store(true, Ordering::SeqCst);
    }

    /// Returns true once the job started running.
    #[must_use]
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for JobContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobContext")
            .field("job_id", &self.job_id)
            .field("device", &self.device.hostname)
            .field("protocols", &self.protocols)
            .field("diagnostics", &self.diagnostics.triggers())
            .field("started", &self.is_started())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_triggers_are_consumed_once() {
        let job = JobContext::new("42", DeviceConfig::default());
        job.add_trigger("network");
        job.add_trigger("usb");

        assert_eq!(job.pending_triggers(), vec!["network", "usb"]);
        assert_eq!(job.take_triggers(), vec!["network", "usb"]);
        assert!(job.take_triggers().is_empty());
    }

    #[test]
    fn test_started_flag() {
        let job = JobContext::new("42", DeviceConfig::default());
        assert!(!job.is_started());
        job.mark_started();
        assert!(job.is_started());
    }

    #[test]
    fn test_defaults() {
        let job = JobContext::new("42", DeviceConfig::default());
        assert_eq!(job.job_id(), "42");
        assert!(job.protocols().is_empty());
        assert_eq!(job.diagnostics().triggers(), vec!["network"]);
        assert!(job.store().namespaces().is_empty());
    }
}
