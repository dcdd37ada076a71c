//! Error types for the dispatchflow engine.
//!
//! Every failure raised by an action, a pipeline, a connection or the job
//! loader is a [`Failure`]. The [`FailureKind`] decides how the engine reacts
//! to it: whether a retry wrapper may re-attempt, whether diagnostics run,
//! and how the job result is reported.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

/// Classification of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Internal invariant violation. Never retried, always fatal.
    EngineBug,
    /// Job definition or device configuration inconsistency.
    JobConfig,
    /// Lab, hardware or environment fault (power, USB, network).
    Infrastructure,
    /// Device or test-shell level failure.
    Test,
    /// A deadline was exceeded on an action or a connection wait.
    Timeout,
}

impl FailureKind {
    /// Returns true if a retry wrapper may re-attempt after this kind.
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        !matches!(self, Self::EngineBug)
    }

    /// Returns true if this kind causes the pending diagnostics to run.
    #[must_use]
    pub const fn triggers_diagnostics(self) -> bool {
        matches!(self, Self::JobConfig | Self::Infrastructure | Self::Test)
    }

    /// Returns the snake_case name of the kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::EngineBug => "engine_bug",
            Self::JobConfig => "job_config",
            Self::Infrastructure => "infrastructure",
            Self::Test => "test",
            Self::Timeout => "timeout",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed failure raised anywhere in the engine.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct Failure {
    /// The kind of failure.
    pub kind: FailureKind,
    /// Human readable message.
    pub message: String,
    /// The failure this one was derived from, if any.
    #[source]
    pub cause: Option<Box<Failure>>,
}

impl Failure {
    /// Creates a new failure of the given kind.
    #[must_use]
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            cause: None,
        }
    }

    /// Creates an engine bug failure.
    #[must_use]
    pub fn bug(message: impl Into<String>) -> Self {
        Self::new(FailureKind::EngineBug, message)
    }

    /// Creates a job configuration failure.
    #[must_use]
    pub fn job(message: impl Into<String>) -> Self {
        Self::new(FailureKind::JobConfig, message)
    }

    /// Creates an infrastructure failure.
    #[must_use]
    pub fn infrastructure(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Infrastructure, message)
    }

    /// Creates a test failure.
    #[must_use]
    pub fn test(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Test, message)
    }

    /// Creates a timeout failure.
    #[must_use]
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Timeout, message)
    }

    /// Attaches the failure this one was derived from.
    #[must_use]
    pub fn with_cause(mut self, cause: Failure) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// Returns the kind of this failure.
    #[must_use]
    pub const fn kind(&self) -> FailureKind {
        self.kind
    }

    /// Returns the underlying cause, if any.
    #[must_use]
    pub fn cause(&self) -> Option<&Failure> {
        self.cause.as_deref()
    }

    /// Returns true if a retry wrapper may re-attempt.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }

    /// Returns true if this failure runs the pending diagnostics.
    #[must_use]
    pub const fn triggers_diagnostics(&self) -> bool {
        self.kind.triggers_diagnostics()
    }

    /// Returns true if this is an engine bug.
    #[must_use]
    pub const fn is_bug(&self) -> bool {
        matches!(self.kind, FailureKind::EngineBug)
    }

    /// Converts to a dictionary representation.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        map.insert(
            "kind".to_string(),
            serde_json::Value::String(self.kind.to_string()),
        );
        map.insert(
            "message".to_string(),
            serde_json::Value::String(self.message.clone()),
        );
        if let Some(ref cause) = self.cause {
            let cause_map: serde_json::Map<String, serde_json::Value> =
                cause.to_dict().into_iter().collect();
            map.insert("cause".to_string(), serde_json::Value::Object(cause_map));
        }
        map
    }
}

impl From<std::io::Error> for Failure {
    fn from(err: std::io::Error) -> Self {
        Self::infrastructure(format!("IO error: {err}"))
    }
}

impl From<serde_yaml::Error> for Failure {
    fn from(err: serde_yaml::Error) -> Self {
        Self::job(format!("Invalid YAML: {err}"))
    }
}

impl From<serde_json::Error> for Failure {
    fn from(err: serde_json::Error) -> Self {
        Self::job(format!("Invalid data: {err}"))
    }
}

/// Result alias used across the crate.
pub type Result<T, E = Failure> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_kind_retry_policy() {
        assert!(!FailureKind::EngineBug.is_retryable());
        assert!(FailureKind::JobConfig.is_retryable());
        assert!(FailureKind::Infrastructure.is_retryable());
        assert!(FailureKind::Test.is_retryable());
        assert!(FailureKind::Timeout.is_retryable());
    }

    #[test]
    fn test_kind_diagnostics_policy() {
        assert!(FailureKind::JobConfig.triggers_diagnostics());
        assert!(FailureKind::Infrastructure.triggers_diagnostics());
        assert!(FailureKind::Test.triggers_diagnostics());
        assert!(!FailureKind::Timeout.triggers_diagnostics());
        assert!(!FailureKind::EngineBug.triggers_diagnostics());
    }

    #[test]
    fn test_display_is_message() {
        let failure = Failure::test("bad output");
        assert_eq!(failure.to_string(), "bad output");
        assert_eq!(failure.kind().to_string(), "test");
    }

    #[test]
    fn test_cause_chain() {
        let inner = Failure::infrastructure("power glitch");
        let outer = Failure::infrastructure("3 of 3 retries failed for boot").with_cause(inner);

        assert_eq!(outer.cause().map(|c| c.message.as_str()), Some("power glitch"));
        assert!(outer.source().is_some());
    }

    #[test]
    fn test_to_dict_includes_cause() {
        let failure = Failure::job("outer").with_cause(Failure::test("inner"));
        let dict = failure.to_dict();

        assert_eq!(dict.get("kind"), Some(&serde_json::json!("job_config")));
        assert_eq!(dict.get("message"), Some(&serde_json::json!("outer")));
        assert_eq!(
            dict.get("cause"),
            Some(&serde_json::json!({"kind": "test", "message": "inner"}))
        );
    }

    #[test]
    fn test_io_error_is_infrastructure() {
        let err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe");
        let failure: Failure = err.into();
        assert_eq!(failure.kind(), FailureKind::Infrastructure);
    }

    #[test]
    fn test_kind_serde_names() {
        let json = serde_json::to_string(&FailureKind::EngineBug).unwrap();
        assert_eq!(json, "\"engine_bug\"");
    }
}
