//! Record shapes of the structured log protocol.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fmt;
use std::time::Duration;

use crate::utils::{format_duration, seconds_to_str};

/// Event type of an action start record.
pub const ACTION_START: &str = "action.start";
/// Event type of an action end record.
pub const ACTION_END: &str = "action.end";
/// Event type of an action result record.
pub const ACTION_RESULT: &str = "action.result";
/// Event type of the job validation record.
pub const JOB_VALIDATE: &str = "job.validate";
/// Event type of the final job record.
pub const JOB_RESULT: &str = "job.result";

/// Test-definition name under which engine results are filed.
pub const RESULT_DEFINITION: &str = "dispatcher";

/// Outcome of a result record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    /// The case passed.
    Pass,
    /// The case failed.
    Fail,
}

impl ResultStatus {
    /// Maps a failure flag to a status.
    #[must_use]
    pub const fn from_failed(failed: bool) -> Self {
        if failed {
            Self::Fail
        } else {
            Self::Pass
        }
    }
}

impl fmt::Display for ResultStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pass => write!(f, "pass"),
            Self::Fail => write!(f, "fail"),
        }
    }
}

/// One result record: `{definition, namespace, case, level, duration, result, extra}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    /// Test definition the case belongs to.
    pub definition: String,
    /// Namespace of the action.
    pub namespace: String,
    /// Case name, the action name.
    pub case: String,
    /// Level of the action in the tree.
    pub level: String,
    /// Duration in seconds with two decimals.
    pub duration: String,
    /// Pass or fail.
    pub result: ResultStatus,
    /// Whatever the action stored in its results.
    #[serde(default)]
    pub extra: Map<String, Value>,
}

impl ResultRecord {
    /// Creates a record for an engine action.
    #[must_use]
    pub fn new(
        namespace: impl Into<String>,
        case: impl Into<String>,
        level: impl Into<String>,
        duration: Duration,
        result: ResultStatus,
    ) -> Self {
        Self {
            definition: RESULT_DEFINITION.to_string(),
            namespace: namespace.into(),
            case: case.into(),
            level: level.into(),
            duration: format_duration(duration),
            result,
            extra: Map::new(),
        }
    }

    /// Attaches the extra data.
    #[must_use]
    pub fn with_extra(mut self, extra: Map<String, Value>) -> Self {
        self.extra = extra;
        self
    }

    /// Converts to the JSON payload.
    #[must_use]
    pub fn to_value(&self) -> Value {
        json!({
            "definition": self.definition,
            "namespace": self.namespace,
            "case": self.case,
            "level": self.level,
            "duration": self.duration,
            "result": self.result.to_string(),
            "extra": Value::Object(self.extra.clone()),
        })
    }
}

/// Builds the payload of an action start record.
#[must_use]
pub fn action_start_record(level: &str, name: &str, namespace: &str, timeout: Duration) -> Value {
    json!({
        "level": level,
        "name": name,
        "namespace": namespace,
        "timeout": seconds_to_str(timeout),
    })
}

/// Builds the payload of an action end record.
#[must_use]
pub fn action_end_record(
    level: &str,
    name: &str,
    namespace: &str,
    timeout: Duration,
    duration: Duration,
) -> Value {
    let mut record = action_start_record(level, name, namespace, timeout);
    if let Value::Object(ref mut map) = record {
        map.insert("duration".to_string(), Value::String(format_duration(duration)));
    }
    record
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_result_record_shape() {
        let mut extra = Map::new();
        extra.insert("attempts".to_string(), json!(2));
        let record = ResultRecord::new("common", "boot-retry", "2", Duration::from_millis(1234), ResultStatus::Pass)
            .with_extra(extra);

        assert_eq!(
            record.to_value(),
            json!({
                "definition": "dispatcher",
                "namespace": "common",
                "case": "boot-retry",
                "level": "2",
                "duration": "1.23",
                "result": "pass",
                "extra": {"attempts": 2}
            })
        );
    }

    #[test]
    fn test_result_record_serde_matches_payload() {
        let record = ResultRecord::new("ns", "deploy", "1.1", Duration::ZERO, ResultStatus::Fail);
        let via_serde = serde_json::to_value(&record).unwrap();
        assert_eq!(via_serde, record.to_value());
    }

    #[test]
    fn test_start_and_end_records() {
        let start = action_start_record("1.2", "power-on", "common", Duration::from_secs(90));
        assert_eq!(
            start,
            json!({"level": "1.2", "name": "power-on", "namespace": "common", "timeout": "00:01:30"})
        );

        let end = action_end_record("1.2", "power-on", "common", Duration::from_secs(90), Duration::from_millis(500));
        assert_eq!(end["duration"], json!("0.50"));
        assert_eq!(end["name"], json!("power-on"));
    }

    #[test]
    fn test_status_from_failed() {
        assert_eq!(ResultStatus::from_failed(true), ResultStatus::Fail);
        assert_eq!(ResultStatus::from_failed(false).to_string(), "pass");
    }
}
