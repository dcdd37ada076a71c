//! Assertions over failures and result records.

use serde_json::Value;

use crate::errors::{FailureKind, Result};
use crate::events::{CollectingEventSink, ACTION_RESULT};

/// Asserts that `result` failed with `kind` and a message containing `needle`.
///
/// # Panics
///
/// Panics if the result succeeded or failed differently.
#[track_caller]
pub fn assert_failed_with<T: std::fmt::Debug>(result: &Result<T>, kind: FailureKind, needle: &str) {
    match result {
        Ok(value) => panic!("Expected a {kind} failure, got Ok({value:?})"),
        Err(failure) => {
            assert_eq!(failure.kind(), kind, "unexpected kind for '{}'", failure.message);
            assert!(
                failure.message.contains(needle),
                "'{}' does not contain '{needle}'",
                failure.message
            );
        }
    }
}

/// Returns the action result records emitted for `case`.
#[must_use]
pub fn result_records(sink: &CollectingEventSink, case: &str) -> Vec<Value> {
    sink.payloads(ACTION_RESULT)
        .into_iter()
        .filter(|record| record["case"] == case)
        .collect()
}

/// Asserts that the last result record of `case` has the given `result`.
///
/// # Panics
///
/// Panics if no record was emitted for `case`.
#[track_caller]
pub fn assert_last_result(sink: &CollectingEventSink, case: &str, result: &str) -> Value {
    let records = result_records(sink, case);
    let Some(last) = records.last() else {
        panic!("No result record for {case}");
    };
    assert_eq!(last["result"], result, "record of {case}: {last}");
    last.clone()
}
