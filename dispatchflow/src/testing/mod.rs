//! Test doubles and fixtures for engine tests.
//!
//! - mock actions reporting into a shared [`ActionProbe`]
//! - a [`MockConnection`], a [`CountingDiagnostic`] and a [`MockProtocol`]
//! - the [`TestJob`] builder for job contexts
//! - assertions over failures and result records

mod assertions;
mod fixtures;
mod mocks;

pub use assertions::{assert_failed_with, assert_last_result, result_records};
pub use fixtures::TestJob;
pub use mocks::{
    ActionProbe, CountingDiagnostic, FailingAction, FlakyAction, MockConnection, MockProtocol,
    RecordingAction, SlowAction, SucceedingAction,
};
