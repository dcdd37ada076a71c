//! Structured records emitted to the log/results collector.
//!
//! The engine reports every action start, end and result as a JSON record
//! through an [`EventSink`]. This is the only contract the results tier
//! depends on; human-readable logging goes through `tracing` separately.

mod record;
mod sink;

pub use record::{
    action_end_record, action_start_record, ResultRecord, ResultStatus, ACTION_END, ACTION_RESULT,
    ACTION_START, JOB_RESULT, JOB_VALIDATE, RESULT_DEFINITION,
};
pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};
