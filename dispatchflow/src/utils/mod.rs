//! Small helpers shared by the engine: timestamps and duration formatting.

pub mod timestamps;

pub use timestamps::{format_iso8601, iso_timestamp, now_utc, Timestamp};

use std::time::Duration;

/// Formats a duration as `HH:MM:SS` for log lines.
///
/// Sub-second precision is dropped. Hours are not wrapped, so a two day
/// budget renders as `48:00:00`.
#[must_use]
pub fn seconds_to_str(duration: Duration) -> String {
    let total = duration.as_secs();
    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let seconds = total % 60;
    format!("{hours:02}:{minutes:02}:{seconds:02}")
}

/// Formats a duration as seconds with two decimals, the shape used in
/// result records.
#[must_use]
pub fn format_duration(duration: Duration) -> String {
    format!("{:.2}", duration.as_secs_f64())
}
