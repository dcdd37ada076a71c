//! Interactive connections to a device.
//!
//! A connection wraps one long-lived interactive stream (a serial console,
//! a bootloader prompt, a shell) and offers send/expect primitives. Actions
//! hand the active connection to each other by return value; nothing keeps
//! a global reference to it except the explicit shared slot of the
//! [`ContextStore`](crate::context::ContextStore).

mod session;
#[cfg(test)]
mod session_tests;

pub use session::{ShellSession, DEFAULT_CHECK_CHAR, LINE_SEPARATOR, MAX_PROMPT_PROBES};

use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::errors::Result;
use crate::timeout::Deadline;

/// A connection shared between the actions of a job.
pub type SharedConnection = Arc<dyn Connection>;

/// Send/expect interface over an interactive stream.
///
/// Implementations use interior mutability: the active connection is handed
/// around as a [`SharedConnection`] and all methods take `&self`.
#[async_trait]
pub trait Connection: Send + Sync + fmt::Debug {
    /// Returns the connection name used in logs.
    fn name(&self) -> &str;

    /// Returns false once the stream closed or the connection was finalised.
    fn is_connected(&self) -> bool;

    /// Returns the prompt patterns currently expected.
    fn prompt_str(&self) -> Vec<String>;

    /// Replaces the prompt patterns currently expected.
    fn set_prompt_str(&self, prompts: Vec<String>);

    /// Returns the default wait budget.
    fn timeout(&self) -> Duration;

    /// Replaces the default wait budget.
    fn set_timeout(&self, timeout: Duration);

    /// Returns the output received before the last prompt match.
    fn before(&self) -> String;

    /// Writes `line` followed by the line separator.
    ///
    /// With a non-zero `delay_ms` the text is written one character at a
    /// time with a pause between characters.
    async fn sendline(&self, line: &str, delay_ms: u64) -> Result<()>;

    /// Sends a control character (`c` = 'c' sends ETX).
    async fn sendcontrol(&self, c: char) -> Result<()>;

    /// Blocks until one of the prompt patterns matches.
    ///
    /// Returns the index of the matching pattern. Without a deadline the
    /// connection's own timeout applies.
    async fn wait(&self, max_end_time: Option<Deadline>) -> Result<usize>;

    /// Waits for the prompt, probing the device when the prompt may have been
    /// corrupted by interleaved output.
    async fn force_prompt_wait(&self, remaining: Duration) -> Result<usize>;

    /// Drains whatever output arrives within `window` and logs it as
    /// feedback. Returns the number of bytes read.
    async fn listen_feedback(&self, window: Duration, namespace: Option<&str>) -> Result<usize>;

    /// Closes the connection. Calling it again has no effect.
    async fn finalise(&self);
}

/// Drains many background connections within the same time window.
///
/// All connections are polled from one loop, so draining ten consoles takes
/// one `window`, not ten. Results are returned in completion order.
pub async fn listen_feedback_all(
    connections: &[(String, SharedConnection)],
    window: Duration,
) -> Vec<(String, Result<usize>)> {
    let mut pending: FuturesUnordered<_> = connections
        .iter()
        .map(|(namespace, connection)| async move {
            let read = connection.listen_feedback(window, Some(namespace.as_str())).await;
            (namespace.clone(), read)
        })
        .collect();

    let mut results = Vec::with_capacity(connections.len());
    while let Some(entry) = pending.next().await {
        results.push(entry);
    }
    results
}
