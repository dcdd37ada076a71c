//! Timeout override chain.
//!
//! Sources in increasing priority: device default, device entry for the
//! action name, job default, job entry for the action name, then the
//! action's own parameters. Every present source is parsed, so a malformed
//! entry fails even when a later one would win.

use serde_json::Value;
use std::time::Duration;

use crate::action::Parameters;
use crate::errors::Result;
use crate::job::TimeoutsConfig;
use crate::timeout::Timeout;

/// Resolves the action and connection timeouts of the action `name`.
///
/// `None` means no source set a value and the action keeps its default.
pub(crate) fn resolve(
    device: &TimeoutsConfig,
    job: &TimeoutsConfig,
    name: &str,
    parameters: &Parameters,
) -> Result<(Option<Duration>, Option<Duration>)> {
    let action = last_of([
        device.action.as_ref(),
        device.actions.get(name),
        job.action.as_ref(),
        job.actions.get(name),
        parameters.get("timeout"),
    ])?;
    let connection = last_of([
        device.connection.as_ref(),
        device.connections.get(name),
        job.connection.as_ref(),
        job.connections.get(name),
        parameters.get("connection_timeout"),
    ])?;
    Ok((action, connection))
}

fn last_of(sources: [Option<&Value>; 5]) -> Result<Option<Duration>> {
    let mut resolved = None;
    for value in sources.into_iter().flatten().filter_map(without_skip) {
        resolved = Some(Timeout::parse(&value)?);
    }
    Ok(resolved)
}

// `skip` shares the parameter block with the duration keys. A block
// holding nothing but `skip` sets no duration.
fn without_skip(value: &Value) -> Option<Value> {
    match value {
        Value::Object(map) if map.contains_key("skip") => {
            let mut map = map.clone();
            map.remove("skip");
            (!map.is_empty()).then_some(Value::Object(map))
        }
        other => Some(other.clone()),
    }
}
