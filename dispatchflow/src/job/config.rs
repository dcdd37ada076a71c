//! Job definitions and device configurations.
//!
//! Both are YAML documents. Only the keys the engine reads are typed; the
//! rest is kept as JSON values so strategies can look at them later.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::Path;

use crate::errors::{Failure, Result};

fn read_document(path: &Path) -> Result<String> {
    std::fs::read_to_string(path)
        .map_err(|err| Failure::job(format!("Unable to read {}: {err}", path.display())))
}

/// Timeout blocks of a job definition or a device configuration.
///
/// Every entry is a `{days, hours, minutes, seconds}` map, parsed when the
/// action it applies to is attached.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TimeoutsConfig {
    /// Whole-job budget (job definitions only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job: Option<Value>,
    /// Default action timeout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<Value>,
    /// Per action name.
    #[serde(default)]
    pub actions: BTreeMap<String, Value>,
    /// Default connection timeout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection: Option<Value>,
    /// Connection timeout per action name.
    #[serde(default)]
    pub connections: BTreeMap<String, Value>,
}

/// One command line or a list of them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CommandList {
    /// A single command line.
    One(String),
    /// Several command lines run in order.
    Many(Vec<String>),
}

impl CommandList {
    /// Returns the command lines in order.
    #[must_use]
    pub fn lines(&self) -> Vec<&str> {
        match self {
            Self::One(line) => vec![line.as_str()],
            Self::Many(lines) => lines.iter().map(String::as_str).collect(),
        }
    }
}

/// An admin-defined command and its inverse.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserCommand {
    /// Run by the action.
    #[serde(rename = "do")]
    pub run: String,
    /// Run on cleanup.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub undo: Option<String>,
}

/// Lab commands of a device.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceCommands {
    /// Run by the finalize phase.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub power_off: Option<CommandList>,
    /// Commands jobs may call by name.
    #[serde(default)]
    pub users: BTreeMap<String, UserCommand>,
    /// Commands the engine does not read.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Configuration of the device a job runs on.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Name of the board in the lab.
    #[serde(default)]
    pub hostname: String,
    /// Device type the configuration was rendered from.
    #[serde(default)]
    pub device_type: String,
    /// Device-level timeout defaults.
    #[serde(default)]
    pub timeouts: TimeoutsConfig,
    /// Free-form constants; `failure_retry`, `boot_retry` and
    /// `character_delays` are read by the engine.
    #[serde(default)]
    pub constants: Map<String, Value>,
    /// Lab commands.
    #[serde(default)]
    pub commands: DeviceCommands,
    /// Keys the engine does not read.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl DeviceConfig {
    /// Parses a device configuration.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Reads and parses a device configuration file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_yaml_str(&read_document(path.as_ref())?)
    }

    /// Returns a positive count constant such as `failure_retry`.
    #[must_use]
    pub fn constant_count(&self, name: &str) -> Option<u32> {
        self.constants
            .get(name)
            .and_then(Value::as_u64)
            .filter(|n| *n > 0)
            .and_then(|n| u32::try_from(n).ok())
    }

    /// Returns the per-character delay, in milliseconds, for `section`.
    #[must_use]
    pub fn character_delay(&self, section: &str) -> Option<u64> {
        self.constants
            .get("character_delays")
            .and_then(|delays| delays.get(section))
            .and_then(Value::as_u64)
    }
}

/// A submitted job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobDefinition {
    /// Human readable name.
    #[serde(default)]
    pub job_name: String,
    /// Job-level timeouts; `job` is mandatory.
    #[serde(default)]
    pub timeouts: TimeoutsConfig,
    /// Ordered `{kind: parameters}` blocks.
    #[serde(default)]
    pub actions: Vec<Map<String, Value>>,
    /// Configuration per protocol name.
    #[serde(default)]
    pub protocols: Map<String, Value>,
    /// Keys the engine does not read.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl JobDefinition {
    /// Parses a job definition.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Reads and parses a job definition file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_yaml_str(&read_document(path.as_ref())?)
    }
}
