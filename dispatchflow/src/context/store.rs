//! The namespaced key/value store.

use parking_lot::RwLock;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::connection::SharedConnection;

type KeyMap = BTreeMap<String, Arc<Value>>;
type LabelMap = BTreeMap<String, KeyMap>;
type ActionMap = BTreeMap<String, LabelMap>;

/// Address of one value in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataPath<'a> {
    /// Partition of the job the value belongs to.
    pub namespace: &'a str,
    /// Name of the action that produced the value.
    pub action: &'a str,
    /// Grouping label chosen by the producer.
    pub label: &'a str,
    /// Key within the label.
    pub key: &'a str,
}

impl<'a> DataPath<'a> {
    /// Creates a new path.
    #[must_use]
    pub const fn new(namespace: &'a str, action: &'a str, label: &'a str, key: &'a str) -> Self {
        Self {
            namespace,
            action,
            label,
            key,
        }
    }
}

/// Job-wide mapping from `(namespace, action, label, key)` to a JSON value.
///
/// Reads return an independent copy by default, so a consumer mutating what
/// it read can never change what the next consumer sees. [`ContextStore::get_shared`]
/// opts into sharing the stored value instead.
///
/// Connections are kept apart from the data: each namespace has one shared
/// connection slot used to hand a console across namespace boundaries.
#[derive(Debug, Default)]
pub struct ContextStore {
    data: RwLock<BTreeMap<String, ActionMap>>,
    connections: RwLock<BTreeMap<String, SharedConnection>>,
}

impl ContextStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a deep copy of the value at `path`.
    #[must_use]
    pub fn get(&self, path: DataPath<'_>) -> Option<Value> {
        self.get_shared(path).map(|value| (*value).clone())
    }

    /// Returns the stored value itself, without copying.
    #[must_use]
    pub fn get_shared(&self, path: DataPath<'_>) -> Option<Arc<Value>> {
        self.data
            .read()
            .get(path.namespace)
            .and_then(|actions| actions.get(path.action))
            .and_then(|labels| labels.get(path.label))
            .and_then(|keys| keys.get(path.key))
            .cloned()
    }

    /// Stores `value` at `path`, replacing any previous value.
    pub fn set(&self, path: DataPath<'_>, value: Value) {
        self.data
            .write()
            .entry(path.namespace.to_string())
            .or_default()
            .entry(path.action.to_string())
            .or_default()
            .entry(path.label.to_string())
            .or_default()
            .insert(path.key.to_string(), Arc::new(value));
    }

    /// Checks if a value exists at `path`.
    #[must_use]
    pub fn contains(&self, path: DataPath<'_>) -> bool {
        self.get_shared(path).is_some()
    }

    /// Removes and returns the value at `path`.
    pub fn remove(&self, path: DataPath<'_>) -> Option<Value> {
        let mut data = self.data.write();
        let keys = data
            .get_mut(path.namespace)?
            .get_mut(path.action)?
            .get_mut(path.label)?;
        keys.remove(path.key).map(|value| (*value).clone())
    }

    /// Returns every namespace that holds data or a shared connection.
    #[must_use]
    pub fn namespaces(&self) -> Vec<String> {
        let mut names: Vec<String> = self.data.read().keys().cloned().collect();
        for name in self.connections.read().keys() {
            if !names.contains(name) {
                names.push(name.clone());
            }
        }
        names.sort();
        names
    }

    /// Returns a copy of everything stored under `namespace` as one JSON object.
    #[must_use]
    pub fn namespace_snapshot(&self, namespace: &str) -> Value {
        let data = self.data.read();
        let Some(actions) = data.get(namespace) else {
            return Value::Object(serde_json::Map::new());
        };
        let mut out = serde_json::Map::new();
        for (action, labels) in actions {
            let mut label_out = serde_json::Map::new();
            for (label, keys) in labels {
                let key_out: serde_json::Map<String, Value> = keys
                    .iter()
                    .map(|(k, v)| (k.clone(), (**v).clone()))
                    .collect();
                label_out.insert(label.clone(), Value::Object(key_out));
            }
            out.insert(action.clone(), Value::Object(label_out));
        }
        Value::Object(out)
    }

    /// Places `connection` in the shared slot of `namespace`.
    pub fn set_shared_connection(&self, namespace: &str, connection: SharedConnection) {
        self.connections
            .write()
            .insert(namespace.to_string(), connection);
    }

    /// Returns the shared connection of `namespace`, if any.
    #[must_use]
    pub fn shared_connection(&self, namespace: &str) -> Option<SharedConnection> {
        self.connections.read().get(namespace).cloned()
    }

    /// Empties the shared slot of `namespace`.
    pub fn take_shared_connection(&self, namespace: &str) -> Option<SharedConnection> {
        self.connections.write().remove(namespace)
    }
}
