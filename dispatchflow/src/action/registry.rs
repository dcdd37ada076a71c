//! Lookup from an action kind to its constructor.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use super::{Action, Parameters};
use crate::builtin::{CommandAction, ShellAction};
use crate::errors::{Failure, Result};

/// Builds an action from the parameters of its job block.
pub type ActionConstructor = Arc<dyn Fn(&Parameters) -> Result<Box<dyn Action>> + Send + Sync>;

/// Registration table of the action kinds a job definition may use.
///
/// Populated once when the dispatcher starts; unknown kinds are rejected
/// when the job is parsed, never at run time.
#[derive(Clone, Default)]
pub struct ActionRegistry {
    constructors: BTreeMap<String, ActionConstructor>,
}

impl ActionRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry holding the built-in kinds (`command`, `shell`).
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("command", |_| Ok(Box::new(CommandAction::new()) as Box<dyn Action>));
        registry.register("shell", |_| Ok(Box::new(ShellAction::new()) as Box<dyn Action>));
        registry
    }

    /// Registers `constructor` under `kind`, replacing any previous entry.
    pub fn register<F>(&mut self, kind: impl Into<String>, constructor: F)
    where
        F: Fn(&Parameters) -> Result<Box<dyn Action>> + Send + Sync + 'static,
    {
        self.constructors.insert(kind.into(), Arc::new(constructor));
    }

    /// Builds an action of `kind`.
    pub fn create(&self, kind: &str, parameters: &Parameters) -> Result<Box<dyn Action>> {
        let constructor = self
            .constructors
            .get(kind)
            .ok_or_else(|| Failure::job(format!("Unknown action kind '{kind}'")))?;
        constructor(parameters)
    }

    /// Checks if `kind` is registered.
    #[must_use]
    pub fn contains(&self, kind: &str) -> bool {
        self.constructors.contains_key(kind)
    }

    /// Returns the registered kinds in sorted order.
    #[must_use]
    pub fn kinds(&self) -> Vec<&str> {
        self.constructors.keys().map(String::as_str).collect()
    }
}

impl fmt::Debug for ActionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::FailureKind;
    use crate::testing::SucceedingAction;

    #[test]
    fn test_builtins_registered() {
        let registry = ActionRegistry::with_builtins();
        assert_eq!(registry.kinds(), vec!["command", "shell"]);
    }

    #[test]
    fn test_create_unknown_kind_is_config_error() {
        let registry = ActionRegistry::new();
        let err = registry.create("fastboot", &Parameters::new()).unwrap_err();
        assert_eq!(err.kind(), FailureKind::JobConfig);
        assert!(err.message.contains("fastboot"));
    }

    #[test]
    fn test_register_and_create() {
        let mut registry = ActionRegistry::new();
        registry.register("deploy-ok", |_| {
            Ok(Box::new(SucceedingAction::new("deploy-ok")) as Box<dyn Action>)
        });

        assert!(registry.contains("deploy-ok"));
        let action = registry.create("deploy-ok", &Parameters::new()).unwrap();
        assert_eq!(action.base().name(), "deploy-ok");
    }

    #[test]
    fn test_constructor_sees_parameters() {
        let mut registry = ActionRegistry::new();
        registry.register("pick", |params: &Parameters| {
            let name = params
                .get("method")
                .and_then(serde_json::Value::as_str)
                .ok_or_else(|| Failure::job("missing method"))?;
            Ok(Box::new(SucceedingAction::new(name)) as Box<dyn Action>)
        });

        let mut params = Parameters::new();
        params.insert("method".into(), serde_json::json!("tftp"));
        assert_eq!(registry.create("pick", &params).unwrap().base().name(), "tftp");
        assert_eq!(
            registry.create("pick", &Parameters::new()).unwrap_err().kind(),
            FailureKind::JobConfig
        );
    }
}
