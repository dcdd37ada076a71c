//! Job-wide shared state.
//!
//! Actions in a job never hold references to each other. Whatever one action
//! produces for a later one (a deployed image path, a negotiated IP address,
//! the console of another device) goes through the [`ContextStore`], keyed by
//! `(namespace, action, label, key)`.

#[cfg(test)]
mod context_tests;
mod store;

pub use store::{ContextStore, DataPath};

/// Namespace used when an action block does not name one.
pub const DEFAULT_NAMESPACE: &str = "common";
