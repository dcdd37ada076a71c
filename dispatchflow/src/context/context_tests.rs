//! Tests for the context store.

#[cfg(test)]
mod tests {
    use crate::connection::{SharedConnection, ShellSession};
    use crate::context::{ContextStore, DataPath};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::Arc;

    fn path<'a>(namespace: &'a str) -> DataPath<'a> {
        DataPath::new(namespace, "a", "l", "k")
    }

    #[test]
    fn test_get_missing_is_none() {
        let store = ContextStore::new();
        assert!(store.get(path("ns")).is_none());
        assert!(!store.contains(path("ns")));
    }

    #[test]
    fn test_set_then_get() {
        let store = ContextStore::new();
        store.set(path("ns"), json!({"image": "/tmp/rootfs"}));
        assert_eq!(store.get(path("ns")), Some(json!({"image": "/tmp/rootfs"})));
    }

    #[test]
    fn test_namespaces_are_isolated() {
        let store = ContextStore::new();
        store.set(path("ns"), json!("V"));
        store.set(path("ns2"), json!("W"));

        assert_eq!(store.get(path("ns")), Some(json!("V")));
        assert_eq!(store.get(path("ns2")), Some(json!("W")));
    }

    #[test]
    fn test_reads_are_independent_copies() {
        let store = ContextStore::new();
        store.set(path("ns"), json!(["one", "two"]));

        let mut first = store.get(path("ns")).unwrap();
        first.as_array_mut().unwrap().push(json!("three"));

        let second = store.get(path("ns")).unwrap();
        assert_eq!(second, json!(["one", "two"]));
    }

    #[test]
    fn test_shared_read_points_at_stored_value() {
        let store = ContextStore::new();
        store.set(path("ns"), json!({"x": 1}));

        let a = store.get_shared(path("ns")).unwrap();
        let b = store.get_shared(path("ns")).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_overwrite_does_not_alter_earlier_copy() {
        let store = ContextStore::new();
        store.set(path("ns"), json!(1));
        let before = store.get(path("ns"));
        store.set(path("ns"), json!(2));

        assert_eq!(before, Some(json!(1)));
        assert_eq!(store.get(path("ns")), Some(json!(2)));
    }

    #[test]
    fn test_remove() {
        let store = ContextStore::new();
        store.set(path("ns"), json!(true));
        assert_eq!(store.remove(path("ns")), Some(json!(true)));
        assert!(store.remove(path("ns")).is_none());
    }

    #[test]
    fn test_namespace_snapshot() {
        let store = ContextStore::new();
        store.set(DataPath::new("ns", "deploy", "image", "path"), json!("/img"));
        store.set(DataPath::new("ns", "boot", "prompt", "value"), json!("# "));

        assert_eq!(
            store.namespace_snapshot("ns"),
            json!({
                "boot": {"prompt": {"value": "# "}},
                "deploy": {"image": {"path": "/img"}}
            })
        );
        assert_eq!(store.namespace_snapshot("other"), json!({}));
    }

    #[tokio::test]
    async fn test_shared_connection_slot() {
        let store = ContextStore::new();
        let (_device, host) = tokio::io::duplex(64);
        let (reader, writer) = tokio::io::split(host);
        let session: SharedConnection = Arc::new(ShellSession::from_transport("console", reader, writer));

        store.set_shared_connection("guest", Arc::clone(&session));
        store.set(path("host"), json!(1));

        assert!(store.shared_connection("guest").is_some());
        assert!(store.shared_connection("host").is_none());
        assert_eq!(store.namespaces(), vec!["guest".to_string(), "host".to_string()]);

        assert!(store.take_shared_connection("guest").is_some());
        assert!(store.shared_connection("guest").is_none());
    }
}
