//! Attribute scopes.
//!
//! Application attributes are shared by every concurrent `service` call and
//! live in a [`DashMap`]. Request attributes live on the
//! [`Exchange`](super::Exchange) and are owned by one call. A sub-dispatch
//! writes into its own overlay, which is dropped when the sub-dispatch
//! returns.

use dashmap::DashMap;
use serde_json::Value;

/// Keys the engine sets on sub-dispatch frames.
pub mod keys {
    pub const FORWARD_REQUEST_URI: &str = "forward.request_uri";
    pub const FORWARD_HANDLER_PATH: &str = "forward.handler_path";
    pub const FORWARD_PATH_INFO: &str = "forward.path_info";
    pub const FORWARD_QUERY_STRING: &str = "forward.query_string";

    pub const INCLUDE_REQUEST_URI: &str = "include.request_uri";
    pub const INCLUDE_HANDLER_PATH: &str = "include.handler_path";
    pub const INCLUDE_PATH_INFO: &str = "include.path_info";
    pub const INCLUDE_QUERY_STRING: &str = "include.query_string";

    pub const ERROR_STATUS_CODE: &str = "error.status_code";
    pub const ERROR_MESSAGE: &str = "error.message";
    pub const ERROR_CATEGORY: &str = "error.category";
    pub const ERROR_REQUEST_URI: &str = "error.request_uri";
    pub const ERROR_HANDLER_NAME: &str = "error.handler_name";
}

/// Application-scoped key/value store.
#[derive(Debug, Default)]
pub struct ApplicationAttributes {
    map: DashMap<String, Value>,
}

impl ApplicationAttributes {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<Value> {
        self.map.get(key).map(|v| v.value().clone())
    }

    /// Store a value, returning the previous one.
    pub fn set(&self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.map.insert(key.into(), value)
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        self.map.remove(key).map(|(_, v)| v)
    }

    /// Atomically update a value in place. `f` sees `Value::Null` when the
    /// key is absent.
    pub fn update<F>(&self, key: &str, f: F) -> Value
    where
        F: FnOnce(&Value) -> Value,
    {
        let mut entry = self.map.entry(key.to_string()).or_insert(Value::Null);
        let next = f(entry.value());
        *entry.value_mut() = next.clone();
        next
    }

    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.map.contains_key(key)
    }

    /// Keys, sorted.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.map.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub(crate) fn clear(&self) {
        self.map.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    #[test]
    fn test_set_get_remove() {
        let attrs = ApplicationAttributes::new();
        assert!(attrs.set("k", json!(1)).is_none());
        assert_eq!(attrs.get("k"), Some(json!(1)));
        assert_eq!(attrs.remove("k"), Some(json!(1)));
        assert!(attrs.is_empty());
    }

    #[test]
    fn test_update_is_atomic_across_threads() {
        let attrs = Arc::new(ApplicationAttributes::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let attrs = Arc::clone(&attrs);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        attrs.update("hits", |v| json!(v.as_u64().unwrap_or(0) + 1));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(attrs.get("hits"), Some(json!(800)));
    }
}
