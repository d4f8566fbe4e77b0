//! Injected key/value store shared by middleware, loaders and API handlers.
//!
//! Route code reaches application state through the [`Store`] handle on its
//! context instead of module-level globals, so tests can hand each app its own
//! isolated instance.

use dashmap::DashMap;
use serde_json::Value;

/// A concurrent JSON key/value store.
pub trait Store: Send + Sync {
    fn get(&self, key: &str) -> Option<Value>;

    /// Inserts or replaces `key`, returning the previous value.
    fn set(&self, key: &str, value: Value) -> Option<Value>;

    fn delete(&self, key: &str) -> Option<Value>;

    /// Every entry whose key starts with `prefix`, sorted by key.
    fn list(&self, prefix: &str) -> Vec<(String, Value)>;
}

/// In-process [`Store`] backed by a sharded concurrent map.
///
/// # Examples
///
/// ```
/// use islet::context::store::{MemoryStore, Store};
/// use serde_json::json;
///
/// let store = MemoryStore::new();
/// store.set("post:2", json!({"title": "second"}));
/// store.set("post:1", json!({"title": "first"}));
/// store.set("user:1", json!("ada"));
///
/// let posts = store.list("post:");
/// assert_eq!(posts.len(), 2);
/// assert_eq!(posts[0].0, "post:1");
/// ```
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: DashMap<String, Value>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store pre-filled with `entries`.
    pub fn with_entries<I, K>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        let store = Self::new();
        for (key, value) in entries {
            store.entries.insert(key.into(), value);
        }
        store
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Store for MemoryStore {
    fn get(&self, key: &str) -> Option<Value> {
        self.entries.get(key).map(|v| v.value().clone())
    }

    fn set(&self, key: &str, value: Value) -> Option<Value> {
        self.entries.insert(key.to_owned(), value)
    }

    fn delete(&self, key: &str) -> Option<Value> {
        self.entries.remove(key).map(|(_, v)| v)
    }

    fn list(&self, prefix: &str) -> Vec<(String, Value)> {
        let mut out: Vec<(String, Value)> = self
            .entries
            .iter()
            .filter(|e| e.key().starts_with(prefix))
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    #[test]
    fn set_get_delete() {
        let store = MemoryStore::new();
        assert!(store.set("count", json!(1)).is_none());
        assert_eq!(store.set("count", json!(2)), Some(json!(1)));
        assert_eq!(store.get("count"), Some(json!(2)));
        assert_eq!(store.delete("count"), Some(json!(2)));
        assert!(store.get("count").is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn list_filters_and_sorts() {
        let store = MemoryStore::with_entries([
            ("b", json!(2)),
            ("a", json!(1)),
            ("other", json!(0)),
        ]);
        let all = store.list("");
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].0, "a");
        assert_eq!(store.list("a").len(), 1);
    }

    #[tokio::test]
    async fn shared_across_tasks() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let mut handles = Vec::new();
        for i in 0..8 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store.set(&format!("k{i}"), json!(i));
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(store.list("k").len(), 8);
    }
}
