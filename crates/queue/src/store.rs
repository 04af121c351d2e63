//! Key-value store abstraction holding batches, the process lock and
//! health-check schedules.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::Mutex;

use crate::error::QueueError;

/// A single stored row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoreEntry {
    pub key: String,
    pub value: String,
}

impl fmt::Display for StoreEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StoreEntry {{ key: {}, bytes: {} }}", self.key, self.value.len())
    }
}

/// Trait for durable key-value backends.
///
/// Several independent processes may share one store, so every mutation the
/// engine relies on for correctness is a single atomic statement on the
/// backend: `insert_if_absent` and `compare_and_swap` guard the process lock,
/// `update_existing` guards batch write-back.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Rows whose key starts with `prefix`, in row-identity (insertion) order.
    async fn scan(&self, prefix: &str, limit: Option<usize>) -> Result<Vec<StoreEntry>, QueueError>;

    async fn get(&self, key: &str) -> Result<Option<String>, QueueError>;

    /// Insert or overwrite a row.
    async fn put(&self, key: &str, value: &str) -> Result<(), QueueError>;

    /// Overwrite a row only if it still exists. Returns `false` when it is gone.
    async fn update_existing(&self, key: &str, value: &str) -> Result<bool, QueueError>;

    /// Create a row only if no row with this key exists.
    async fn insert_if_absent(&self, key: &str, value: &str) -> Result<bool, QueueError>;

    /// Replace a row's value only if it currently equals `expected`.
    async fn compare_and_swap(&self, key: &str, expected: &str, new: &str) -> Result<bool, QueueError>;

    /// Remove a row. Returns whether a row was removed.
    async fn delete(&self, key: &str) -> Result<bool, QueueError>;

    /// Remove a row only if its value currently equals `expected`.
    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, QueueError>;

    /// Number of rows whose key starts with `prefix`.
    async fn count(&self, prefix: &str) -> Result<u64, QueueError>;
}

/// Blanket implementation so `Arc<dyn QueueStore>` can be used directly.
#[async_trait]
impl<T: QueueStore + ?Sized> QueueStore for Arc<T> {
    async fn scan(&self, prefix: &str, limit: Option<usize>) -> Result<Vec<StoreEntry>, QueueError> {
        (**self).scan(prefix, limit).await
    }
    async fn get(&self, key: &str) -> Result<Option<String>, QueueError> {
        (**self).get(key).await
    }
    async fn put(&self, key: &str, value: &str) -> Result<(), QueueError> {
        (**self).put(key, value).await
    }
    async fn update_existing(&self, key: &str, value: &str) -> Result<bool, QueueError> {
        (**self).update_existing(key, value).await
    }
    async fn insert_if_absent(&self, key: &str, value: &str) -> Result<bool, QueueError> {
        (**self).insert_if_absent(key, value).await
    }
    async fn compare_and_swap(&self, key: &str, expected: &str, new: &str) -> Result<bool, QueueError> {
        (**self).compare_and_swap(key, expected, new).await
    }
    async fn delete(&self, key: &str) -> Result<bool, QueueError> {
        (**self).delete(key).await
    }
    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, QueueError> {
        (**self).compare_and_delete(key, expected).await
    }
    async fn count(&self, prefix: &str) -> Result<u64, QueueError> {
        (**self).count(prefix).await
    }
}

// ── In-memory backend ───────────────────────────────────────────────

#[derive(Default)]
struct MemoryRows {
    next_id: u64,
    /// Row id -> (key, value). Ordered by id, so iteration is insertion order.
    rows: BTreeMap<u64, (String, String)>,
    /// Key -> row id.
    index: BTreeMap<String, u64>,
}

impl MemoryRows {
    fn insert(&mut self, key: &str, value: &str) {
        self.next_id += 1;
        self.rows.insert(self.next_id, (key.to_string(), value.to_string()));
        self.index.insert(key.to_string(), self.next_id);
    }

    fn value_mut(&mut self, key: &str) -> Option<&mut String> {
        let id = self.index.get(key)?;
        self.rows.get_mut(id).map(|(_, v)| v)
    }
}

/// Process-local store. Rows keep their id when overwritten, like a table row
/// updated in place.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryRows>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl QueueStore for MemoryStore {
    async fn scan(&self, prefix: &str, limit: Option<usize>) -> Result<Vec<StoreEntry>, QueueError> {
        let inner = self.inner.lock().await;
        let matching = inner
            .rows
            .values()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| StoreEntry {
                key: k.clone(),
                value: v.clone(),
            });
        Ok(match limit {
            Some(n) => matching.take(n).collect(),
            None => matching.collect(),
        })
    }

    async fn get(&self, key: &str) -> Result<Option<String>, QueueError> {
        let mut inner = self.inner.lock().await;
        Ok(inner.value_mut(key).map(|v| v.clone()))
    }

    async fn put(&self, key: &str, value: &str) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().await;
        match inner.value_mut(key) {
            Some(existing) => *existing = value.to_string(),
            None => inner.insert(key, value),
        }
        Ok(())
    }

    async fn update_existing(&self, key: &str, value: &str) -> Result<bool, QueueError> {
        let mut inner = self.inner.lock().await;
        match inner.value_mut(key) {
            Some(existing) => {
                *existing = value.to_string();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn insert_if_absent(&self, key: &str, value: &str) -> Result<bool, QueueError> {
        let mut inner = self.inner.lock().await;
        if inner.index.contains_key(key) {
            return Ok(false);
        }
        inner.insert(key, value);
        Ok(true)
    }

    async fn compare_and_swap(&self, key: &str, expected: &str, new: &str) -> Result<bool, QueueError> {
        let mut inner = self.inner.lock().await;
        match inner.value_mut(key) {
            Some(existing) if existing == expected => {
                *existing = new.to_string();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete(&self, key: &str) -> Result<bool, QueueError> {
        let mut inner = self.inner.lock().await;
        match inner.index.remove(key) {
            Some(id) => {
                inner.rows.remove(&id);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, QueueError> {
        let mut inner = self.inner.lock().await;
        if inner.value_mut(key).map(|v| v.as_str()) != Some(expected) {
            return Ok(false);
        }
        if let Some(id) = inner.index.remove(key) {
            inner.rows.remove(&id);
        }
        Ok(true)
    }

    async fn count(&self, prefix: &str) -> Result<u64, QueueError> {
        let inner = self.inner.lock().await;
        Ok(inner.index.keys().filter(|k| k.starts_with(prefix)).count() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scan_follows_insertion_order_not_key_order() {
        let store = MemoryStore::new();
        store.put("q_b", "1").await.unwrap();
        store.put("q_a", "2").await.unwrap();
        store.put("other", "3").await.unwrap();

        let keys: Vec<_> = store
            .scan("q_", None)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.key)
            .collect();
        assert_eq!(keys, vec!["q_b", "q_a"]);
        assert_eq!(store.scan("q_", Some(1)).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn overwrite_keeps_row_position() {
        let store = MemoryStore::new();
        store.put("q_1", "a").await.unwrap();
        store.put("q_2", "b").await.unwrap();
        store.put("q_1", "c").await.unwrap();

        let first = store.scan("q_", Some(1)).await.unwrap().remove(0);
        assert_eq!(first.key, "q_1");
        assert_eq!(first.value, "c");
    }

    #[tokio::test]
    async fn update_existing_does_not_create_rows() {
        let store = MemoryStore::new();
        assert!(!store.update_existing("missing", "x").await.unwrap());
        assert_eq!(store.get("missing").await.unwrap(), None);

        store.put("present", "x").await.unwrap();
        assert!(store.update_existing("present", "y").await.unwrap());
        assert_eq!(store.get("present").await.unwrap().as_deref(), Some("y"));
    }

    #[tokio::test]
    async fn conditional_writes() {
        let store = MemoryStore::new();
        assert!(store.insert_if_absent("lock", "a").await.unwrap());
        assert!(!store.insert_if_absent("lock", "b").await.unwrap());

        assert!(!store.compare_and_swap("lock", "b", "c").await.unwrap());
        assert!(store.compare_and_swap("lock", "a", "c").await.unwrap());
        assert_eq!(store.get("lock").await.unwrap().as_deref(), Some("c"));

        assert!(!store.compare_and_delete("lock", "a").await.unwrap());
        assert!(!store.compare_and_delete("missing", "c").await.unwrap());
        assert!(store.compare_and_delete("lock", "c").await.unwrap());
        assert_eq!(store.get("lock").await.unwrap(), None);
    }

    #[tokio::test]
    async fn delete_and_count() {
        let store = MemoryStore::new();
        store.put("q_1", "a").await.unwrap();
        store.put("q_2", "b").await.unwrap();
        assert_eq!(store.count("q_").await.unwrap(), 2);

        assert!(store.delete("q_1").await.unwrap());
        assert!(!store.delete("q_1").await.unwrap());
        assert_eq!(store.count("q_").await.unwrap(), 1);
    }
}
