//! Persisted batches and the FIFO queue over them.
//!
//! A batch is one store row `{identifier}_batch_{stamp}` whose value is the
//! JSON array of its items. Keys start with a zero-padded microsecond stamp,
//! so key order and row order both follow creation order.
//!
//! A batch whose value cannot be decoded is moved aside to
//! `{identifier}_dead_{stamp}` so the batches behind it can still drain.

use std::marker::PhantomData;
use std::sync::Arc;

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::error::QueueError;
use crate::store::{QueueStore, StoreEntry};

const MAX_KEY_LEN: usize = 64;

/// A persisted, ordered group of items.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch<T> {
    pub key: String,
    pub items: Vec<T>,
}

impl<T> Batch<T> {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// What `update` did with a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateResult {
    /// Remaining items were written back.
    Written,
    /// The batch became empty and was removed.
    Deleted,
    /// The batch no longer existed (e.g. cancelled mid-pass); nothing written.
    Vanished,
}

/// FIFO collection of batches for one queue identifier.
pub struct BatchQueue<T> {
    store: Arc<dyn QueueStore>,
    prefix: String,
    dead_prefix: String,
    _items: PhantomData<fn() -> T>,
}

impl<T> BatchQueue<T>
where
    T: Serialize + DeserializeOwned + Send,
{
    pub fn new(store: Arc<dyn QueueStore>, identifier: &str) -> Self {
        Self {
            store,
            prefix: format!("{identifier}_batch_"),
            dead_prefix: format!("{identifier}_dead_"),
            _items: PhantomData,
        }
    }

    /// Key prefix shared by every batch of this queue.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Fresh key: prefix, microsecond stamp, then random hex, capped at 64 chars.
    pub fn generate_key(&self) -> String {
        let stamp = Utc::now().timestamp_micros().max(0);
        let mut key = format!("{}{:020}{}", self.prefix, stamp, Uuid::new_v4().simple());
        key.truncate(MAX_KEY_LEN.max(self.prefix.len() + 28));
        key
    }

    /// Persist `items` as a brand-new batch. Returns the new key, or `None`
    /// when there was nothing to store.
    pub async fn enqueue_new_batch(&self, items: Vec<T>) -> Result<Option<String>, QueueError> {
        if items.is_empty() {
            return Ok(None);
        }
        let key = self.generate_key();
        let value = serde_json::to_string(&items)?;
        if !self.store.insert_if_absent(&key, &value).await? {
            return Err(QueueError::Store(format!("batch key collision on {key}")));
        }
        debug!(batch = %key, items = items.len(), "batch enqueued");
        Ok(Some(key))
    }

    /// The earliest-created batch, or `None` when the queue is empty.
    /// Undecodable batches met on the way are set aside.
    pub async fn peek_oldest(&self) -> Result<Option<Batch<T>>, QueueError> {
        loop {
            let Some(entry) = self.store.scan(&self.prefix, Some(1)).await?.into_iter().next() else {
                return Ok(None);
            };
            match serde_json::from_str(&entry.value) {
                Ok(items) => {
                    return Ok(Some(Batch {
                        key: entry.key,
                        items,
                    }))
                }
                Err(e) => self.set_aside(&entry, &e).await?,
            }
        }
    }

    /// Move an undecodable row out of the batch namespace. Copy first, then
    /// delete the original only if nobody rewrote it meanwhile.
    async fn set_aside(&self, entry: &StoreEntry, cause: &serde_json::Error) -> Result<(), QueueError> {
        let suffix = entry.key.strip_prefix(&self.prefix).unwrap_or(&entry.key);
        let dead_key = format!("{}{suffix}", self.dead_prefix);
        self.store.insert_if_absent(&dead_key, &entry.value).await?;
        if self.store.compare_and_delete(&entry.key, &entry.value).await? {
            error!(batch = %entry.key, dead_key = %dead_key, error = %cause, "undecodable batch set aside");
        }
        Ok(())
    }

    /// Rows set aside by [`peek_oldest`](Self::peek_oldest), oldest first.
    pub async fn dead_letters(&self) -> Result<Vec<StoreEntry>, QueueError> {
        self.store.scan(&self.dead_prefix, None).await
    }

    pub async fn dead_len(&self) -> Result<u64, QueueError> {
        self.store.count(&self.dead_prefix).await
    }

    /// Key of the earliest-created batch, without decoding its items.
    pub async fn oldest_key(&self) -> Result<Option<String>, QueueError> {
        let entry = self.store.scan(&self.prefix, Some(1)).await?.into_iter().next();
        Ok(entry.map(|e| e.key))
    }

    /// All batches in drain order.
    pub async fn batches(&self) -> Result<Vec<Batch<T>>, QueueError> {
        self.store
            .scan(&self.prefix, None)
            .await?
            .into_iter()
            .map(decode)
            .collect()
    }

    /// Write back the remaining items, or delete the batch when none remain.
    ///
    /// Never recreates a batch that was deleted while it was being processed.
    pub async fn update(&self, key: &str, items: &[T]) -> Result<UpdateResult, QueueError> {
        if items.is_empty() {
            self.store.delete(key).await?;
            return Ok(UpdateResult::Deleted);
        }
        let value = serde_json::to_string(items)?;
        if self.store.update_existing(key, &value).await? {
            Ok(UpdateResult::Written)
        } else {
            warn!(batch = %key, "batch disappeared during processing, not rewriting it");
            Ok(UpdateResult::Vanished)
        }
    }

    pub async fn delete(&self, key: &str) -> Result<bool, QueueError> {
        self.store.delete(key).await
    }

    pub async fn is_empty(&self) -> Result<bool, QueueError> {
        Ok(self.store.count(&self.prefix).await? == 0)
    }

    /// Number of batches currently queued.
    pub async fn len(&self) -> Result<u64, QueueError> {
        self.store.count(&self.prefix).await
    }
}

fn decode<T: DeserializeOwned>(entry: StoreEntry) -> Result<Batch<T>, QueueError> {
    let items = serde_json::from_str(&entry.value)?;
    Ok(Batch {
        key: entry.key,
        items,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn queue() -> (BatchQueue<u32>, Arc<dyn QueueStore>) {
        let store: Arc<dyn QueueStore> = Arc::new(MemoryStore::new());
        (BatchQueue::new(store.clone(), "jobs"), store)
    }

    #[test]
    fn keys_are_namespaced_unique_and_bounded() {
        let (q, _) = queue();
        let a = q.generate_key();
        let b = q.generate_key();
        assert!(a.starts_with("jobs_batch_"));
        assert!(a.len() <= 64);
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn empty_items_are_not_enqueued() {
        let (q, _) = queue();
        assert_eq!(q.enqueue_new_batch(vec![]).await.unwrap(), None);
        assert!(q.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn oldest_batch_comes_first() {
        let (q, _) = queue();
        q.enqueue_new_batch(vec![1, 2]).await.unwrap();
        q.enqueue_new_batch(vec![3]).await.unwrap();

        let oldest = q.peek_oldest().await.unwrap().unwrap();
        assert_eq!(oldest.items, vec![1, 2]);
        assert_eq!(q.len().await.unwrap(), 2);

        let all: Vec<_> = q.batches().await.unwrap().into_iter().map(|b| b.items).collect();
        assert_eq!(all, vec![vec![1, 2], vec![3]]);
    }

    #[tokio::test]
    async fn update_writes_remainder_or_deletes() {
        let (q, _) = queue();
        let key = q.enqueue_new_batch(vec![1, 2, 3]).await.unwrap().unwrap();

        assert_eq!(q.update(&key, &[3]).await.unwrap(), UpdateResult::Written);
        assert_eq!(q.peek_oldest().await.unwrap().unwrap().items, vec![3]);

        assert_eq!(q.update(&key, &[]).await.unwrap(), UpdateResult::Deleted);
        assert!(q.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn update_does_not_resurrect_deleted_batch() {
        let (q, _) = queue();
        let key = q.enqueue_new_batch(vec![1, 2]).await.unwrap().unwrap();
        assert!(q.delete(&key).await.unwrap());

        assert_eq!(q.update(&key, &[2]).await.unwrap(), UpdateResult::Vanished);
        assert!(q.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn other_rows_are_not_batches() {
        let (q, store) = queue();
        store.put("jobs_process_lock", "{}").await.unwrap();
        store.put("jobs_batchless", "[]").await.unwrap();
        assert!(q.is_empty().await.unwrap());
        assert!(q.peek_oldest().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn undecodable_batch_is_set_aside_and_the_rest_still_drains() {
        let (q, store) = queue();
        store.put("jobs_batch_00000000000000000001", "not json").await.unwrap();
        q.enqueue_new_batch(vec![5, 6]).await.unwrap();

        let oldest = q.peek_oldest().await.unwrap().unwrap();
        assert_eq!(oldest.items, vec![5, 6]);
        assert_eq!(q.len().await.unwrap(), 1);

        let dead = q.dead_letters().await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].key, "jobs_dead_00000000000000000001");
        assert_eq!(dead[0].value, "not json");
        assert_eq!(q.dead_len().await.unwrap(), 1);
    }
}
