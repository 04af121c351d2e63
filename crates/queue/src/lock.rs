//! Time-boxed process lock stored next to the batches.
//!
//! Acquisition never reads-then-writes: a fresh lock is created with
//! [`QueueStore::insert_if_absent`], and an expired one is taken over with
//! [`QueueStore::compare_and_swap`] against the exact record that was seen
//! expired. Two workers racing for the same lock therefore cannot both win.
//!
//! A holder keeps a long pass covered with [`ProcessLock::renew`], and
//! [`ProcessLock::release`] only ever removes the caller's own record.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::QueueError;
use crate::store::QueueStore;

/// The persisted lock record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub holder: String,
    pub acquired_at: DateTime<Utc>,
    pub ttl_secs: u64,
}

impl LockRecord {
    /// `None` when the ttl reaches past the representable range: such a
    /// record never expires.
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        let ttl = i64::try_from(self.ttl_secs).ok().and_then(TimeDelta::try_seconds)?;
        self.acquired_at.checked_add_signed(ttl)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at().is_some_and(|expires_at| now >= expires_at)
    }
}

/// Mutual-exclusion token for one logical queue.
pub struct ProcessLock {
    store: Arc<dyn QueueStore>,
    key: String,
    holder: String,
}

impl ProcessLock {
    /// Create a lock handle for `identifier`. Each handle gets its own holder id.
    pub fn new(store: Arc<dyn QueueStore>, identifier: &str) -> Self {
        Self {
            store,
            key: format!("{identifier}_process_lock"),
            holder: Uuid::new_v4().to_string(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// Take the lock if nobody holds it or the current record has expired.
    pub async fn try_acquire(&self, ttl: Duration) -> Result<bool, QueueError> {
        self.try_acquire_at(ttl, Utc::now()).await
    }

    pub(crate) async fn try_acquire_at(
        &self,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, QueueError> {
        let encoded = self.encode(ttl, now)?;

        if self.store.insert_if_absent(&self.key, &encoded).await? {
            debug!(lock = %self.key, holder = %self.holder, "lock acquired");
            return Ok(true);
        }

        let Some(current_raw) = self.store.get(&self.key).await? else {
            // Released between our insert and read; one more conditional insert.
            return self.store.insert_if_absent(&self.key, &encoded).await;
        };

        match serde_json::from_str::<LockRecord>(&current_raw) {
            Ok(current) if !current.is_expired(now) => {
                debug!(
                    lock = %self.key,
                    holder = %current.holder,
                    expires_at = ?current.expires_at(),
                    "lock held by another worker"
                );
                Ok(false)
            }
            Ok(current) => {
                let taken = self
                    .store
                    .compare_and_swap(&self.key, &current_raw, &encoded)
                    .await?;
                if taken {
                    info!(
                        lock = %self.key,
                        previous_holder = %current.holder,
                        "took over expired lock"
                    );
                }
                Ok(taken)
            }
            Err(e) => {
                // An unreadable record cannot be proven live; replace it atomically.
                warn!(lock = %self.key, error = %e, "unreadable lock record, replacing");
                self.store
                    .compare_and_swap(&self.key, &current_raw, &encoded)
                    .await
            }
        }
    }

    /// Whether an unexpired lock exists, whoever holds it.
    pub async fn is_held(&self) -> Result<bool, QueueError> {
        Ok(self.current().await?.is_some_and(|r| !r.is_expired(Utc::now())))
    }

    /// The current lock record, if any (expired or not).
    pub async fn current(&self) -> Result<Option<LockRecord>, QueueError> {
        let Some(raw) = self.store.get(&self.key).await? else {
            return Ok(None);
        };
        Ok(serde_json::from_str(&raw).ok())
    }

    /// Restart the ttl of a lock this handle holds. Returns `false` when the
    /// record is gone or belongs to someone else, i.e. the lock was lost.
    pub async fn renew(&self, ttl: Duration) -> Result<bool, QueueError> {
        let Some((raw, _)) = self.own_record().await? else {
            warn!(lock = %self.key, holder = %self.holder, "lock lost before renewal");
            return Ok(false);
        };
        let renewed = self
            .store
            .compare_and_swap(&self.key, &raw, &self.encode(ttl, Utc::now())?)
            .await?;
        if renewed {
            debug!(lock = %self.key, holder = %self.holder, "lock renewed");
        } else {
            warn!(lock = %self.key, holder = %self.holder, "lock changed hands during renewal");
        }
        Ok(renewed)
    }

    /// Delete the lock record if this handle holds it. Idempotent; a record
    /// written by another holder is left alone.
    pub async fn release(&self) -> Result<(), QueueError> {
        let Some((raw, _)) = self.own_record().await? else {
            return Ok(());
        };
        if self.store.compare_and_delete(&self.key, &raw).await? {
            debug!(lock = %self.key, holder = %self.holder, "lock released");
        }
        Ok(())
    }

    async fn own_record(&self) -> Result<Option<(String, LockRecord)>, QueueError> {
        let Some(raw) = self.store.get(&self.key).await? else {
            return Ok(None);
        };
        match serde_json::from_str::<LockRecord>(&raw) {
            Ok(record) if record.holder == self.holder => Ok(Some((raw, record))),
            Ok(record) => {
                debug!(lock = %self.key, holder = %record.holder, "lock held by another worker");
                Ok(None)
            }
            Err(_) => Ok(None),
        }
    }

    fn encode(&self, ttl: Duration, now: DateTime<Utc>) -> Result<String, QueueError> {
        Ok(serde_json::to_string(&LockRecord {
            holder: self.holder.clone(),
            acquired_at: now,
            ttl_secs: ttl.as_secs().max(1),
        })?)
    }
}
