//! Recurring health-check entries.
//!
//! The scheduler only records *when* a hook is due. Something has to poll
//! [`Scheduler::claim_due`] (the server's tick loop does) and run the hook.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::QueueError;
use crate::store::QueueStore;

const KEY_PREFIX: &str = "sluice_cron_";

#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Register `hook` to recur every `interval`. No-op if already scheduled.
    async fn schedule(&self, hook: &str, interval: Duration) -> Result<(), QueueError>;

    /// Remove `hook`. Idempotent.
    async fn unschedule(&self, hook: &str) -> Result<(), QueueError>;

    async fn next_scheduled(&self, hook: &str) -> Result<Option<DateTime<Utc>>, QueueError>;

    /// If `hook` is due at `now`, advance it to its next run and return
    /// `true`. Of several concurrent callers for the same tick, exactly one
    /// gets `true`.
    async fn claim_due(&self, hook: &str, now: DateTime<Utc>) -> Result<bool, QueueError>;
}

/// Blanket implementation so `Arc<dyn Scheduler>` can be used directly.
#[async_trait]
impl<T: Scheduler + ?Sized> Scheduler for Arc<T> {
    async fn schedule(&self, hook: &str, interval: Duration) -> Result<(), QueueError> {
        (**self).schedule(hook, interval).await
    }
    async fn unschedule(&self, hook: &str) -> Result<(), QueueError> {
        (**self).unschedule(hook).await
    }
    async fn next_scheduled(&self, hook: &str) -> Result<Option<DateTime<Utc>>, QueueError> {
        (**self).next_scheduled(hook).await
    }
    async fn claim_due(&self, hook: &str, now: DateTime<Utc>) -> Result<bool, QueueError> {
        (**self).claim_due(hook, now).await
    }
}

/// Persisted schedule state for one hook.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleEntry {
    pub interval_secs: u64,
    pub next_run: DateTime<Utc>,
}

impl ScheduleEntry {
    /// First run strictly after `now`, keeping the original cadence. `None`
    /// when that run lies outside the representable time range.
    fn advanced(&self, now: DateTime<Utc>) -> Option<Self> {
        let step = i64::try_from(self.interval_secs.max(1)).ok()?;
        let mut next = self.next_run.checked_add_signed(TimeDelta::try_seconds(step)?)?;
        if next <= now {
            let behind = (now - next).num_seconds() / step + 1;
            next = next.checked_add_signed(TimeDelta::try_seconds(behind.checked_mul(step)?)?)?;
        }
        Some(Self {
            interval_secs: self.interval_secs,
            next_run: next,
        })
    }
}

/// Schedules kept in the queue store, shared by every process using it.
pub struct StoreScheduler {
    store: Arc<dyn QueueStore>,
}

impl StoreScheduler {
    pub fn new(store: Arc<dyn QueueStore>) -> Self {
        Self { store }
    }

    fn key(hook: &str) -> String {
        format!("{KEY_PREFIX}{hook}")
    }

    async fn entry(&self, hook: &str) -> Result<Option<(String, ScheduleEntry)>, QueueError> {
        let Some(raw) = self.store.get(&Self::key(hook)).await? else {
            return Ok(None);
        };
        match serde_json::from_str(&raw) {
            Ok(entry) => Ok(Some((raw, entry))),
            Err(e) => {
                warn!(hook, error = %e, "unreadable schedule entry");
                Ok(None)
            }
        }
    }
}

#[async_trait]
impl Scheduler for StoreScheduler {
    async fn schedule(&self, hook: &str, interval: Duration) -> Result<(), QueueError> {
        let interval_secs = interval.as_secs().max(1);
        let next_run = i64::try_from(interval_secs)
            .ok()
            .and_then(TimeDelta::try_seconds)
            .and_then(|step| Utc::now().checked_add_signed(step))
            .ok_or_else(|| QueueError::Config(format!("health check interval of {interval_secs}s is out of range")))?;
        let entry = ScheduleEntry {
            interval_secs,
            next_run,
        };
        let inserted = self
            .store
            .insert_if_absent(&Self::key(hook), &serde_json::to_string(&entry)?)
            .await?;
        if inserted {
            info!(hook, next_run = %entry.next_run, "health check scheduled");
        }
        Ok(())
    }

    async fn unschedule(&self, hook: &str) -> Result<(), QueueError> {
        if self.store.delete(&Self::key(hook)).await? {
            info!(hook, "health check unscheduled");
        }
        Ok(())
    }

    async fn next_scheduled(&self, hook: &str) -> Result<Option<DateTime<Utc>>, QueueError> {
        Ok(self.entry(hook).await?.map(|(_, e)| e.next_run))
    }

    async fn claim_due(&self, hook: &str, now: DateTime<Utc>) -> Result<bool, QueueError> {
        let Some((raw, entry)) = self.entry(hook).await? else {
            return Ok(false);
        };
        if entry.next_run > now {
            return Ok(false);
        }
        let Some(next) = entry.advanced(now) else {
            warn!(hook, interval_secs = entry.interval_secs, "schedule interval out of range, not claiming");
            return Ok(false);
        };
        let claimed = self
            .store
            .compare_and_swap(&Self::key(hook), &raw, &serde_json::to_string(&next)?)
            .await?;
        if claimed {
            debug!(hook, next_run = %next.next_run, "claimed due health check");
        }
        Ok(claimed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn scheduler() -> StoreScheduler {
        StoreScheduler::new(Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn schedule_is_idempotent() {
        let s = scheduler();
        s.schedule("q_health_check", Duration::from_secs(300)).await.unwrap();
        let first = s.next_scheduled("q_health_check").await.unwrap().unwrap();

        s.schedule("q_health_check", Duration::from_secs(10)).await.unwrap();
        assert_eq!(s.next_scheduled("q_health_check").await.unwrap(), Some(first));
    }

    #[tokio::test]
    async fn unschedule_clears_entry() {
        let s = scheduler();
        s.unschedule("q_health_check").await.unwrap();
        s.schedule("q_health_check", Duration::from_secs(300)).await.unwrap();
        s.unschedule("q_health_check").await.unwrap();
        assert_eq!(s.next_scheduled("q_health_check").await.unwrap(), None);
        assert!(!s.claim_due("q_health_check", Utc::now()).await.unwrap());
    }

    #[tokio::test]
    async fn due_tick_is_claimed_once() {
        let s = scheduler();
        s.schedule("q_health_check", Duration::from_secs(300)).await.unwrap();
        let next = s.next_scheduled("q_health_check").await.unwrap().unwrap();

        assert!(!s.claim_due("q_health_check", next - chrono::Duration::seconds(1)).await.unwrap());
        assert!(s.claim_due("q_health_check", next).await.unwrap());
        assert!(!s.claim_due("q_health_check", next).await.unwrap());

        let after = s.next_scheduled("q_health_check").await.unwrap().unwrap();
        assert_eq!(after, next + chrono::Duration::seconds(300));
    }

    #[test]
    fn advancing_skips_missed_ticks() {
        let start = DateTime::from_timestamp(0, 0).unwrap();
        let entry = ScheduleEntry {
            interval_secs: 60,
            next_run: start,
        };
        let now = start + chrono::Duration::seconds(200);
        assert_eq!(entry.advanced(now).unwrap().next_run, start + chrono::Duration::seconds(240));
    }

    #[tokio::test]
    async fn out_of_range_interval_is_refused_without_panicking() {
        let s = scheduler();
        let err = s.schedule("q_health_check", Duration::from_secs(u64::MAX)).await.unwrap_err();
        assert!(matches!(err, QueueError::Config(_)));
        assert_eq!(s.next_scheduled("q_health_check").await.unwrap(), None);

        let entry = ScheduleEntry {
            interval_secs: u64::MAX,
            next_run: Utc::now() - chrono::Duration::seconds(1),
        };
        s.store
            .put("sluice_cron_q_health_check", &serde_json::to_string(&entry).unwrap())
            .await
            .unwrap();
        assert!(!s.claim_due("q_health_check", Utc::now()).await.unwrap());
        assert_eq!(s.next_scheduled("q_health_check").await.unwrap(), Some(entry.next_run));
    }
}
