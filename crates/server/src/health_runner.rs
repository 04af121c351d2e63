//! Background health-check loop.
//!
//! Polls the schedule every tick; when the queue's health-check entry is due
//! and this process wins the claim, runs the processor's health check.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use sluice_queue::{BatchProcessor, HealthCheckOutcome, Scheduler, TaskHandler};

/// Main loop. Spawned as a tokio task; runs until aborted.
pub async fn run_health_check_loop<H: TaskHandler>(
    processor: Arc<BatchProcessor<H>>,
    scheduler: Arc<dyn Scheduler>,
    tick: Duration,
) {
    info!(
        hook = %processor.health_check_hook(),
        tick_secs = tick.as_secs(),
        "health-check loop started"
    );
    let mut interval = tokio::time::interval(tick);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        tick_once(&processor, scheduler.as_ref()).await;
    }
}

/// One poll. Returns the health-check outcome when it ran.
pub async fn tick_once<H: TaskHandler>(
    processor: &BatchProcessor<H>,
    scheduler: &dyn Scheduler,
) -> Option<HealthCheckOutcome> {
    let hook = processor.health_check_hook();
    match scheduler.claim_due(hook, Utc::now()).await {
        Ok(true) => {}
        Ok(false) => return None,
        Err(e) => {
            warn!(hook, error = %e, "failed to poll health-check schedule");
            return None;
        }
    }

    match processor.handle_health_check().await {
        Ok(outcome) => {
            debug!(hook, ?outcome, "health check ran");
            Some(outcome)
        }
        Err(e) => {
            warn!(hook, error = %e, "health check failed");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sluice_queue::{
        ChannelDispatcher, MemoryStore, Outcome, PassOutcome, ProcessorConfig, QueueStore, ScheduleEntry,
        StoreScheduler, TaskError,
    };

    struct Remove;

    #[async_trait::async_trait]
    impl TaskHandler for Remove {
        type Item = u32;

        async fn process(&self, _item: u32) -> Result<Outcome<u32>, TaskError> {
            Ok(Outcome::Remove)
        }
    }

    fn setup() -> (BatchProcessor<Remove>, Arc<dyn QueueStore>, StoreScheduler) {
        let store: Arc<dyn QueueStore> = Arc::new(MemoryStore::new());
        let (dispatcher, _rx) = ChannelDispatcher::new();
        let processor = BatchProcessor::builder(Arc::new(Remove), store.clone(), Arc::new(dispatcher))
            .config(ProcessorConfig::new("jobs"))
            .build()
            .unwrap();
        (processor, store.clone(), StoreScheduler::new(store))
    }

    async fn make_due(store: &Arc<dyn QueueStore>) {
        let entry = ScheduleEntry {
            interval_secs: 300,
            next_run: Utc::now() - chrono::Duration::seconds(1),
        };
        store
            .put("sluice_cron_jobs_health_check", &serde_json::to_string(&entry).unwrap())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn nothing_runs_without_a_due_entry() {
        let (processor, _store, scheduler) = setup();
        assert!(tick_once(&processor, &scheduler).await.is_none());
    }

    #[tokio::test]
    async fn due_entry_restarts_stalled_queue() {
        let (processor, store, scheduler) = setup();
        processor.push_to_queue(1).push_to_queue(2);
        processor.save().await.unwrap();
        make_due(&store).await;

        let outcome = tick_once(&processor, &scheduler).await.unwrap();

        let HealthCheckOutcome::Restarted { pass } = outcome else {
            panic!("expected restart, got {outcome:?}");
        };
        assert!(matches!(pass, PassOutcome::Completed { .. }));
        assert!(processor.is_queue_empty().await.unwrap());
        // Completion cleared the schedule.
        assert!(tick_once(&processor, &scheduler).await.is_none());
    }

    #[tokio::test]
    async fn due_entry_on_empty_queue_unschedules() {
        let (processor, store, scheduler) = setup();
        make_due(&store).await;

        let outcome = tick_once(&processor, &scheduler).await;

        assert_eq!(outcome, Some(HealthCheckOutcome::QueueEmpty));
        assert_eq!(scheduler.next_scheduled("jobs_health_check").await.unwrap(), None);
    }
}
