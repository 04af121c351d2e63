//! The batch-draining engine.
//!
//! A pass moves through `Idle → Locking → Draining → Continuing | Completing
//! → Idle`. It takes the process lock, repeatedly handles the oldest batch
//! until the budget runs out or the queue is empty, writes progress back
//! after every batch, releases the lock, and then either re-dispatches
//! itself or runs the completion hook.
//!
//! A store failure ends the pass with the lock still held: the batch state is
//! unknown, so the lock is left to expire rather than let another worker in
//! early.
//!
//! A draining pass renews its lock once half the lock ttl has gone by, so a
//! pass without a time budget (`Cli`) keeps exclusive access for as long as
//! each single item finishes within the ttl. If a renewal finds the lock in
//! other hands, the pass stops without writing back its current batch.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use sluice_core::FaultPolicy;

use crate::batch::{Batch, BatchQueue, UpdateResult};
use crate::budget::{BudgetMonitor, BudgetSnapshot, InvocationContext, MemoryProbe, ProcessMemory};
use crate::config::ProcessorConfig;
use crate::dispatch::Dispatcher;
use crate::error::{QueueError, TaskError};
use crate::handler::{Outcome, TaskHandler};
use crate::hooks::Hooks;
use crate::lock::{LockRecord, ProcessLock};
use crate::schedule::{Scheduler, StoreScheduler};
use crate::store::QueueStore;

// ── Pass state and results ───────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessorState {
    Idle,
    Locking,
    Draining,
    Continuing,
    Completing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Another pass holds the lock.
    LockContention,
    /// The `before_lock` hook declined the pass.
    Vetoed,
}

/// Counters for one pass that held the lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PassReport {
    pub context: InvocationContext,
    /// Handler invocations, including failed ones.
    pub processed: u64,
    /// Handler invocations that returned an error or panicked.
    pub failed: u64,
    /// Batches written back or deleted during the pass.
    pub batches_touched: u64,
    /// Batches left in the queue after the lock was released.
    pub remaining_batches: u64,
    pub budget_exceeded: bool,
    /// Budget readings at the moment the pass stopped for lack of budget.
    pub budget: Option<BudgetSnapshot>,
    pub elapsed_ms: u64,
    /// Reason given by a fatal handler error, if one ended the pass.
    pub fatal: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PassOutcome {
    Skipped { reason: SkipReason },
    /// The queue was drained; the completion hook ran.
    Completed { report: PassReport },
    /// Work remains; a continuation was dispatched (unless vetoed).
    Continued { report: PassReport, dispatched: bool },
    /// A fatal handler error stopped the pass; the health check restarts it.
    Aborted { report: PassReport },
    /// The lock expired and was taken over mid-pass; the new holder owns the
    /// queue, so nothing was dispatched and the current batch was left as is.
    LockLost { report: PassReport },
}

impl PassOutcome {
    pub fn report(&self) -> Option<&PassReport> {
        match self {
            Self::Skipped { .. } => None,
            Self::Completed { report }
            | Self::Continued { report, .. }
            | Self::Aborted { report }
            | Self::LockLost { report } => Some(report),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum HealthCheckOutcome {
    /// A live lock exists; the active worker is trusted.
    WorkerActive,
    /// Nothing queued; the schedule was cleared.
    QueueEmpty,
    /// The queue was stalled and a pass was started.
    Restarted { pass: PassOutcome },
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueStatus {
    pub identifier: String,
    pub batches: u64,
    /// Undecodable batches that were set aside.
    pub dead_batches: u64,
    pub pending_items: usize,
    pub locked: bool,
    pub lock: Option<LockRecord>,
    pub state: ProcessorState,
    pub next_health_check: Option<DateTime<Utc>>,
}

struct DrainResult {
    processed: u64,
    failed: u64,
    batches_touched: u64,
    budget: Option<BudgetSnapshot>,
    fatal: Option<String>,
    lock_lost: bool,
}

// ── Builder ──────────────────────────────────────────────────────────

pub struct BatchProcessorBuilder<H: TaskHandler> {
    handler: Arc<H>,
    store: Arc<dyn QueueStore>,
    dispatcher: Arc<dyn Dispatcher>,
    config: ProcessorConfig,
    scheduler: Option<Arc<dyn Scheduler>>,
    probe: Option<Arc<dyn MemoryProbe>>,
    hooks: Hooks,
}

impl<H: TaskHandler> BatchProcessorBuilder<H> {
    pub fn config(mut self, config: ProcessorConfig) -> Self {
        self.config = config;
        self
    }

    /// Default: a [`StoreScheduler`] over the processor's store.
    pub fn scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// Default: this process's resident memory.
    pub fn memory_probe(mut self, probe: Arc<dyn MemoryProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn hooks(mut self, hooks: Hooks) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn build(self) -> Result<BatchProcessor<H>, QueueError> {
        self.config.validate()?;
        let identifier = self.config.identifier.clone();
        let scheduler = self
            .scheduler
            .unwrap_or_else(|| Arc::new(StoreScheduler::new(self.store.clone())));
        let probe = self.probe.unwrap_or_else(|| Arc::new(ProcessMemory::new()));
        let (state, _) = watch::channel(ProcessorState::Idle);

        Ok(BatchProcessor {
            queue: BatchQueue::new(self.store.clone(), &identifier),
            lock: ProcessLock::new(self.store, &identifier),
            health_check_hook: self.config.health_check_hook(),
            config: self.config,
            handler: self.handler,
            dispatcher: self.dispatcher,
            scheduler,
            probe,
            hooks: self.hooks,
            pending: Mutex::new(Vec::new()),
            state,
        })
    }
}

// ── Processor ────────────────────────────────────────────────────────

pub struct BatchProcessor<H: TaskHandler> {
    config: ProcessorConfig,
    handler: Arc<H>,
    queue: BatchQueue<H::Item>,
    lock: ProcessLock,
    dispatcher: Arc<dyn Dispatcher>,
    scheduler: Arc<dyn Scheduler>,
    probe: Arc<dyn MemoryProbe>,
    hooks: Hooks,
    health_check_hook: String,
    /// Items pushed since the last `save`.
    pending: Mutex<Vec<H::Item>>,
    state: watch::Sender<ProcessorState>,
}

impl<H: TaskHandler> BatchProcessor<H> {
    pub fn builder(
        handler: Arc<H>,
        store: Arc<dyn QueueStore>,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> BatchProcessorBuilder<H> {
        BatchProcessorBuilder {
            handler,
            store,
            dispatcher,
            config: ProcessorConfig::default(),
            scheduler: None,
            probe: None,
            hooks: Hooks::default(),
        }
    }

    pub fn identifier(&self) -> &str {
        &self.config.identifier
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    pub fn health_check_hook(&self) -> &str {
        &self.health_check_hook
    }

    pub fn queue(&self) -> &BatchQueue<H::Item> {
        &self.queue
    }

    pub fn lock(&self) -> &ProcessLock {
        &self.lock
    }

    pub fn state(&self) -> ProcessorState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ProcessorState> {
        self.state.subscribe()
    }

    fn set_state(&self, next: ProcessorState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!(queue = %self.config.identifier, from = ?previous, to = ?next, "processor state");
        }
    }

    // ── Enqueue side ─────────────────────────────────────────────────

    /// Buffer an item until the next [`save`](Self::save).
    pub fn push_to_queue(&self, item: H::Item) -> &Self {
        self.pending_items().push(item);
        self
    }

    fn pending_items(&self) -> std::sync::MutexGuard<'_, Vec<H::Item>> {
        self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Flush buffered items into a brand-new batch.
    pub async fn save(&self) -> Result<&Self, QueueError> {
        let items = std::mem::take(&mut *self.pending_items());
        if items.is_empty() {
            return Ok(self);
        }
        let count = items.len();
        match self.queue.enqueue_new_batch(items.clone()).await {
            Ok(key) => {
                info!(queue = %self.config.identifier, batch = ?key, items = count, "batch saved");
                Ok(self)
            }
            Err(e) => {
                // Put the items back in front of anything pushed meanwhile.
                let mut pending = self.pending_items();
                let newer = std::mem::replace(&mut *pending, items);
                pending.extend(newer);
                Err(e)
            }
        }
    }

    /// Install the health check and fire a trigger for a new pass.
    pub async fn dispatch(&self) -> Result<(), QueueError> {
        self.scheduler
            .schedule(&self.health_check_hook, self.config.health_check_interval)
            .await?;
        self.dispatcher.dispatch(&self.config.identifier).await?;
        debug!(queue = %self.config.identifier, "dispatched");
        Ok(())
    }

    /// Delete every batch, including set-aside ones, and clear the health check.
    ///
    /// Takes the lock first when it is free, so a pass cannot start in the
    /// middle of the purge. A pass that is already running may still finish
    /// its current item, but it will not write back a batch purged here.
    pub async fn cancel(&self) -> Result<(), QueueError> {
        let locked = self.lock.try_acquire(self.config.lock_ttl).await?;
        let purge = self.purge().await;
        if locked {
            self.lock.release().await?;
        }
        let purged = purge?;
        self.scheduler.unschedule(&self.health_check_hook).await?;
        info!(queue = %self.config.identifier, batches = purged, "queue cancelled");
        Ok(())
    }

    async fn purge(&self) -> Result<u64, QueueError> {
        let mut purged = 0;
        // Keys only: undecodable batches must go too.
        while let Some(key) = self.queue.oldest_key().await? {
            self.queue.delete(&key).await?;
            purged += 1;
        }
        for dead in self.queue.dead_letters().await? {
            if self.queue.delete(&dead.key).await? {
                purged += 1;
            }
        }
        Ok(purged)
    }

    pub async fn is_queue_empty(&self) -> Result<bool, QueueError> {
        self.queue.is_empty().await
    }

    /// Whether some pass currently holds the lock.
    pub async fn is_processing(&self) -> Result<bool, QueueError> {
        self.lock.is_held().await
    }

    pub async fn status(&self) -> Result<QueueStatus, QueueError> {
        let lock = self.lock.current().await?;
        let batches = self.queue.len().await?;
        let dead_batches = self.queue.dead_len().await?;
        let next_health_check = self.scheduler.next_scheduled(&self.health_check_hook).await?;
        let pending_items = self.pending_items().len();
        Ok(QueueStatus {
            identifier: self.config.identifier.clone(),
            batches,
            dead_batches,
            pending_items,
            locked: lock.as_ref().is_some_and(|l| !l.is_expired(Utc::now())),
            lock,
            state: self.state(),
            next_health_check,
        })
    }

    // ── Drain side ───────────────────────────────────────────────────

    /// Entry point for a trigger. Lock contention is a normal skip.
    pub async fn handle_trigger(&self, context: InvocationContext) -> Result<PassOutcome, QueueError> {
        let queue = self.config.identifier.as_str();

        if !self.hooks.allow_lock(context) {
            debug!(queue, ?context, "pass vetoed before locking");
            return Ok(PassOutcome::Skipped {
                reason: SkipReason::Vetoed,
            });
        }

        self.set_state(ProcessorState::Locking);
        let locked_at = Utc::now();
        match self.lock.try_acquire(self.config.lock_ttl).await {
            Ok(true) => {}
            Ok(false) => {
                self.set_state(ProcessorState::Idle);
                info!(queue, ?context, "another pass holds the lock, skipping");
                return Ok(PassOutcome::Skipped {
                    reason: SkipReason::LockContention,
                });
            }
            Err(e) => {
                self.set_state(ProcessorState::Idle);
                return Err(e);
            }
        }

        self.set_state(ProcessorState::Draining);
        let start = Instant::now();
        let drained = match self.drain(context, start, locked_at).await {
            Ok(drained) => drained,
            Err(e) => {
                self.set_state(ProcessorState::Idle);
                error!(
                    queue,
                    error = %e,
                    "store failure during pass, leaving lock to expire"
                );
                return Err(e);
            }
        };

        if !drained.lock_lost {
            if let Err(e) = self.lock.release().await {
                warn!(queue, error = %e, "failed to release lock, it will expire");
            }
        }

        let remaining_batches = self.queue.len().await.inspect_err(|_| {
            self.set_state(ProcessorState::Idle);
        })?;
        let report = PassReport {
            context,
            processed: drained.processed,
            failed: drained.failed,
            batches_touched: drained.batches_touched,
            remaining_batches,
            budget_exceeded: drained.budget.is_some(),
            budget: drained.budget,
            elapsed_ms: u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX),
            fatal: drained.fatal,
        };

        let outcome = if drained.lock_lost {
            warn!(queue, processed = report.processed, "pass lost its lock, stopping without continuation");
            PassOutcome::LockLost { report }
        } else {
            self.finish_pass(report).await
        };
        self.set_state(ProcessorState::Idle);
        if let Some(report) = outcome.report() {
            self.hooks.observe(report);
        }
        Ok(outcome)
    }

    async fn finish_pass(&self, report: PassReport) -> PassOutcome {
        let queue = self.config.identifier.as_str();

        if let Some(reason) = &report.fatal {
            warn!(queue, reason = %reason, processed = report.processed, "pass aborted by fatal task error");
            return PassOutcome::Aborted { report };
        }

        if report.remaining_batches > 0 {
            self.set_state(ProcessorState::Continuing);
            let mut dispatched = false;
            if self.hooks.allow_dispatch(report.remaining_batches) {
                match self.dispatch().await {
                    Ok(()) => dispatched = true,
                    Err(e) => warn!(queue, error = %e, "continuation dispatch failed, health check will retry"),
                }
            }
            info!(
                queue,
                processed = report.processed,
                remaining_batches = report.remaining_batches,
                dispatched,
                "pass ended with work remaining"
            );
            return PassOutcome::Continued { report, dispatched };
        }

        self.set_state(ProcessorState::Completing);
        self.handler.on_complete().await;
        if let Err(e) = self.scheduler.unschedule(&self.health_check_hook).await {
            warn!(queue, error = %e, "failed to clear health check");
        }
        info!(queue, processed = report.processed, "queue drained");
        PassOutcome::Completed { report }
    }

    async fn drain(
        &self,
        context: InvocationContext,
        start: Instant,
        locked_at: DateTime<Utc>,
    ) -> Result<DrainResult, QueueError> {
        let budget = BudgetMonitor::new(
            self.pass_time_limit(),
            self.config.memory_ceiling,
            self.probe.clone(),
            context,
        );
        let mut renewed_at = locked_at;
        let mut result = DrainResult {
            processed: 0,
            failed: 0,
            batches_touched: 0,
            budget: None,
            fatal: None,
            lock_lost: false,
        };

        while let Some(Batch { key, items }) = self.queue.peek_oldest().await? {
            let mut remaining = Vec::with_capacity(items.len());
            let mut unprocessed = items.into_iter();

            for item in unprocessed.by_ref() {
                match self.run_task(item.clone()).await {
                    Ok(Outcome::Remove) => {}
                    Ok(Outcome::Requeue(next)) => remaining.push(next),
                    Err(TaskError::Failed(reason)) => {
                        result.failed += 1;
                        warn!(batch = %key, reason = %reason, policy = %self.config.fault_policy, "task failed");
                        if self.config.fault_policy == FaultPolicy::Retry {
                            remaining.push(item);
                        }
                    }
                    Err(TaskError::Fatal(reason)) => {
                        result.failed += 1;
                        remaining.push(item);
                        result.fatal = Some(reason);
                    }
                }
                result.processed += 1;

                if result.fatal.is_some() {
                    break;
                }
                if !self.keep_lock(&mut renewed_at).await? {
                    result.lock_lost = true;
                    break;
                }
                if let Some(snapshot) = self.budget_exhausted(&budget, start) {
                    result.budget = Some(snapshot);
                    break;
                }
            }
            if result.lock_lost {
                warn!(batch = %key, "lock lost mid-batch, leaving the batch to the new holder");
                break;
            }
            remaining.extend(unprocessed);

            let written = self.queue.update(&key, &remaining).await?;
            result.batches_touched += 1;
            debug!(batch = %key, remaining = remaining.len(), ?written, "batch persisted");
            if written == UpdateResult::Vanished {
                info!(batch = %key, "batch was cancelled mid-pass");
            }

            if result.fatal.is_some() || result.budget.is_some() {
                break;
            }
        }

        Ok(result)
    }

    /// The configured limit, or the hook's override if that still ends the
    /// pass before the lock would expire.
    fn pass_time_limit(&self) -> Duration {
        let limit = self.hooks.time_limit(self.config.time_limit);
        if limit >= self.config.lock_ttl {
            warn!(
                queue = %self.config.identifier,
                requested = ?limit,
                lock_ttl = ?self.config.lock_ttl,
                "time limit override reaches the lock ttl, using the configured limit"
            );
            return self.config.time_limit;
        }
        limit
    }

    /// Renew the lock once half its ttl has passed since the last renewal.
    /// Returns `false` when the lock is no longer ours.
    async fn keep_lock(&self, renewed_at: &mut DateTime<Utc>) -> Result<bool, QueueError> {
        let every = self.config.lock_ttl / 2;
        let due = (Utc::now() - *renewed_at).to_std().is_ok_and(|elapsed| elapsed >= every);
        if !due {
            return Ok(true);
        }
        let now = Utc::now();
        if !self.lock.renew(self.config.lock_ttl).await? {
            return Ok(false);
        }
        *renewed_at = now;
        Ok(true)
    }

    fn budget_exhausted(&self, budget: &BudgetMonitor, start: Instant) -> Option<BudgetSnapshot> {
        let mut snapshot = budget.snapshot(start);
        snapshot.memory_exceeded = self.hooks.memory_exceeded(snapshot.memory_exceeded);
        if !snapshot.time_exceeded && !snapshot.memory_exceeded {
            return None;
        }
        debug!(queue = %self.config.identifier, ?snapshot, "budget exhausted");
        Some(snapshot)
    }

    /// Run the handler, turning a panic into a task failure.
    async fn run_task(&self, item: H::Item) -> Result<Outcome<H::Item>, TaskError> {
        match AssertUnwindSafe(self.handler.process(item)).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => Err(TaskError::Failed(format!("handler panicked: {}", panic_message(&*panic)))),
        }
    }

    /// Health-check callback: restart the queue if it stalled.
    pub async fn handle_health_check(&self) -> Result<HealthCheckOutcome, QueueError> {
        if self.lock.is_held().await? {
            debug!(queue = %self.config.identifier, "health check: worker active");
            return Ok(HealthCheckOutcome::WorkerActive);
        }
        if self.queue.is_empty().await? {
            self.scheduler.unschedule(&self.health_check_hook).await?;
            debug!(queue = %self.config.identifier, "health check: queue empty");
            return Ok(HealthCheckOutcome::QueueEmpty);
        }
        info!(queue = %self.config.identifier, "health check: restarting stalled queue");
        let pass = self.handle_trigger(InvocationContext::HealthCheck).await?;
        Ok(HealthCheckOutcome::Restarted { pass })
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
