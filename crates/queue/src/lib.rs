//! Durable, self-healing batch queue.
//!
//! Items are buffered with [`BatchProcessor::push_to_queue`], persisted as a
//! batch by [`BatchProcessor::save`], and drained by passes that each hold a
//! store-backed lock for a bounded amount of time and memory. A pass that runs
//! out of budget dispatches its own continuation; a recurring health check
//! restarts the queue if that chain ever breaks.

pub mod auth;
pub mod batch;
pub mod budget;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod handler;
pub mod hooks;
pub mod lock;
pub mod pg;
pub mod processor;
pub mod schedule;
pub mod store;

pub use auth::NonceGate;
pub use batch::{Batch, BatchQueue, UpdateResult};
pub use budget::{BudgetMonitor, BudgetSnapshot, InvocationContext, MemoryProbe, ProcessMemory};
pub use config::ProcessorConfig;
pub use dispatch::{ChannelDispatcher, Dispatcher, HttpDispatcher};
pub use error::{QueueError, TaskError};
pub use handler::{Outcome, TaskHandler};
pub use hooks::Hooks;
pub use lock::{LockRecord, ProcessLock};
pub use pg::PgStore;
pub use processor::{
    BatchProcessor, BatchProcessorBuilder, HealthCheckOutcome, PassOutcome, PassReport, ProcessorState,
    QueueStatus, SkipReason,
};
pub use schedule::{ScheduleEntry, Scheduler, StoreScheduler};
pub use store::{MemoryStore, QueueStore, StoreEntry};
