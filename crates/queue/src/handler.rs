//! The capability callers supply to process queued items.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::TaskError;

/// Result of handling one item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<T> {
    /// Keep the (possibly transformed) item queued; it is handled again on
    /// the next loop over its batch.
    Requeue(T),
    /// The item is done and leaves the queue.
    Remove,
}

/// User-supplied task logic.
///
/// Items may be handled more than once (a pass can be cut short after the
/// handler ran but before progress was persisted), so `process` should be
/// idempotent.
#[async_trait]
pub trait TaskHandler: Send + Sync + 'static {
    type Item: Serialize + DeserializeOwned + Clone + Send + Sync + 'static;

    async fn process(&self, item: Self::Item) -> Result<Outcome<Self::Item>, TaskError>;

    /// Called once the queue has been fully drained.
    async fn on_complete(&self) {}
}
