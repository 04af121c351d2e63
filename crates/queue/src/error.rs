//! Queue error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueueError {
    /// A store read or write failed; the pass must not assume it persisted.
    #[error("store error: {0}")]
    Store(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("dispatch error: {0}")]
    Dispatch(String),

    #[error("authentication error: {0}")]
    Auth(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("migration error: {0}")]
    Migration(String),
}

impl From<sluice_core::ConfigError> for QueueError {
    fn from(e: sluice_core::ConfigError) -> Self {
        Self::Config(e.to_string())
    }
}

/// Failure reported by a task handler for a single item.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TaskError {
    /// The item could not be handled this time; the fault policy decides
    /// whether it stays queued.
    #[error("task failed: {0}")]
    Failed(String),

    /// A resource fault that makes continuing the pass pointless.
    #[error("fatal task error: {0}")]
    Fatal(String),
}
