use std::sync::Arc;

use sluice_core::Config;
use sluice_queue::{BatchProcessor, NonceGate, Scheduler};

use crate::command_handler::CommandHandler;

pub type SharedProcessor = Arc<BatchProcessor<CommandHandler>>;

/// Shared state for the HTTP handlers and background loops.
pub struct AppState {
    pub config: Config,
    pub processor: SharedProcessor,
    pub scheduler: Arc<dyn Scheduler>,
    /// Verifies the nonce on inbound triggers.
    pub gate: NonceGate,
}
