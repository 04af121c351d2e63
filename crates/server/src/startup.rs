//! Wiring: store, trigger gate, dispatcher, scheduler and processor.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use sluice_core::Config;
use sluice_queue::{
    BatchProcessor, Dispatcher, Hooks, HttpDispatcher, NonceGate, ProcessorConfig, Scheduler, StoreScheduler,
};

use crate::command_handler::CommandHandler;
use crate::db;
use crate::state::AppState;

/// Build `AppState` from config. `hooks` lets a subcommand shape the passes
/// it runs (e.g. `drain` suppresses HTTP continuations).
pub async fn build_app_state(config: &Config, hooks: Hooks) -> anyhow::Result<Arc<AppState>> {
    let store = db::open_store(&config.postgres).await?;

    let gate = match &config.queue.trigger_secret {
        Some(secret) => NonceGate::new(secret.clone()),
        None => {
            warn!("QUEUE_TRIGGER_SECRET not set, triggers are only accepted from this process");
            NonceGate::ephemeral()
        }
    };

    let dispatcher: Arc<dyn Dispatcher> = Arc::new(HttpDispatcher::new(
        config.server.public_url.clone(),
        gate.clone(),
        Duration::from_millis(config.queue.dispatch_timeout_ms),
    )?);
    let scheduler: Arc<dyn Scheduler> = Arc::new(StoreScheduler::new(store.clone()));

    let handler = Arc::new(CommandHandler::new(config.queue.handler_command.clone()));
    if !handler.is_configured() {
        warn!("QUEUE_HANDLER_COMMAND not set, passes will stop at the first item");
    }

    let processor = BatchProcessor::builder(handler, store, dispatcher)
        .config(ProcessorConfig::from(&config.queue))
        .scheduler(scheduler.clone())
        .hooks(hooks)
        .build()?;
    info!(queue = %processor.identifier(), "batch processor ready");

    Ok(Arc::new(AppState {
        config: config.clone(),
        processor: Arc::new(processor),
        scheduler,
        gate,
    }))
}
