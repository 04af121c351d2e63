use std::sync::Arc;

use tracing::warn;

use sluice_core::PostgresConfig;
use sluice_queue::{MemoryStore, PgStore, QueueStore};

/// Open the queue store: PostgreSQL (with migrations) when configured,
/// otherwise an in-memory store that lives as long as this process.
pub async fn open_store(config: &PostgresConfig) -> anyhow::Result<Arc<dyn QueueStore>> {
    if !config.is_configured() {
        warn!("PG_URL / PG_HOST not configured, using in-memory store (queued work will not survive a restart)");
        return Ok(Arc::new(MemoryStore::new()));
    }
    Ok(Arc::new(PgStore::connect(config).await?))
}
