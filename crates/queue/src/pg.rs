//! PostgreSQL store backed by a single key-value table.

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::info;

use sluice_core::PostgresConfig;

use crate::error::QueueError;
use crate::store::{QueueStore, StoreEntry};

fn store_err(e: sqlx::Error) -> QueueError {
    match e {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            QueueError::Connection(e.to_string())
        }
        other => QueueError::Store(other.to_string()),
    }
}

/// Escape `LIKE` wildcards so a prefix matches literally.
fn like_prefix(prefix: &str) -> String {
    let mut escaped = String::with_capacity(prefix.len() + 1);
    for c in prefix.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped.push('%');
    escaped
}

/// `sluice_options`-backed store. Row identity (`id BIGSERIAL`) gives the
/// creation order used by prefix scans.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connect using project config and apply migrations.
    pub async fn connect(config: &PostgresConfig) -> Result<Self, QueueError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.connection_string())
            .await
            .map_err(|e| QueueError::Connection(format!("PostgreSQL connect failed: {e}")))?;

        sqlx::migrate!("../../migrations")
            .run(&pool)
            .await
            .map_err(|e| QueueError::Migration(e.to_string()))?;

        info!(host = %config.host, database = %config.database, "PostgreSQL queue store ready");
        Ok(Self { pool })
    }

    /// Wrap an existing pool (migrations are the caller's responsibility).
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl QueueStore for PgStore {
    async fn scan(&self, prefix: &str, limit: Option<usize>) -> Result<Vec<StoreEntry>, QueueError> {
        let limit = limit.map(|n| n as i64).unwrap_or(i64::MAX);
        let rows = sqlx::query_as::<_, (String, String)>(
            "SELECT key, value FROM sluice_options
             WHERE key LIKE $1 ESCAPE '\\'
             ORDER BY id ASC
             LIMIT $2",
        )
        .bind(like_prefix(prefix))
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;

        Ok(rows
            .into_iter()
            .map(|(key, value)| StoreEntry { key, value })
            .collect())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, QueueError> {
        sqlx::query_scalar::<_, String>("SELECT value FROM sluice_options WHERE key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err)
    }

    async fn put(&self, key: &str, value: &str) -> Result<(), QueueError> {
        sqlx::query(
            "INSERT INTO sluice_options (key, value) VALUES ($1, $2)
             ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn update_existing(&self, key: &str, value: &str) -> Result<bool, QueueError> {
        let result = sqlx::query("UPDATE sluice_options SET value = $2 WHERE key = $1")
            .bind(key)
            .bind(value)
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(result.rows_affected() == 1)
    }

    async fn insert_if_absent(&self, key: &str, value: &str) -> Result<bool, QueueError> {
        let result = sqlx::query(
            "INSERT INTO sluice_options (key, value) VALUES ($1, $2)
             ON CONFLICT (key) DO NOTHING",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(result.rows_affected() == 1)
    }

    async fn compare_and_swap(&self, key: &str, expected: &str, new: &str) -> Result<bool, QueueError> {
        let result = sqlx::query(
            "UPDATE sluice_options SET value = $3 WHERE key = $1 AND value = $2",
        )
        .bind(key)
        .bind(expected)
        .bind(new)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(result.rows_affected() == 1)
    }

    async fn delete(&self, key: &str) -> Result<bool, QueueError> {
        let result = sqlx::query("DELETE FROM sluice_options WHERE key = $1")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, QueueError> {
        let result = sqlx::query("DELETE FROM sluice_options WHERE key = $1 AND value = $2")
            .bind(key)
            .bind(expected)
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(result.rows_affected() == 1)
    }

    async fn count(&self, prefix: &str) -> Result<u64, QueueError> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM sluice_options WHERE key LIKE $1 ESCAPE '\\'",
        )
        .bind(like_prefix(prefix))
        .fetch_one(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(count.max(0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn like_prefix_escapes_wildcards() {
        assert_eq!(like_prefix("sluice_batch_"), "sluice\\_batch\\_%");
        assert_eq!(like_prefix("100%"), "100\\%%");
        assert_eq!(like_prefix("a\\b"), "a\\\\b%");
    }
}
