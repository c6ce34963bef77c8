//! Last-value cache backends.

use crate::errors::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use sqlx::PgPool;

const LAST_READING_PREFIX: &str = "lastReading-";

/// Cache key holding a device's most recent reading.
pub fn last_reading_key(device_id: &str) -> String {
    format!("{}{}", LAST_READING_PREFIX, device_id)
}

/// Key-value store for the most recent reading per device. No eviction.
#[async_trait]
pub trait LastValueCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: String) -> Result<()>;
}

/// Process-local cache. Contents are lost on restart, after which the
/// store fallback takes over.
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: DashMap<String, String>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LastValueCache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.get(key).map(|entry| entry.value().clone()))
    }

    async fn set(&self, key: &str, value: String) -> Result<()> {
        self.entries.insert(key.to_string(), value);
        Ok(())
    }
}

/// Cache kept in the `last_values` table so it survives restarts.
#[derive(Debug, Clone)]
pub struct PgCache {
    pool: PgPool,
}

impl PgCache {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LastValueCache for PgCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let value = sqlx::query_scalar::<_, String>("SELECT value FROM last_values WHERE key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        Ok(value)
    }

    async fn set(&self, key: &str, value: String) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO last_values (key, value, updated_at)
            VALUES ($1, $2, now())
            ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value, updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_last_reading_key() {
        assert_eq!(last_reading_key("0004a30b0019bc1a"), "lastReading-0004a30b0019bc1a");
    }

    #[tokio::test]
    async fn test_memory_cache_get_set() {
        let cache = MemoryCache::new();
        let key = last_reading_key("dev-1");

        assert_eq!(cache.get(&key).await.unwrap(), None);

        cache.set(&key, "100".to_string()).await.unwrap();
        assert_eq!(cache.get(&key).await.unwrap().as_deref(), Some("100"));

        cache.set(&key, "80".to_string()).await.unwrap();
        assert_eq!(cache.get(&key).await.unwrap().as_deref(), Some("80"));
        assert_eq!(cache.get(&last_reading_key("dev-2")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_pg_cache_roundtrip() {
        // Requires a running Postgres with migrations applied
        let Ok(url) = std::env::var("DATABASE_URL") else {
            return;
        };

        let pool = crate::store::make_pool(&url).await.unwrap();
        let cache = PgCache::new(pool);
        let key = last_reading_key("cache-test-dev");

        cache.set(&key, "42".to_string()).await.unwrap();
        assert_eq!(cache.get(&key).await.unwrap().as_deref(), Some("42"));
    }
}
