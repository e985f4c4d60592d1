//! Time-bounded response cache layered on the durable store.

use chrono::Duration;
use rusqlite::{params, OptionalExtension};
use tracing::debug;

use offsync_common::{Error, Result};

use crate::database::LocalStore;

/// Keyed JSON values with a time-to-live.
///
/// Expiry is lazy: `get` treats a stale row as a miss but leaves it in place
/// until `clear_expired` runs.
#[derive(Debug, Clone)]
pub struct ResponseCache {
    store: LocalStore,
}

impl ResponseCache {
    pub fn new(store: LocalStore) -> Self {
        Self { store }
    }

    /// Store `value` for `ttl_minutes` whole minutes, replacing any previous entry.
    pub async fn put(&self, key: &str, value: &serde_json::Value, ttl_minutes: u32) -> Result<()> {
        self.put_for(key, value, Duration::minutes(i64::from(ttl_minutes)))
            .await
    }

    /// Store `value` with an arbitrary time-to-live.
    pub async fn put_for(&self, key: &str, value: &serde_json::Value, ttl: Duration) -> Result<()> {
        if key.is_empty() {
            return Err(Error::InvalidInput("Cache key cannot be empty".to_string()));
        }

        let now = self.store.clock().now_millis();
        let expires_at = now.saturating_add(ttl.num_milliseconds());
        let key = key.to_string();
        let value = serde_json::to_string(value)?;

        debug!("Caching {} for {}s", key, ttl.num_seconds());
        self.store
            .call(move |conn| {
                conn.execute(
                    r#"
                    INSERT OR REPLACE INTO cache (key, value, expires_at, created_at)
                    VALUES (?1, ?2, ?3, ?4)
                    "#,
                    params![key, value, expires_at, now],
                )
            })
            .await?;
        Ok(())
    }

    /// The cached value, or `None` if absent or expired.
    pub async fn get(&self, key: &str) -> Result<Option<serde_json::Value>> {
        let now = self.store.clock().now_millis();
        let key = key.to_string();

        let raw: Option<String> = self
            .store
            .call(move |conn| {
                conn.query_row(
                    "SELECT value FROM cache WHERE key = ?1 AND expires_at > ?2",
                    params![key, now],
                    |row| row.get(0),
                )
                .optional()
            })
            .await?;

        raw.map(|s| serde_json::from_str(&s).map_err(Error::from))
            .transpose()
    }

    /// Drop one entry regardless of expiry. Returns whether it existed.
    pub async fn invalidate(&self, key: &str) -> Result<bool> {
        let key = key.to_string();
        let removed = self
            .store
            .call(move |conn| conn.execute("DELETE FROM cache WHERE key = ?1", [&key]))
            .await?;
        Ok(removed > 0)
    }

    /// Delete every expired entry. Returns the number of rows removed.
    pub async fn clear_expired(&self) -> Result<usize> {
        let now = self.store.clock().now_millis();
        let removed = self
            .store
            .call(move |conn| conn.execute("DELETE FROM cache WHERE expires_at <= ?1", [now]))
            .await?;

        if removed > 0 {
            debug!("Cleared {} expired cache entries", removed);
        }
        Ok(removed)
    }

    /// Number of rows in the cache, expired ones included.
    pub async fn len(&self) -> Result<u64> {
        let count: i64 = self
            .store
            .call(|conn| conn.query_row("SELECT COUNT(*) FROM cache", [], |row| row.get(0)))
            .await?;
        Ok(count as u64)
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use serde_json::json;
    use std::sync::Arc;

    async fn cache_with_clock() -> (ResponseCache, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        let store = LocalStore::in_memory(clock.clone()).await.unwrap();
        (ResponseCache::new(store), clock)
    }

    #[tokio::test]
    async fn test_put_then_get() {
        let (cache, _clock) = cache_with_clock().await;

        cache.put("payroll:2024-05", &json!({"total": 42}), 1).await.unwrap();
        assert_eq!(
            cache.get("payroll:2024-05").await.unwrap(),
            Some(json!({"total": 42}))
        );
        assert!(cache.get("other").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_expired_entry_is_miss_but_kept() {
        let (cache, clock) = cache_with_clock().await;

        cache.put("k", &json!("v"), 1).await.unwrap();
        clock.advance(Duration::seconds(59));
        assert_eq!(cache.get("k").await.unwrap(), Some(json!("v")));

        clock.advance(Duration::seconds(1));
        assert!(cache.get("k").await.unwrap().is_none());
        // Lazy expiry: the row is still there.
        assert_eq!(cache.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_put_overwrites() {
        let (cache, clock) = cache_with_clock().await;

        cache.put("k", &json!(1), 1).await.unwrap();
        clock.advance(Duration::seconds(50));
        cache.put("k", &json!(2), 1).await.unwrap();
        clock.advance(Duration::seconds(50));

        assert_eq!(cache.get("k").await.unwrap(), Some(json!(2)));
        assert_eq!(cache.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_clear_expired_keeps_fresh() {
        let (cache, clock) = cache_with_clock().await;

        cache.put("short", &json!(1), 1).await.unwrap();
        cache.put("long", &json!(2), 10).await.unwrap();
        clock.advance(Duration::minutes(2));

        assert_eq!(cache.clear_expired().await.unwrap(), 1);
        assert_eq!(cache.len().await.unwrap(), 1);
        assert_eq!(cache.get("long").await.unwrap(), Some(json!(2)));
        assert_eq!(cache.clear_expired().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_zero_ttl_is_immediately_stale() {
        let (cache, _clock) = cache_with_clock().await;
        cache.put("k", &json!(1), 0).await.unwrap();
        assert!(cache.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_invalidate() {
        let (cache, _clock) = cache_with_clock().await;

        cache.put("ids", &json!([1, 2, 3]), 5).await.unwrap();
        assert_eq!(cache.get("ids").await.unwrap(), Some(json!([1, 2, 3])));

        assert!(cache.invalidate("ids").await.unwrap());
        assert!(!cache.invalidate("ids").await.unwrap());
        assert!(cache.is_empty().await.unwrap());
    }
}
