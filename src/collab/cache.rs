use std::time::{Duration, Instant};

use async_trait::async_trait;
use moka::future::Cache;
use moka::Expiry;

use super::PredictionCache;
use crate::error::CollabError;
use crate::types::RestockPrediction;

const MEMORY_CACHE_CAPACITY: u64 = 10_000;

#[derive(Clone)]
struct Entry {
    prediction: RestockPrediction,
    ttl: Duration,
}

/// Each entry lives for the TTL it was written with. Overwrites restart it.
struct EntryTtl;

impl Expiry<String, Entry> for EntryTtl {
    fn expire_after_create(&self, _key: &String, value: &Entry, _created_at: Instant) -> Option<Duration> {
        Some(value.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &Entry,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

/// In-process prediction cache with per-entry expiry.
pub struct MemoryCache {
    entries: Cache<String, Entry>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self {
            entries: Cache::builder()
                .max_capacity(MEMORY_CACHE_CAPACITY)
                .expire_after(EntryTtl)
                .build(),
        }
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PredictionCache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<RestockPrediction>, CollabError> {
        Ok(self.entries.get(key).await.map(|e| e.prediction))
    }

    async fn set(
        &self,
        key: &str,
        value: &RestockPrediction,
        ttl: Duration,
    ) -> Result<(), CollabError> {
        self.entries
            .insert(
                key.to_string(),
                Entry {
                    prediction: value.clone(),
                    ttl,
                },
            )
            .await;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CollabError> {
        self.entries.invalidate(key).await;
        Ok(())
    }
}

/// No backend configured: every lookup misses, so predictions are always
/// recomputed.
#[derive(Debug, Default, Clone)]
pub struct NoCache;

#[async_trait]
impl PredictionCache for NoCache {
    async fn get(&self, _key: &str) -> Result<Option<RestockPrediction>, CollabError> {
        Ok(None)
    }

    async fn set(
        &self,
        _key: &str,
        _value: &RestockPrediction,
        _ttl: Duration,
    ) -> Result<(), CollabError> {
        Ok(())
    }

    async fn delete(&self, _key: &str) -> Result<(), CollabError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prediction(sku: &str) -> RestockPrediction {
        RestockPrediction {
            sku: sku.into(),
            probability: 0.4,
            next_check: 100,
            priority: 40,
            last_check: 0,
            profit_margin: 25.0,
            sales_velocity: 1.0,
            check_count: 0,
        }
    }

    #[tokio::test]
    async fn entries_expire() {
        let cache = MemoryCache::new();
        cache
            .set("prediction:A", &prediction("A"), Duration::from_millis(20))
            .await
            .unwrap();
        cache
            .set("prediction:B", &prediction("B"), Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(
            cache.get("prediction:A").await.unwrap(),
            Some(prediction("A"))
        );
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(cache.get("prediction:A").await.unwrap(), None);
        assert_eq!(
            cache.get("prediction:B").await.unwrap(),
            Some(prediction("B"))
        );
    }

    #[tokio::test]
    async fn overwrite_takes_the_new_ttl() {
        let cache = MemoryCache::new();
        cache
            .set("k", &prediction("A"), Duration::from_millis(20))
            .await
            .unwrap();
        cache
            .set("k", &prediction("A"), Duration::from_secs(60))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(cache.get("k").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn delete_removes_entry() {
        let cache = MemoryCache::new();
        cache
            .set("k", &prediction("B"), Duration::from_secs(60))
            .await
            .unwrap();
        cache.delete("k").await.unwrap();
        assert!(cache.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn no_cache_always_misses() {
        let cache = NoCache;
        cache
            .set("k", &prediction("C"), Duration::from_secs(60))
            .await
            .unwrap();
        assert!(cache.get("k").await.unwrap().is_none());
    }
}
