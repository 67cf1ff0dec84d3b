use std::time::Duration;

use async_trait::async_trait;

use super::{RateLimitStorage, StorageError};
use crate::services::cache::CacheClient;
use crate::services::ratelimit::bucket::TokenBucketState;

/// Redis/Valkey backend. State is stored as JSON under the bucket key with `SET EX`.
#[derive(Debug, Clone)]
pub struct RedisRateLimitStorage<C: CacheClient> {
    cache: C,
}

impl<C: CacheClient> RedisRateLimitStorage<C> {
    pub fn new(cache: C) -> Self {
        Self { cache }
    }
}

#[async_trait]
impl<C: CacheClient> RateLimitStorage for RedisRateLimitStorage<C> {
    fn backend_name(&self) -> &'static str {
        self.cache.backend_name()
    }

    async fn get(&self, key: &str) -> Result<Option<TokenBucketState>, StorageError> {
        let Some(json) = self.cache.get_string(key).await? else {
            return Ok(None);
        };
        serde_json::from_str(&json)
            .map(Some)
            .map_err(|e| StorageError::Serialization(e.to_string()))
    }

    async fn set(
        &self,
        key: &str,
        state: &TokenBucketState,
        ttl: Duration,
    ) -> Result<(), StorageError> {
        let json =
            serde_json::to_string(state).map_err(|e| StorageError::Serialization(e.to_string()))?;
        self.cache.set_with_ttl(key, &json, ttl).await?;
        Ok(())
    }

    async fn ping(&self) -> Result<(), StorageError> {
        self.cache.ping().await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), StorageError> {
        // ConnectionManager closes when the last clone drops.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::cache::{CacheError, CacheResult};
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct FakeCache {
        values: Arc<Mutex<HashMap<String, (String, Duration)>>>,
    }

    #[async_trait]
    impl CacheClient for FakeCache {
        fn backend_name(&self) -> &'static str {
            "fake"
        }

        async fn get_string(&self, key: &str) -> CacheResult<Option<String>> {
            Ok(self.values.lock().unwrap().get(key).map(|(v, _)| v.clone()))
        }

        async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> CacheResult<()> {
            self.values
                .lock()
                .unwrap()
                .insert(key.to_string(), (value.to_string(), ttl));
            Ok(())
        }

        async fn exists(&self, key: &str) -> CacheResult<bool> {
            Ok(self.values.lock().unwrap().contains_key(key))
        }

        async fn ping(&self) -> CacheResult<()> {
            Err(CacheError::BackendConnection("refused".into()))
        }
    }

    #[tokio::test]
    async fn test_state_is_stored_as_json_with_ttl() {
        let cache = FakeCache::default();
        let storage = RedisRateLimitStorage::new(cache.clone());
        let state = TokenBucketState {
            capacity: 5.0,
            refill_rate: 0.5,
            tokens: 2.5,
            last_refill: 42,
        };

        storage
            .set("rl:k", &state, Duration::from_secs(120))
            .await
            .unwrap();

        let (raw, ttl) = cache.values.lock().unwrap().get("rl:k").cloned().unwrap();
        assert_eq!(ttl, Duration::from_secs(120));
        assert!(raw.contains("\"tokens\":2.5"));
        assert_eq!(storage.get("rl:k").await.unwrap(), Some(state));
    }

    #[tokio::test]
    async fn test_corrupt_state_is_a_serialization_error() {
        let cache = FakeCache::default();
        cache
            .set_with_ttl("rl:k", "not json", Duration::from_secs(1))
            .await
            .unwrap();
        let storage = RedisRateLimitStorage::new(cache);

        assert!(matches!(
            storage.get("rl:k").await,
            Err(StorageError::Serialization(_))
        ));
    }

    #[tokio::test]
    async fn test_ping_failure_maps_to_backend_error() {
        let storage = RedisRateLimitStorage::new(FakeCache::default());
        assert!(matches!(storage.ping().await, Err(StorageError::Backend(_))));
    }
}
