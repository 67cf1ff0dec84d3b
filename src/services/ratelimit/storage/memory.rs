use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{RateLimitStorage, StorageError};
use crate::services::cache::{SweeperHandle, expires_after};
use crate::services::ratelimit::bucket::TokenBucketState;

#[derive(Debug, Clone)]
struct MemoryEntry {
    state: TokenBucketState,
    expires_at: Instant,
}

type Entries = Arc<Mutex<HashMap<String, MemoryEntry>>>;

/// In-memory storage backend (development / single instance).
#[derive(Debug, Default)]
pub struct InMemoryRateLimitStorage {
    entries: Entries,
    sweeper: Mutex<Option<SweeperHandle>>,
    closed: AtomicBool,
}

impl InMemoryRateLimitStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Periodically drop expired buckets. Replaces a running sweeper.
    pub async fn start_sweeper(&self, period: Duration) {
        let entries = Arc::clone(&self.entries);
        let handle = SweeperHandle::spawn("ratelimit-memory", period, move || {
            let entries = Arc::clone(&entries);
            async move {
                let removed = purge_expired(&entries).await;
                if removed > 0 {
                    tracing::debug!(removed, "cleaned up expired rate limit entries");
                }
            }
        });

        let previous = self.sweeper.lock().await.replace(handle);
        if let Some(previous) = previous {
            previous.shutdown().await;
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    /// Drop expired entries now. Returns how many were removed.
    pub async fn cleanup(&self) -> usize {
        purge_expired(&self.entries).await
    }

    fn ensure_open(&self) -> Result<(), StorageError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StorageError::Closed);
        }
        Ok(())
    }
}

async fn purge_expired(entries: &Entries) -> usize {
    let now = Instant::now();
    let mut entries = entries.lock().await;
    let before = entries.len();
    entries.retain(|_, entry| entry.expires_at > now);
    before - entries.len()
}

#[async_trait]
impl RateLimitStorage for InMemoryRateLimitStorage {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<TokenBucketState>, StorageError> {
        self.ensure_open()?;
        let entries = self.entries.lock().await;
        Ok(entries
            .get(key)
            .filter(|entry| entry.expires_at > Instant::now())
            .map(|entry| entry.state))
    }

    async fn set(
        &self,
        key: &str,
        state: &TokenBucketState,
        ttl: Duration,
    ) -> Result<(), StorageError> {
        self.ensure_open()?;
        let mut entries = self.entries.lock().await;
        entries.insert(
            key.to_string(),
            MemoryEntry {
                state: *state,
                expires_at: expires_after(Instant::now(), ttl),
            },
        );
        Ok(())
    }

    async fn ping(&self) -> Result<(), StorageError> {
        self.ensure_open()
    }

    async fn close(&self) -> Result<(), StorageError> {
        self.closed.store(true, Ordering::Release);
        let sweeper = self.sweeper.lock().await.take();
        if let Some(sweeper) = sweeper {
            sweeper.shutdown().await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(tokens: f64) -> TokenBucketState {
        TokenBucketState {
            capacity: 10.0,
            refill_rate: 1.0,
            tokens,
            last_refill: 0,
        }
    }

    #[tokio::test]
    async fn test_set_then_get() {
        let storage = InMemoryRateLimitStorage::new();
        storage
            .set("k", &state(4.0), Duration::from_secs(60))
            .await
            .unwrap();

        assert_eq!(storage.get("k").await.unwrap(), Some(state(4.0)));
        assert_eq!(storage.get("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_expired_entry_is_invisible() {
        let storage = InMemoryRateLimitStorage::new();
        storage
            .set("k", &state(4.0), Duration::from_millis(10))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(storage.get("k").await.unwrap(), None);
        assert_eq!(storage.cleanup().await, 1);
        assert!(storage.is_empty().await);
    }

    #[tokio::test]
    async fn test_sweeper_removes_expired_entries() {
        let storage = InMemoryRateLimitStorage::new();
        storage.start_sweeper(Duration::from_millis(10)).await;
        storage
            .set("k", &state(1.0), Duration::from_millis(5))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(storage.len().await, 0);

        storage.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_oversized_ttl_does_not_overflow() {
        let storage = InMemoryRateLimitStorage::new();
        storage.set("k", &state(2.0), Duration::MAX).await.unwrap();

        assert_eq!(storage.get("k").await.unwrap(), Some(state(2.0)));
        assert_eq!(storage.cleanup().await, 0);
    }

    #[tokio::test]
    async fn test_close_rejects_further_use() {
        let storage = InMemoryRateLimitStorage::new();
        storage.start_sweeper(Duration::from_secs(60)).await;
        storage.close().await.unwrap();

        assert!(matches!(storage.ping().await, Err(StorageError::Closed)));
        assert!(matches!(storage.get("k").await, Err(StorageError::Closed)));
    }
}
