//! In-process TTL cache.
//!
//! Entries expire by wall-clock comparison on read (lazy) and are additionally purged by
//! an optional sweeper. Nothing invalidates an entry explicitly.

use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::services::cache::sweeper::SweeperHandle;

/// Longest lifetime any cache entry or stored bucket gets.
pub const MAX_TTL: Duration = Duration::from_secs(10 * 365 * 24 * 60 * 60);

/// `now + ttl`, clamped to [`MAX_TTL`] so oversized durations never overflow.
pub fn expires_after(now: Instant, ttl: Duration) -> Instant {
    now.checked_add(ttl.min(MAX_TTL)).unwrap_or(now)
}

#[derive(Debug, Clone)]
struct Entry<V> {
    value: V,
    expires_at: Instant,
}

/// Concurrent map whose entries live for a fixed TTL.
///
/// A zero TTL disables caching: `insert` is a no-op and `get` always misses.
#[derive(Debug)]
pub struct TtlCache<K, V>
where
    K: Eq + Hash,
{
    entries: DashMap<K, Entry<V>>,
    ttl: Duration,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn is_enabled(&self) -> bool {
        !self.ttl.is_zero()
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let now = Instant::now();

        // Copy out before touching the map again; holding a shard guard while removing deadlocks.
        let hit = self
            .entries
            .get(key)
            .map(|entry| (entry.value.clone(), entry.expires_at))?;

        if hit.1 > now {
            return Some(hit.0);
        }

        self.entries.remove_if(key, |_, entry| entry.expires_at <= now);
        None
    }

    pub fn insert(&self, key: K, value: V) {
        if !self.is_enabled() {
            return;
        }
        self.entries.insert(
            key,
            Entry {
                value,
                expires_at: expires_after(Instant::now(), self.ttl),
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at > now);
        before.saturating_sub(self.entries.len())
    }

    /// Start a periodic purge for this cache.
    pub fn start_sweeper(self: &Arc<Self>, name: &'static str, period: Duration) -> SweeperHandle {
        let cache = Arc::clone(self);
        SweeperHandle::spawn(name, period, move || {
            let cache = Arc::clone(&cache);
            async move {
                let removed = cache.purge_expired();
                if removed > 0 {
                    tracing::debug!(cache = name, removed, "purged expired entries");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_returns_fresh_entry() {
        let cache: TtlCache<String, bool> = TtlCache::new(Duration::from_secs(60));
        cache.insert("sess-1".into(), true);

        assert_eq!(cache.get(&"sess-1".to_string()), Some(true));
        assert_eq!(cache.get(&"sess-2".to_string()), None);
    }

    #[tokio::test]
    async fn test_entry_expires_lazily() {
        let cache: TtlCache<String, u32> = TtlCache::new(Duration::from_millis(20));
        cache.insert("k".into(), 7);
        assert_eq!(cache.len(), 1);

        tokio::time::sleep(Duration::from_millis(40)).await;

        assert_eq!(cache.get(&"k".to_string()), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_zero_ttl_disables_cache() {
        let cache: TtlCache<String, u32> = TtlCache::new(Duration::ZERO);
        cache.insert("k".into(), 1);

        assert!(!cache.is_enabled());
        assert!(cache.is_empty());
        assert_eq!(cache.get(&"k".to_string()), None);
    }

    #[test]
    fn test_huge_ttl_is_clamped() {
        let now = Instant::now();
        assert_eq!(expires_after(now, Duration::MAX), now + MAX_TTL);
        assert_eq!(expires_after(now, Duration::from_secs(5)), now + Duration::from_secs(5));

        let cache: TtlCache<String, u32> = TtlCache::new(Duration::MAX);
        cache.insert("k".into(), 1);
        assert_eq!(cache.get(&"k".to_string()), Some(1));
    }

    #[tokio::test]
    async fn test_sweeper_purges_expired_entries() {
        let cache: Arc<TtlCache<String, u32>> = Arc::new(TtlCache::new(Duration::from_millis(10)));
        cache.insert("a".into(), 1);
        cache.insert("b".into(), 2);

        let sweeper = cache.start_sweeper("test-cache", Duration::from_millis(15));
        tokio::time::sleep(Duration::from_millis(60)).await;
        sweeper.shutdown().await;

        assert!(cache.is_empty());
    }
}
