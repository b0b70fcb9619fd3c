//! A process-local [`Cache`] backed by a concurrent hash map with per-entry TTL.

use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;

use super::{Cache, CacheError};

struct Entry<V> {
    value: V,
    expires_at: Option<Instant>,
}

impl<V> Entry<V> {
    fn is_expired(&self) -> bool {
        self.expires_at.map(|at| Instant::now() >= at).unwrap_or(false)
    }
}

/// In-memory, TTL-aware cache. Safe to share across tasks via `Arc`; internal
/// locking is per-shard (`DashMap`), not a single global mutex.
pub struct InMemoryCache<K, V> {
    entries: Arc<DashMap<K, Entry<V>>>,
}

impl<K, V> InMemoryCache<K, V>
where
    K: Eq + Hash + Send + Sync,
    V: Clone + Send + Sync,
{
    pub fn new() -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
        }
    }
}

impl<K, V> Default for InMemoryCache<K, V>
where
    K: Eq + Hash + Send + Sync,
    V: Clone + Send + Sync,
{
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<K, V> Cache<K, V> for InMemoryCache<K, V>
where
    K: Eq + Hash + Send + Sync,
    V: Clone + Send + Sync,
{
    async fn get(&self, key: &K) -> Option<V> {
        let hit = match self.entries.get(key) {
            Some(entry) if !entry.is_expired() => return Some(entry.value.clone()),
            Some(_) => true,
            None => false,
        };
        if hit {
            self.entries.remove(key);
        }
        None
    }

    async fn set(&self, key: K, value: V, ttl: Option<Duration>) -> Result<(), CacheError> {
        let expires_at = ttl.map(|d| Instant::now() + d);
        self.entries.insert(key, Entry { value, expires_at });
        Ok(())
    }

    async fn delete(&self, key: &K) -> Result<(), CacheError> {
        self.entries.remove(key);
        Ok(())
    }

    async fn clear(&self) -> Result<(), CacheError> {
        self.entries.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn get_returns_none_after_ttl_expires() {
        let cache: InMemoryCache<String, i32> = InMemoryCache::new();
        cache
            .set("k".to_string(), 1, Some(Duration::from_millis(5)))
            .await
            .unwrap();
        assert_eq!(cache.get(&"k".to_string()).await, Some(1));
        tokio::time::sleep(Duration::from_millis(15)).await;
        assert_eq!(cache.get(&"k".to_string()).await, None);
    }

    #[tokio::test]
    async fn no_ttl_never_expires() {
        let cache: InMemoryCache<String, i32> = InMemoryCache::new();
        cache.set("k".to_string(), 1, None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(cache.get(&"k".to_string()).await, Some(1));
    }

    #[tokio::test]
    async fn clear_removes_everything() {
        let cache: InMemoryCache<String, i32> = InMemoryCache::new();
        cache.set("a".to_string(), 1, None).await.unwrap();
        cache.set("b".to_string(), 2, None).await.unwrap();
        cache.clear().await.unwrap();
        assert_eq!(cache.get(&"a".to_string()).await, None);
        assert_eq!(cache.get(&"b".to_string()).await, None);
    }
}
