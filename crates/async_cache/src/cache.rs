use std::{
    future::Future,
    hash::Hash,
    num::NonZeroUsize,
    time::Duration,
};

use lru::LruCache;
use tokio::{
    sync::Mutex,
    time::Instant,
};

struct Entry<V> {
    value: V,
    created_at: Instant,
}

/// An LRU cache with optional per-entry TTL.
///
/// Every operation serializes on one async mutex, so `get_or_create` is a
/// single atomic check-and-insert: the factory runs at most once per miss
/// and concurrent callers observe the stored value. Reads refresh recency;
/// expired entries are removed lazily on read and in bulk by
/// `cleanup_expired`.
pub struct TtlLruCache<K: Hash + Eq, V: Clone> {
    inner: Mutex<LruCache<K, Entry<V>>>,
    max_size: NonZeroUsize,
    ttl: Option<Duration>,
}

impl<K: Hash + Eq + Clone, V: Clone> TtlLruCache<K, V> {
    pub fn new(max_size: NonZeroUsize, ttl: Option<Duration>) -> Self {
        Self {
            inner: Mutex::new(LruCache::new(max_size)),
            max_size,
            ttl,
        }
    }

    fn is_expired(&self, entry: &Entry<V>) -> bool {
        match self.ttl {
            Some(ttl) => entry.created_at.elapsed() > ttl,
            None => false,
        }
    }

    pub async fn get(&self, key: &K) -> Option<V> {
        let mut cache = self.inner.lock().await;
        let expired = match cache.get(key) {
            None => return None,
            Some(entry) => self.is_expired(entry),
        };
        if expired {
            cache.pop(key);
            return None;
        }
        cache.get(key).map(|entry| entry.value.clone())
    }

    /// Insert or replace. The LRU bound evicts the least-recently-used entry
    /// when the cache is already full.
    pub async fn set(&self, key: K, value: V) {
        let mut cache = self.inner.lock().await;
        cache.put(
            key,
            Entry {
                value,
                created_at: Instant::now(),
            },
        );
    }

    pub async fn delete(&self, key: &K) -> bool {
        self.inner.lock().await.pop(key).is_some()
    }

    pub async fn clear(&self) {
        self.inner.lock().await.clear();
    }

    /// Return the live value for `key`, running `factory` to create it on a
    /// miss. The whole operation holds the cache mutex, so the factory runs
    /// at most once per miss.
    pub async fn get_or_create<F, Fut>(&self, key: K, factory: F) -> V
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = V>,
    {
        let mut cache = self.inner.lock().await;
        if let Some(entry) = cache.get(&key) {
            if !self.is_expired(entry) {
                return entry.value.clone();
            }
            cache.pop(&key);
        }
        let value = factory().await;
        cache.put(
            key,
            Entry {
                value: value.clone(),
                created_at: Instant::now(),
            },
        );
        value
    }

    /// Drop every expired entry, returning how many were removed.
    pub async fn cleanup_expired(&self) -> usize {
        let Some(ttl) = self.ttl else {
            return 0;
        };
        let mut cache = self.inner.lock().await;
        let expired: Vec<K> = cache
            .iter()
            .filter(|(_, entry)| entry.created_at.elapsed() > ttl)
            .map(|(key, _)| key.clone())
            .collect();
        let removed = expired.len();
        for key in expired {
            cache.pop(&key);
        }
        removed
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.is_empty()
    }

    pub fn max_size(&self) -> usize {
        self.max_size.get()
    }

    /// Fraction of capacity in use, for sweep scheduling.
    pub async fn utilization(&self) -> f64 {
        self.inner.lock().await.len() as f64 / self.max_size.get() as f64
    }
}

#[cfg(test)]
mod tests {
    use std::{
        num::NonZeroUsize,
        sync::{
            atomic::{
                AtomicUsize,
                Ordering,
            },
            Arc,
        },
        time::Duration,
    };

    use super::TtlLruCache;

    fn cache_of(size: usize, ttl: Option<Duration>) -> TtlLruCache<String, u64> {
        TtlLruCache::new(NonZeroUsize::new(size).unwrap(), ttl)
    }

    #[tokio::test]
    async fn test_get_set_delete() {
        let cache = cache_of(4, None);
        assert_eq!(cache.get(&"a".to_string()).await, None);
        cache.set("a".to_string(), 1).await;
        assert_eq!(cache.get(&"a".to_string()).await, Some(1));
        assert!(cache.delete(&"a".to_string()).await);
        assert!(!cache.delete(&"a".to_string()).await);
    }

    #[tokio::test]
    async fn test_capacity_evicts_exactly_one_lru_entry() {
        let cache = cache_of(3, None);
        for (k, v) in [("a", 1), ("b", 2), ("c", 3)] {
            cache.set(k.to_string(), v).await;
        }
        // Touch "a" so "b" is the least recently used.
        assert_eq!(cache.get(&"a".to_string()).await, Some(1));
        cache.set("d".to_string(), 4).await;
        assert_eq!(cache.len().await, 3);
        assert_eq!(cache.get(&"b".to_string()).await, None);
        assert_eq!(cache.get(&"a".to_string()).await, Some(1));
        assert_eq!(cache.get(&"c".to_string()).await, Some(3));
        assert_eq!(cache.get(&"d".to_string()).await, Some(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expires_on_read() {
        let cache = cache_of(4, Some(Duration::from_secs(10)));
        cache.set("a".to_string(), 1).await;
        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(cache.get(&"a".to_string()).await, None);
        assert_eq!(cache.len().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_expired_counts_removals() {
        let cache = cache_of(8, Some(Duration::from_secs(10)));
        cache.set("old1".to_string(), 1).await;
        cache.set("old2".to_string(), 2).await;
        tokio::time::advance(Duration::from_secs(6)).await;
        cache.set("new".to_string(), 3).await;
        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(cache.cleanup_expired().await, 2);
        assert_eq!(cache.get(&"new".to_string()).await, Some(3));
    }

    #[tokio::test]
    async fn test_get_or_create_runs_factory_once() {
        let cache = Arc::new(cache_of(4, None));
        let calls = Arc::new(AtomicUsize::new(0));
        let mut handles = vec![];
        for _ in 0..8 {
            let cache = cache.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_create("key".to_string(), || async {
                        calls.fetch_add(1, Ordering::SeqCst);
                        42
                    })
                    .await
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap(), 42);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_utilization() {
        let cache = cache_of(4, None);
        cache.set("a".to_string(), 1).await;
        cache.set("b".to_string(), 2).await;
        assert!((cache.utilization().await - 0.5).abs() < f64::EPSILON);
    }
}
