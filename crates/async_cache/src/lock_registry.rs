use std::{
    collections::HashMap,
    sync::Arc,
};

use tokio::sync::{
    Mutex,
    OwnedMutexGuard,
};

/// Named async locks, created on first use.
///
/// Creation happens under the registry's own mutex, so two callers racing on
/// the same name always end up sharing one lock. Guards are owned, so they
/// can be held across awaits and moved into spawned work.
pub struct LockRegistry {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl LockRegistry {
    pub fn new() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub async fn acquire(&self, name: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    /// Remove locks that are neither held nor referenced, returning how many
    /// were dropped.
    pub async fn cleanup_unused(&self) -> usize {
        let mut locks = self.locks.lock().await;
        let before = locks.len();
        locks.retain(|_, lock| Arc::strong_count(lock) > 1 || lock.try_lock().is_err());
        before - locks.len()
    }

    pub async fn len(&self) -> usize {
        self.locks.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{
            AtomicUsize,
            Ordering,
        },
        Arc,
    };

    use super::LockRegistry;

    #[tokio::test]
    async fn test_same_name_shares_one_lock() {
        let registry = Arc::new(LockRegistry::new());
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut handles = vec![];
        for _ in 0..8 {
            let registry = registry.clone();
            let running = running.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                let _guard = registry.acquire("shared").await;
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::task::yield_now().await;
                running.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_cleanup_unused_keeps_held_locks() {
        let registry = LockRegistry::new();
        let held = registry.acquire("held").await;
        drop(registry.acquire("free").await);
        assert_eq!(registry.cleanup_unused().await, 1);
        assert_eq!(registry.len().await, 1);
        drop(held);
        assert_eq!(registry.cleanup_unused().await, 1);
        assert_eq!(registry.len().await, 0);
    }
}
