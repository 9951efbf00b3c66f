//! Type-keyed component registry: one instance per container per type, with
//! cleanup hooks run in reverse insertion order at shutdown.

use std::{
    any::{
        Any,
        TypeId,
    },
    collections::HashMap,
    sync::Arc,
};

use futures::future::BoxFuture;
use parking_lot::Mutex;

type CleanupFn = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

struct RegistryInner {
    components: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
    order: Vec<TypeId>,
    cleanups: HashMap<TypeId, CleanupFn>,
}

pub struct ComponentRegistry {
    inner: Mutex<RegistryInner>,
}

impl ComponentRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RegistryInner {
                components: HashMap::new(),
                order: Vec::new(),
                cleanups: HashMap::new(),
            }),
        }
    }

    /// Register the canonical instance for `T`, replacing any previous one.
    pub fn register<T: Send + Sync + 'static>(&self, instance: Arc<T>) {
        self.register_inner::<T>(instance, None);
    }

    /// Like `register`, with an async cleanup hook invoked by `cleanup()`.
    pub fn register_with_cleanup<T: Send + Sync + 'static>(
        &self,
        instance: Arc<T>,
        cleanup: impl FnOnce() -> BoxFuture<'static, ()> + Send + 'static,
    ) {
        self.register_inner::<T>(instance, Some(Box::new(cleanup)));
    }

    fn register_inner<T: Send + Sync + 'static>(
        &self,
        instance: Arc<T>,
        cleanup: Option<CleanupFn>,
    ) {
        let key = TypeId::of::<T>();
        let mut inner = self.inner.lock();
        if inner.components.insert(key, instance).is_none() {
            inner.order.push(key);
        }
        if let Some(cleanup) = cleanup {
            inner.cleanups.insert(key, cleanup);
        }
    }

    pub fn get<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        let inner = self.inner.lock();
        inner
            .components
            .get(&TypeId::of::<T>())
            .cloned()
            .and_then(|any| any.downcast::<T>().ok())
    }

    /// Return the registered instance for `T`, creating and registering it
    /// atomically on first use.
    pub fn get_or_create<T: Send + Sync + 'static>(
        &self,
        factory: impl FnOnce() -> Arc<T>,
    ) -> Arc<T> {
        let key = TypeId::of::<T>();
        let mut inner = self.inner.lock();
        if let Some(existing) = inner
            .components
            .get(&key)
            .cloned()
            .and_then(|any| any.downcast::<T>().ok())
        {
            return existing;
        }
        let instance = factory();
        inner.components.insert(key, instance.clone());
        inner.order.push(key);
        instance
    }

    pub fn len(&self) -> usize {
        self.inner.lock().components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().components.is_empty()
    }

    /// Run cleanup hooks in reverse insertion order, then drop everything.
    /// Hooks are taken out under the lock and awaited outside it.
    pub async fn cleanup(&self) {
        let hooks: Vec<CleanupFn> = {
            let mut inner = self.inner.lock();
            let order: Vec<TypeId> = inner.order.iter().rev().cloned().collect();
            let mut hooks = Vec::new();
            for key in order {
                if let Some(hook) = inner.cleanups.remove(&key) {
                    hooks.push(hook);
                }
            }
            inner.components.clear();
            inner.order.clear();
            hooks
        };
        for hook in hooks {
            hook().await;
        }
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

    use futures::FutureExt;
    use parking_lot::Mutex;

    use super::ComponentRegistry;

    struct Alpha;
    struct Beta;

    #[test]
    fn test_register_and_typed_get() {
        let registry = ComponentRegistry::new();
        registry.register(Arc::new(Alpha));
        assert!(registry.get::<Alpha>().is_some());
        assert!(registry.get::<Beta>().is_none());
    }

    #[test]
    fn test_get_or_create_is_single_instance() {
        let registry = ComponentRegistry::new();
        let calls = AtomicUsize::new(0);
        let first = registry.get_or_create(|| {
            calls.fetch_add(1, Ordering::SeqCst);
            Arc::new(Alpha)
        });
        let second = registry.get_or_create(|| {
            calls.fetch_add(1, Ordering::SeqCst);
            Arc::new(Alpha)
        });
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cleanup_runs_in_reverse_insertion_order() {
        let registry = ComponentRegistry::new();
        let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));

        let first = order.clone();
        registry.register_with_cleanup(Arc::new(Alpha), move || {
            async move { first.lock().push("alpha") }.boxed()
        });
        let second = order.clone();
        registry.register_with_cleanup(Arc::new(Beta), move || {
            async move { second.lock().push("beta") }.boxed()
        });

        registry.cleanup().await;
        assert_eq!(*order.lock(), vec!["beta", "alpha"]);
        assert!(registry.is_empty());
    }
}
