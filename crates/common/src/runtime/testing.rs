//! Test implementation of the Runtime trait.
//!
//! Built for `#[tokio::test(start_paused = true)]`: tokio's paused clock
//! auto-advances past every sleep, so timing-dependent pipeline behavior
//! (batch timeouts, throttle windows, backoff) runs deterministically and
//! instantly. The wall clock is virtualized off the same monotonic timer and
//! anchored at a fixed epoch so rendered timestamps are stable too.

use std::{
    future::Future,
    pin::Pin,
    sync::Arc,
    time::{
        Duration,
        SystemTime,
        UNIX_EPOCH,
    },
};

use futures::{
    future::FusedFuture,
    FutureExt,
};
use parking_lot::Mutex;
use rand::{
    RngCore,
    SeedableRng,
};
use rand_chacha::ChaCha12Rng;

use super::{
    Runtime,
    SpawnHandle,
};
use crate::runtime::prod::ProdRuntime;

const DEFAULT_SEED: u64 = 0;

/// 2023-11-14T22:13:20Z. Arbitrary, but fixed so test output is stable.
const TEST_EPOCH_SECS: u64 = 1_700_000_000;

#[derive(Clone)]
pub struct TestRuntime {
    inner: Arc<TestRuntimeInner>,
}

struct TestRuntimeInner {
    started: tokio::time::Instant,
    rng: Mutex<ChaCha12Rng>,
    prod: ProdRuntime,
}

impl TestRuntime {
    /// Must be called from inside a paused-clock tokio test.
    pub fn new() -> Self {
        Self::new_with_seed(DEFAULT_SEED)
    }

    pub fn new_with_seed(seed: u64) -> Self {
        Self {
            inner: Arc::new(TestRuntimeInner {
                started: tokio::time::Instant::now(),
                rng: Mutex::new(ChaCha12Rng::seed_from_u64(seed)),
                prod: ProdRuntime::new(),
            }),
        }
    }

    /// Advance the virtual clock, waking any timers that come due.
    pub async fn advance_time(&self, duration: Duration) {
        tokio::time::advance(duration).await;
    }
}

impl Runtime for TestRuntime {
    fn wait(&self, duration: Duration) -> Pin<Box<dyn FusedFuture<Output = ()> + Send + 'static>> {
        Box::pin(tokio::time::sleep(duration).fuse())
    }

    fn spawn(
        &self,
        name: &'static str,
        f: impl Future<Output = ()> + Send + 'static,
    ) -> Box<dyn SpawnHandle> {
        self.inner.prod.spawn(name, f)
    }

    fn system_time(&self) -> SystemTime {
        let elapsed = tokio::time::Instant::now() - self.inner.started;
        UNIX_EPOCH + Duration::from_secs(TEST_EPOCH_SECS) + elapsed
    }

    fn monotonic_now(&self) -> tokio::time::Instant {
        tokio::time::Instant::now()
    }

    fn with_rng<R>(&self, f: impl FnOnce(&mut dyn RngCore) -> R) -> R {
        let mut rng = self.inner.rng.lock();
        f(&mut *rng)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::TestRuntime;
    use crate::runtime::Runtime;

    #[tokio::test(start_paused = true)]
    async fn test_wait_advances_virtual_time() {
        let rt = TestRuntime::new();
        let before = rt.utc_now();
        rt.wait(Duration::from_secs(60)).await;
        let after = rt.utc_now();
        assert_eq!((after - before).num_seconds(), 60);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rng_is_seeded() {
        let a = TestRuntime::new().with_rng(|rng| rng.next_u64());
        let b = TestRuntime::new().with_rng(|rng| rng.next_u64());
        assert_eq!(a, b);
    }
}
