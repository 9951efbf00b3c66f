//! Per-key rate limiting over a sliding window. State lives in the shared
//! TTL+LRU cache: eviction of a cold key just resets its rate. Updates for a
//! key run under that key's lock from the registry, so concurrent producers
//! on the same key cannot race the window (two tasks, one admission slot,
//! one winner).

use std::{
    num::NonZeroUsize,
    sync::{
        atomic::{
            AtomicBool,
            Ordering,
        },
        Arc,
    },
    time::Duration,
};

use async_cache::{
    LockRegistry,
    TtlLruCache,
};
use async_trait::async_trait;
use common::{
    errors::ProcessorError,
    runtime::Runtime,
    LogEvent,
};
use rand::Rng;

use super::{
    Processor,
    ProcessorOutcome,
};
use crate::{
    config::ThrottleStrategy,
    consts,
};

pub struct ThrottleProcessor<RT: Runtime> {
    rt: RT,
    max_rate: usize,
    window: Duration,
    key_field: String,
    strategy: ThrottleStrategy,
    cache: Arc<TtlLruCache<String, Vec<tokio::time::Instant>>>,
    locks: Arc<LockRegistry>,
    sweeping: Arc<AtomicBool>,
}

impl<RT: Runtime> ThrottleProcessor<RT> {
    pub fn new(
        rt: RT,
        max_rate: usize,
        window: Duration,
        key_field: String,
        strategy: ThrottleStrategy,
        key_cap: usize,
        locks: Arc<LockRegistry>,
    ) -> Result<Self, ProcessorError> {
        if max_rate == 0 {
            return Err(ProcessorError::configuration(
                "throttle_processor",
                "max_rate must be > 0",
            ));
        }
        if window.is_zero() {
            return Err(ProcessorError::configuration(
                "throttle_processor",
                "window_seconds must be > 0",
            ));
        }
        if key_field.trim().is_empty() {
            return Err(ProcessorError::configuration(
                "throttle_processor",
                "key_field must be non-empty",
            ));
        }
        let key_cap = NonZeroUsize::new(key_cap.max(1)).unwrap_or(NonZeroUsize::MIN);
        Ok(Self {
            rt,
            max_rate,
            window,
            key_field,
            strategy,
            cache: Arc::new(TtlLruCache::new(key_cap, Some(window))),
            locks,
            sweeping: Arc::new(AtomicBool::new(false)),
        })
    }

    fn extract_key(&self, event: &LogEvent) -> String {
        event
            .get(&self.key_field)
            .map(|v| v.to_key_string())
            .unwrap_or_else(|| "default".to_string())
    }

    /// Current in-window count for a key, for tests and stats.
    pub async fn current_rate(&self, key: &str) -> usize {
        let now = tokio::time::Instant::now();
        self.cache
            .get(&key.to_string())
            .await
            .map(|timestamps| {
                timestamps
                    .iter()
                    .filter(|t| now.duration_since(**t) <= self.window)
                    .count()
            })
            .unwrap_or(0)
    }

    async fn maybe_schedule_sweep(&self) {
        if self.cache.utilization().await <= consts::SWEEP_UTILIZATION_THRESHOLD {
            return;
        }
        if self.sweeping.swap(true, Ordering::AcqRel) {
            return;
        }
        let cache = self.cache.clone();
        let sweeping = self.sweeping.clone();
        self.rt.spawn("throttle_sweep", async move {
            let removed = cache.cleanup_expired().await;
            if removed > 0 {
                tracing::debug!("throttle sweep removed {removed} expired key(s)");
            }
            sweeping.store(false, Ordering::Release);
        });
    }
}

#[async_trait]
impl<RT: Runtime> Processor for ThrottleProcessor<RT> {
    fn name(&self) -> &'static str {
        "throttle_processor"
    }

    async fn process(&self, event: &mut LogEvent) -> Result<ProcessorOutcome, ProcessorError> {
        let key = self.extract_key(event);
        let _guard = self.locks.acquire(&key).await;

        let now = tokio::time::Instant::now();
        let mut timestamps = self.cache.get(&key).await.unwrap_or_default();
        timestamps.retain(|t| now.duration_since(*t) <= self.window);

        if timestamps.len() >= self.max_rate {
            // Over the limit: admitted samples are not recorded, so the
            // window keeps refusing at full rate.
            self.cache.set(key, timestamps).await;
            let outcome = match self.strategy {
                ThrottleStrategy::Drop => ProcessorOutcome::Drop,
                ThrottleStrategy::Sample => {
                    let draw = self.rt.with_rng(|rng| rng.random::<f64>());
                    if draw < consts::THROTTLE_SAMPLE_ADMIT_RATE {
                        ProcessorOutcome::Continue
                    } else {
                        ProcessorOutcome::Drop
                    }
                },
            };
            self.maybe_schedule_sweep().await;
            return Ok(outcome);
        }

        timestamps.push(now);
        self.cache.set(key, timestamps).await;
        self.maybe_schedule_sweep().await;
        Ok(ProcessorOutcome::Continue)
    }
}
