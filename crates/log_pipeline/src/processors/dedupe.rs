//! Suppresses recurring events with the same signature inside a window. The
//! signature is a hash of the canonical JSON of the configured fields;
//! check-and-insert runs as one critical section under the signature's lock,
//! so exactly one event per signature passes per window no matter how many
//! producers race.

use std::{
    collections::BTreeMap,
    num::NonZeroUsize,
    sync::{
        atomic::{
            AtomicBool,
            AtomicU64,
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
use sha1::Digest;

use super::{
    Processor,
    ProcessorOutcome,
};
use crate::{
    config::HashAlgorithm,
    consts,
};

#[derive(Debug, Clone)]
struct DedupeEntry {
    count: u64,
    first_seen: tokio::time::Instant,
    last_seen: tokio::time::Instant,
}

pub struct DedupeProcessor<RT: Runtime> {
    rt: RT,
    window: Duration,
    fields: Vec<String>,
    algorithm: HashAlgorithm,
    cache: Arc<TtlLruCache<String, DedupeEntry>>,
    locks: Arc<LockRegistry>,
    duplicates: AtomicU64,
    sweeping: Arc<AtomicBool>,
}

impl<RT: Runtime> DedupeProcessor<RT> {
    pub fn new(
        rt: RT,
        window: Duration,
        fields: Vec<String>,
        max_cache_size: usize,
        algorithm: HashAlgorithm,
        locks: Arc<LockRegistry>,
    ) -> Result<Self, ProcessorError> {
        if window.is_zero() {
            return Err(ProcessorError::configuration(
                "dedupe_processor",
                "window_seconds must be > 0",
            ));
        }
        if fields.is_empty() {
            return Err(ProcessorError::configuration(
                "dedupe_processor",
                "at least one signature field is required",
            ));
        }
        let max_cache_size =
            NonZeroUsize::new(max_cache_size.max(1)).unwrap_or(NonZeroUsize::MIN);
        Ok(Self {
            rt,
            window,
            fields,
            algorithm,
            cache: Arc::new(TtlLruCache::new(max_cache_size, Some(window))),
            locks,
            duplicates: AtomicU64::new(0),
            sweeping: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Canonical JSON of the signature fields (missing fields omitted),
    /// hashed with the configured algorithm.
    fn signature(&self, event: &LogEvent) -> String {
        let mut selected = BTreeMap::new();
        for field in &self.fields {
            if let Some(value) = event.get(field) {
                selected.insert(field.clone(), value.to_json());
            }
        }
        let canonical =
            serde_json::to_string(&selected).unwrap_or_else(|_| String::from("{}"));
        match self.algorithm {
            HashAlgorithm::Md5 => format!("{:x}", md5::compute(canonical.as_bytes())),
            HashAlgorithm::Sha1 => {
                hex::encode(sha1::Sha1::digest(canonical.as_bytes()))
            },
            HashAlgorithm::Sha256 => {
                hex::encode(sha2::Sha256::digest(canonical.as_bytes()))
            },
        }
    }

    /// Total duplicates suppressed since construction.
    pub fn duplicates_suppressed(&self) -> u64 {
        self.duplicates.load(Ordering::Relaxed)
    }

    /// Occurrence count and time since the last occurrence for this event's
    /// signature, if it is still cached.
    pub async fn signature_stats(&self, event: &LogEvent) -> Option<(u64, Duration)> {
        let signature = self.signature(event);
        let now = tokio::time::Instant::now();
        self.cache
            .get(&signature)
            .await
            .map(|entry| (entry.count, now.duration_since(entry.last_seen)))
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
        self.rt.spawn("dedupe_sweep", async move {
            let removed = cache.cleanup_expired().await;
            if removed > 0 {
                tracing::debug!("dedupe sweep removed {removed} expired signature(s)");
            }
            sweeping.store(false, Ordering::Release);
        });
    }
}

#[async_trait]
impl<RT: Runtime> Processor for DedupeProcessor<RT> {
    fn name(&self) -> &'static str {
        "dedupe_processor"
    }

    async fn process(&self, event: &mut LogEvent) -> Result<ProcessorOutcome, ProcessorError> {
        let signature = self.signature(event);
        let _guard = self.locks.acquire(&signature).await;

        let now = tokio::time::Instant::now();
        let outcome = match self.cache.get(&signature).await {
            // The window is anchored at the first occurrence, not the most
            // recent duplicate.
            Some(mut entry) if now.duration_since(entry.first_seen) <= self.window => {
                entry.count += 1;
                entry.last_seen = now;
                self.cache.set(signature, entry).await;
                self.duplicates.fetch_add(1, Ordering::Relaxed);
                ProcessorOutcome::Drop
            },
            _ => {
                self.cache
                    .set(
                        signature,
                        DedupeEntry {
                            count: 1,
                            first_seen: now,
                            last_seen: now,
                        },
                    )
                    .await;
                ProcessorOutcome::Continue
            },
        };
        self.maybe_schedule_sweep().await;
        Ok(outcome)
    }
}
