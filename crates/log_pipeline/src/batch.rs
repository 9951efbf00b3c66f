//! Per-sink batching: buffer events, flush on size or interval, flush once
//! more on close. All buffer mutations serialize on one async mutex, so
//! concurrent `add` calls never double-flush or lose events.
//!
//! Retries are the delivery queue's job; the flush function handed in here
//! is expected to already be retry-wrapped. A flush that still fails means
//! the batch is lost: it is counted and logged, never re-buffered.

use std::{
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

use common::{
    runtime::{
        Runtime,
        SpawnHandle,
    },
    LogEvent,
};
use futures::future::BoxFuture;
use parking_lot::Mutex as SyncMutex;
use tokio::sync::Mutex;

pub type FlushFn =
    Arc<dyn Fn(Vec<Arc<LogEvent>>) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchConfig {
    pub batch_size: usize,
    pub batch_interval: Duration,
}

struct BatchState {
    buffer: Vec<Arc<LogEvent>>,
    last_flush: tokio::time::Instant,
}

pub struct BatchManager {
    state: Mutex<BatchState>,
    flush_fn: FlushFn,
    config: BatchConfig,
    timer: SyncMutex<Option<Box<dyn SpawnHandle>>>,
    closed: AtomicBool,
    lost_events: AtomicU64,
}

impl BatchManager {
    pub fn new<RT: Runtime>(rt: &RT, config: BatchConfig, flush_fn: FlushFn) -> Arc<Self> {
        let manager = Arc::new(Self {
            state: Mutex::new(BatchState {
                buffer: Vec::new(),
                last_flush: tokio::time::Instant::now(),
            }),
            flush_fn,
            config,
            timer: SyncMutex::new(None),
            closed: AtomicBool::new(false),
            lost_events: AtomicU64::new(0),
        });

        let timer_handle = rt.spawn("batch_manager_timer", {
            let manager = Arc::downgrade(&manager);
            let rt = rt.clone();
            let interval = config.batch_interval;
            async move {
                loop {
                    rt.wait(interval).await;
                    let Some(manager) = manager.upgrade() else {
                        return;
                    };
                    if manager.closed.load(Ordering::Acquire) {
                        return;
                    }
                    let mut state = manager.state.lock().await;
                    if !state.buffer.is_empty() && state.last_flush.elapsed() >= interval {
                        manager.flush_locked(&mut state).await;
                    }
                }
            }
        });
        *manager.timer.lock() = Some(timer_handle);
        manager
    }

    /// Append to the buffer, flushing inline once `batch_size` is reached.
    /// The buffer is cleared before `add` returns from a size-triggered
    /// flush. After `close`, writes flush through immediately since no timer
    /// remains to pick them up (late writes happen during shutdown drains).
    pub async fn add(&self, event: Arc<LogEvent>) {
        let mut state = self.state.lock().await;
        state.buffer.push(event);
        if self.closed.load(Ordering::Acquire) || state.buffer.len() >= self.config.batch_size {
            self.flush_locked(&mut state).await;
        }
    }

    /// Explicit flush; a no-op when the buffer is empty.
    pub async fn flush(&self) {
        let mut state = self.state.lock().await;
        if !state.buffer.is_empty() {
            self.flush_locked(&mut state).await;
        }
    }

    /// Flush once and cancel the timer. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(mut handle) = self.timer.lock().take() {
            handle.shutdown();
        }
        self.flush().await;
    }

    /// Events handed to a flush that ultimately failed.
    pub fn lost_events(&self) -> u64 {
        self.lost_events.load(Ordering::Relaxed)
    }

    pub async fn buffered(&self) -> usize {
        self.state.lock().await.buffer.len()
    }

    async fn flush_locked(&self, state: &mut BatchState) {
        let batch = std::mem::take(&mut state.buffer);
        state.last_flush = tokio::time::Instant::now();
        let count = batch.len();
        if let Err(e) = (self.flush_fn)(batch).await {
            self.lost_events.fetch_add(count as u64, Ordering::Relaxed);
            tracing::error!("batch flush failed, {count} event(s) lost: {e:#}");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::Arc,
        time::Duration,
    };

    use chrono::Utc;
    use common::{
        runtime::testing::TestRuntime,
        Level,
        LogEvent,
    };
    use futures::FutureExt;
    use parking_lot::Mutex;

    use super::{
        BatchConfig,
        BatchManager,
        FlushFn,
    };

    fn test_event(message: &str) -> Arc<LogEvent> {
        Arc::new(LogEvent::new(Utc::now(), Level::Info, message))
    }

    fn recording_flush() -> (FlushFn, Arc<Mutex<Vec<Vec<String>>>>) {
        let flushed: Arc<Mutex<Vec<Vec<String>>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = flushed.clone();
        let flush_fn: FlushFn = Arc::new(move |batch| {
            let sink = sink.clone();
            async move {
                sink.lock()
                    .push(batch.iter().map(|e| e.message.clone()).collect());
                Ok(())
            }
            .boxed()
        });
        (flush_fn, flushed)
    }

    #[tokio::test(start_paused = true)]
    async fn test_flushes_on_batch_size() {
        let rt = TestRuntime::new();
        let (flush_fn, flushed) = recording_flush();
        let manager = BatchManager::new(
            &rt,
            BatchConfig {
                batch_size: 2,
                batch_interval: Duration::from_secs(60),
            },
            flush_fn,
        );
        manager.add(test_event("a")).await;
        assert!(flushed.lock().is_empty());
        manager.add(test_event("b")).await;
        assert_eq!(*flushed.lock(), vec![vec!["a".to_string(), "b".to_string()]]);
        assert_eq!(manager.buffered().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_flushes_partial_batch() {
        let rt = TestRuntime::new();
        let (flush_fn, flushed) = recording_flush();
        let manager = BatchManager::new(
            &rt,
            BatchConfig {
                batch_size: 100,
                batch_interval: Duration::from_secs(2),
            },
            flush_fn,
        );
        manager.add(test_event("slow")).await;
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(*flushed.lock(), vec![vec!["slow".to_string()]]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_flushes_once_and_is_idempotent() {
        let rt = TestRuntime::new();
        let (flush_fn, flushed) = recording_flush();
        let manager = BatchManager::new(
            &rt,
            BatchConfig {
                batch_size: 100,
                batch_interval: Duration::from_secs(60),
            },
            flush_fn,
        );
        manager.add(test_event("tail")).await;
        manager.close().await;
        manager.close().await;
        assert_eq!(*flushed.lock(), vec![vec!["tail".to_string()]]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_flush_counts_lost_events() {
        let rt = TestRuntime::new();
        let flush_fn: FlushFn =
            Arc::new(|_| async { anyhow::bail!("endpoint unreachable") }.boxed());
        let manager = BatchManager::new(
            &rt,
            BatchConfig {
                batch_size: 2,
                batch_interval: Duration::from_secs(60),
            },
            flush_fn,
        );
        manager.add(test_event("a")).await;
        manager.add(test_event("b")).await;
        assert_eq!(manager.lost_events(), 2);
        assert_eq!(manager.buffered().await, 0);
    }
}
