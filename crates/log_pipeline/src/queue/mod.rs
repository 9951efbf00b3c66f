//! Bounded multi-producer single-consumer delivery queue. Enqueue never
//! raises toward the producer: the return value says whether the event made
//! it in, and every refusal is counted.

use std::sync::{
    atomic::{
        AtomicBool,
        AtomicU64,
        Ordering,
    },
    Arc,
};

use common::{
    runtime::Runtime,
    LogEvent,
};
use rand::Rng;
use serde::Serialize;
use tokio::sync::{
    mpsc,
    Notify,
};

use crate::{
    config::{
        OverflowPolicy,
        QueueSettings,
    },
    metrics::MetricsCollector,
};

pub mod worker;

pub use worker::QueueWorker;

/// Shared producer/worker counters. The metrics collector mirrors these for
/// export; these are the authoritative values for accounting invariants
/// (enqueued = dequeued + dropped_on_shutdown after a drain).
#[derive(Default)]
pub struct QueueCounters {
    pub enqueued: AtomicU64,
    pub dequeued: AtomicU64,
    pub dropped: AtomicU64,
    pub sampled: AtomicU64,
    pub dropped_on_shutdown: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueCountersSnapshot {
    pub enqueued: u64,
    pub dequeued: u64,
    pub dropped: u64,
    pub sampled: u64,
    pub dropped_on_shutdown: u64,
}

impl QueueCounters {
    pub fn snapshot(&self) -> QueueCountersSnapshot {
        QueueCountersSnapshot {
            enqueued: self.enqueued.load(Ordering::SeqCst),
            dequeued: self.dequeued.load(Ordering::SeqCst),
            dropped: self.dropped.load(Ordering::SeqCst),
            sampled: self.sampled.load(Ordering::SeqCst),
            dropped_on_shutdown: self.dropped_on_shutdown.load(Ordering::SeqCst),
        }
    }
}

/// Stop signal shared by the queue (producer side) and the worker.
pub struct StopSignal {
    stopping: AtomicBool,
    notify: Notify,
}

impl StopSignal {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            stopping: AtomicBool::new(false),
            notify: Notify::new(),
        })
    }

    pub fn request_stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    pub async fn stopped(&self) {
        if self.is_stopping() {
            return;
        }
        self.notify.notified().await;
    }
}

pub struct DeliveryQueue<RT: Runtime> {
    rt: RT,
    tx: mpsc::Sender<Arc<LogEvent>>,
    capacity: usize,
    policy: OverflowPolicy,
    sampling_rate: f64,
    counters: Arc<QueueCounters>,
    stop: Arc<StopSignal>,
    metrics: Arc<MetricsCollector>,
}

impl<RT: Runtime> DeliveryQueue<RT> {
    pub fn new(
        rt: RT,
        settings: &QueueSettings,
        sampling_rate: f64,
        metrics: Arc<MetricsCollector>,
    ) -> (Self, mpsc::Receiver<Arc<LogEvent>>) {
        let (tx, rx) = mpsc::channel(settings.maxsize);
        let queue = Self {
            rt,
            tx,
            capacity: settings.maxsize,
            policy: settings.overflow,
            sampling_rate,
            counters: Arc::new(QueueCounters::default()),
            stop: StopSignal::new(),
            metrics,
        };
        (queue, rx)
    }

    pub fn counters(&self) -> Arc<QueueCounters> {
        self.counters.clone()
    }

    pub fn stop_signal(&self) -> Arc<StopSignal> {
        self.stop.clone()
    }

    pub fn depth(&self) -> usize {
        self.capacity - self.tx.capacity()
    }

    /// Enqueue an immutable event. Returns false when the event was refused:
    /// container shutting down, sampled out, queue full under `drop`/
    /// `sample`, or the `block` wait was cancelled.
    pub async fn enqueue(&self, event: Arc<LogEvent>) -> bool {
        if self.stop.is_stopping() {
            self.counters.dropped.fetch_add(1, Ordering::SeqCst);
            self.metrics.record_dropped();
            return false;
        }

        if self.sampling_rate < 1.0 {
            let draw = self.rt.with_rng(|rng| rng.random::<f64>());
            if draw >= self.sampling_rate {
                self.counters.sampled.fetch_add(1, Ordering::SeqCst);
                self.metrics.record_sampled();
                return false;
            }
        }

        let started = self.rt.monotonic_now();
        let accepted = match self.policy {
            OverflowPolicy::Drop | OverflowPolicy::Sample => match self.tx.try_send(event) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    self.counters.dropped.fetch_add(1, Ordering::SeqCst);
                    self.metrics.record_dropped();
                    false
                },
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    self.counters.dropped.fetch_add(1, Ordering::SeqCst);
                    self.metrics.record_dropped();
                    false
                },
            },
            OverflowPolicy::Block => self.tx.send(event).await.is_ok(),
        };

        if accepted {
            self.counters.enqueued.fetch_add(1, Ordering::SeqCst);
            self.metrics
                .record_enqueue(started.elapsed(), self.depth());
        }
        accepted
    }

    /// Refuse new events and wake the worker so it can drain and exit.
    pub fn mark_stopping(&self) {
        self.stop.request_stop();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Utc;
    use common::{
        runtime::testing::TestRuntime,
        Level,
        LogEvent,
    };

    use super::DeliveryQueue;
    use crate::{
        config::{
            OverflowPolicy,
            QueueSettings,
        },
        metrics::MetricsCollector,
    };

    fn test_event() -> Arc<LogEvent> {
        Arc::new(LogEvent::new(Utc::now(), Level::Info, "queued"))
    }

    fn queue_with(
        rt: TestRuntime,
        maxsize: usize,
        overflow: OverflowPolicy,
        sampling_rate: f64,
    ) -> (
        DeliveryQueue<TestRuntime>,
        tokio::sync::mpsc::Receiver<Arc<LogEvent>>,
    ) {
        let settings = QueueSettings {
            maxsize,
            overflow,
            ..QueueSettings::default()
        };
        let metrics = Arc::new(MetricsCollector::new(true, 100));
        DeliveryQueue::new(rt, &settings, sampling_rate, metrics)
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_policy_counts_overflow() {
        let rt = TestRuntime::new();
        let (queue, _rx) = queue_with(rt, 2, OverflowPolicy::Drop, 1.0);
        assert!(queue.enqueue(test_event()).await);
        assert!(queue.enqueue(test_event()).await);
        assert!(!queue.enqueue(test_event()).await);
        let counters = queue.counters().snapshot();
        assert_eq!(counters.enqueued, 2);
        assert_eq!(counters.dropped, 1);
        assert_eq!(queue.depth(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_block_policy_waits_for_space() {
        let rt = TestRuntime::new();
        let (queue, mut rx) = queue_with(rt, 1, OverflowPolicy::Block, 1.0);
        assert!(queue.enqueue(test_event()).await);

        let queue = Arc::new(queue);
        let blocked = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.enqueue(test_event()).await })
        };
        tokio::task::yield_now().await;
        // The producer is parked; freeing a slot lets it complete.
        assert!(rx.recv().await.is_some());
        assert!(blocked.await.unwrap());
        assert_eq!(queue.counters().snapshot().enqueued, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sampling_rejects_and_counts() {
        let rt = TestRuntime::new();
        let (queue, _rx) = queue_with(rt, 100, OverflowPolicy::Drop, 0.0);
        for _ in 0..10 {
            assert!(!queue.enqueue(test_event()).await);
        }
        let counters = queue.counters().snapshot();
        assert_eq!(counters.sampled, 10);
        assert_eq!(counters.enqueued, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stopping_refuses_immediately() {
        let rt = TestRuntime::new();
        let (queue, _rx) = queue_with(rt, 4, OverflowPolicy::Block, 1.0);
        queue.mark_stopping();
        assert!(!queue.enqueue(test_event()).await);
        assert_eq!(queue.counters().snapshot().dropped, 1);
    }
}
