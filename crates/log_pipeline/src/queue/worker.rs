//! The single consumer. Batches are collected with a bounded wait for the
//! first event and a non-blocking drain for the rest; each event fans out to
//! every sink in parallel, failed sinks are retried with exponential
//! backoff, and a stop request drains whatever is left inside the shutdown
//! deadline. Events that cannot be drained in time are counted as failures,
//! never silently forgotten.

use std::{
    sync::{
        atomic::Ordering,
        Arc,
    },
    time::Duration,
};

use common::{
    errors::QueueError,
    runtime::{
        Runtime,
        SpawnHandle,
    },
    Backoff,
    LogEvent,
};
use futures::future::join_all;
use tokio::sync::mpsc;

use super::{
    QueueCounters,
    StopSignal,
};
use crate::{
    config::QueueSettings,
    consts,
    metrics::MetricsCollector,
    sinks::SinkRecord,
};

enum FirstEvent {
    Event(Arc<LogEvent>),
    TimedOut,
    Closed,
    StopRequested,
}

pub struct QueueWorker<RT: Runtime> {
    rt: RT,
    rx: mpsc::Receiver<Arc<LogEvent>>,
    sinks: Vec<Arc<SinkRecord>>,
    batch_size: usize,
    batch_timeout: Duration,
    retry_delay: Duration,
    max_retries: u32,
    counters: Arc<QueueCounters>,
    stop: Arc<StopSignal>,
    metrics: Arc<MetricsCollector>,
}

impl<RT: Runtime> QueueWorker<RT> {
    pub fn new(
        rt: RT,
        rx: mpsc::Receiver<Arc<LogEvent>>,
        sinks: Vec<Arc<SinkRecord>>,
        settings: &QueueSettings,
        counters: Arc<QueueCounters>,
        stop: Arc<StopSignal>,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            rt,
            rx,
            sinks,
            batch_size: settings.batch_size,
            batch_timeout: settings.batch_timeout(),
            retry_delay: settings.retry_delay(),
            max_retries: settings.max_retries,
            counters,
            stop,
            metrics,
        }
    }

    /// Spawn the worker task. Exactly one worker runs per queue; the
    /// receiver moves in here.
    pub fn start(self) -> Box<dyn SpawnHandle> {
        let rt = self.rt.clone();
        rt.spawn("queue_worker", self.run())
    }

    async fn run(mut self) {
        tracing::debug!("queue worker started");
        loop {
            if self.stop.is_stopping() {
                break;
            }
            match self.collect_batch().await {
                Ok(batch) if batch.is_empty() => {},
                Ok(batch) => self.process_batch(batch).await,
                Err(FirstEventClosed) => break,
            }
        }
        self.drain().await;
        tracing::debug!("queue worker stopped");
    }

    async fn first_event(&mut self) -> FirstEvent {
        tokio::select! {
            _ = self.stop.stopped() => FirstEvent::StopRequested,
            result = tokio::time::timeout(self.batch_timeout, self.rx.recv()) => {
                match result {
                    Err(_) => FirstEvent::TimedOut,
                    Ok(None) => FirstEvent::Closed,
                    Ok(Some(event)) => FirstEvent::Event(event),
                }
            },
        }
    }

    /// Block up to `batch_timeout` for the first event, then drain without
    /// blocking up to `batch_size`.
    async fn collect_batch(&mut self) -> Result<Vec<Arc<LogEvent>>, FirstEventClosed> {
        let wait_started = self.rt.monotonic_now();
        let first = match self.first_event().await {
            FirstEvent::Event(event) => event,
            FirstEvent::TimedOut | FirstEvent::StopRequested => return Ok(Vec::new()),
            FirstEvent::Closed => return Err(FirstEventClosed),
        };
        self.note_dequeued(wait_started.elapsed());

        let mut batch = vec![first];
        while batch.len() < self.batch_size {
            match self.rx.try_recv() {
                Ok(event) => {
                    self.note_dequeued(Duration::ZERO);
                    batch.push(event);
                },
                Err(_) => break,
            }
        }
        Ok(batch)
    }

    fn note_dequeued(&self, wait: Duration) {
        self.counters.dequeued.fetch_add(1, Ordering::SeqCst);
        self.metrics.record_dequeue(wait, self.rx.len());
    }

    async fn process_batch(&mut self, batch: Vec<Arc<LogEvent>>) {
        let started = self.rt.monotonic_now();
        let batch_size = batch.len();
        for event in batch {
            self.process_event(event).await;
        }
        for record in &self.sinks {
            self.metrics.record_sink_batch_size(record.name(), batch_size);
        }
        self.metrics.record_batch_processing(started.elapsed());
    }

    /// Write the event to every sink in parallel, then retry the sinks that
    /// failed. After retries are exhausted the event is given up on and the
    /// failure recorded; the queue never stalls on one event.
    async fn process_event(&self, event: Arc<LogEvent>) {
        let results = join_all(
            self.sinks
                .iter()
                .map(|record| self.write_to_sink(record, &event)),
        )
        .await;

        let mut failed: Vec<Arc<SinkRecord>> = Vec::new();
        let mut first_error = None;
        let mut unretryable = 0usize;
        for (record, result) in self.sinks.iter().zip(results) {
            if let Err(e) = result {
                let retryable = e.is_retryable();
                if first_error.is_none() {
                    first_error = Some(e);
                }
                if retryable {
                    failed.push(record.clone());
                } else {
                    unretryable += 1;
                }
            }
        }

        if failed.is_empty() && unretryable == 0 {
            self.metrics.record_event_processed();
            return;
        }

        let total_failed = failed.len() + unretryable;
        let queue_error = QueueError::new("process_event")
            .with_event_keys(event.keys())
            .with_sink_counts(self.sinks.len(), total_failed);
        let queue_error = match first_error {
            Some(cause) => queue_error.with_cause(cause),
            None => queue_error,
        };
        tracing::warn!("{queue_error}");

        let retried = join_all(
            failed
                .iter()
                .map(|record| self.retry_failed_sink(record, &event)),
        )
        .await;

        if unretryable == 0 && retried.iter().all(|ok| *ok) {
            self.metrics.record_event_processed();
        } else {
            self.metrics.record_event_failed();
        }
    }

    async fn write_to_sink(
        &self,
        record: &Arc<SinkRecord>,
        event: &Arc<LogEvent>,
    ) -> Result<(), common::errors::SinkError> {
        let started = self.rt.monotonic_now();
        let result = record.sink.write(event).await;
        self.metrics
            .record_sink_write(record.name(), started.elapsed(), result.is_ok());
        if let Err(e) = &result {
            self.metrics
                .record_sink_error(record.name(), e.to_string(), self.rt.utc_now());
        }
        result
    }

    /// Backoff-spaced retries for one failed sink. The initial attempt has
    /// already happened, so `max_retries` bounds the additional ones.
    async fn retry_failed_sink(&self, record: &Arc<SinkRecord>, event: &Arc<LogEvent>) -> bool {
        let mut backoff = Backoff::new(self.retry_delay, consts::RETRY_MAX_DELAY);
        for _ in 0..self.max_retries {
            let delay = self.rt.with_rng(|rng| backoff.fail(rng));
            self.rt.wait(delay).await;

            self.metrics.record_sink_retry(record.name());
            match self.write_to_sink(record, event).await {
                Ok(()) => return true,
                Err(e) if !e.is_retryable() => return false,
                Err(_) => {},
            }
        }
        false
    }

    /// Process whatever is still queued, bounded by the drain deadline.
    /// Anything left after the deadline is counted as dropped on shutdown.
    async fn drain(&mut self) {
        self.rx.close();
        let deadline = tokio::time::timeout(consts::SHUTDOWN_DRAIN_DEADLINE, async {
            while let Some(event) = self.rx.recv().await {
                self.note_dequeued(Duration::ZERO);
                self.process_event(event).await;
            }
        })
        .await;

        if deadline.is_err() {
            let mut abandoned = 0u64;
            while self.rx.try_recv().is_ok() {
                abandoned += 1;
            }
            if abandoned > 0 {
                self.counters
                    .dropped_on_shutdown
                    .fetch_add(abandoned, Ordering::SeqCst);
                for _ in 0..abandoned {
                    self.metrics.record_event_failed();
                }
                tracing::warn!("drain deadline elapsed, {abandoned} event(s) abandoned");
            }
        }
    }
}

struct FirstEventClosed;

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

    use super::QueueWorker;
    use crate::{
        config::{
            OverflowPolicy,
            QueueSettings,
        },
        metrics::MetricsCollector,
        queue::DeliveryQueue,
        sinks::{
            recording::RecordingSink,
            SinkRecord,
        },
    };

    fn test_event(message: &str) -> Arc<LogEvent> {
        Arc::new(LogEvent::new(Utc::now(), Level::Info, message))
    }

    struct Fixture {
        rt: TestRuntime,
        queue: DeliveryQueue<TestRuntime>,
        sink: Arc<RecordingSink<TestRuntime>>,
        handle: Box<dyn common::runtime::SpawnHandle>,
        metrics: Arc<MetricsCollector>,
    }

    fn start_pipeline(settings: QueueSettings) -> Fixture {
        let rt = TestRuntime::new();
        let metrics = Arc::new(MetricsCollector::new(true, 100));
        let (queue, rx) = DeliveryQueue::new(rt.clone(), &settings, 1.0, metrics.clone());
        let sink = RecordingSink::new(rt.clone(), "recording");
        let record = SinkRecord::new(sink.clone());
        let worker = QueueWorker::new(
            rt.clone(),
            rx,
            vec![record],
            &settings,
            queue.counters(),
            queue.stop_signal(),
            metrics.clone(),
        );
        let handle = worker.start();
        Fixture {
            rt,
            queue,
            sink,
            handle,
            metrics,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_events_flow_to_sink_in_order() -> anyhow::Result<()> {
        let mut fixture = start_pipeline(QueueSettings::default());
        for i in 0..5 {
            assert!(fixture.queue.enqueue(test_event(&format!("event {i}"))).await);
        }
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(
            fixture.sink.messages(),
            vec!["event 0", "event 1", "event 2", "event 3", "event 4"],
        );
        let counters = fixture.queue.counters().snapshot();
        assert_eq!(counters.enqueued, 5);
        assert_eq!(counters.dequeued, 5);

        fixture.queue.mark_stopping();
        fixture.handle.join().await?;
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_sink_is_retried() -> anyhow::Result<()> {
        let fixture = start_pipeline(QueueSettings {
            retry_delay: 0.1,
            max_retries: 3,
            ..QueueSettings::default()
        });
        fixture.sink.fail_next_writes(2);
        assert!(fixture.queue.enqueue(test_event("flaky")).await);
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(fixture.sink.messages(), vec!["flaky"]);
        let snapshot = fixture.metrics.snapshot();
        let stats = &snapshot.sinks["recording"];
        assert_eq!(stats.retries, 2);
        assert_eq!(stats.failures, 2);
        assert!(stats.last_error.is_some());
        assert_eq!(snapshot.queue.processed, 1);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_do_not_stall_the_queue() -> anyhow::Result<()> {
        let fixture = start_pipeline(QueueSettings {
            retry_delay: 0.1,
            max_retries: 1,
            ..QueueSettings::default()
        });
        fixture.sink.fail_next_writes(2);
        assert!(fixture.queue.enqueue(test_event("doomed")).await);
        assert!(fixture.queue.enqueue(test_event("fine")).await);
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(fixture.sink.messages(), vec!["fine"]);
        let snapshot = fixture.metrics.snapshot();
        assert_eq!(snapshot.queue.failed, 1);
        assert_eq!(snapshot.queue.processed, 1);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_drains_remaining_events() -> anyhow::Result<()> {
        let mut fixture = start_pipeline(QueueSettings {
            batch_size: 2,
            overflow: OverflowPolicy::Block,
            ..QueueSettings::default()
        });
        for i in 0..10 {
            assert!(fixture.queue.enqueue(test_event(&format!("event {i}"))).await);
        }
        fixture.queue.mark_stopping();
        fixture.handle.join().await?;

        assert_eq!(fixture.sink.messages().len(), 10);
        let counters = fixture.queue.counters().snapshot();
        assert_eq!(
            counters.dequeued + counters.dropped_on_shutdown,
            counters.enqueued
        );
        let _ = fixture.rt;
        Ok(())
    }

}
