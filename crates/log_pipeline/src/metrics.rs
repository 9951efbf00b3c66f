//! Container-scoped metrics. Every stage of the pipeline reports here:
//! producers on enqueue, the worker on dequeue/batch/sink writes, the chain
//! per processor. All mutators take the internal mutex; readers get a
//! consistent snapshot. Nothing is process-global, so two containers never
//! share counters.

use std::{
    collections::{
        BTreeMap,
        VecDeque,
    },
    time::Duration,
};

use chrono::{
    DateTime,
    Utc,
};
use parking_lot::Mutex;
use serde::Serialize;

/// Moving average over the last `cap` samples.
struct MovingWindow {
    samples: VecDeque<f64>,
    cap: usize,
}

impl MovingWindow {
    fn new(cap: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(cap),
            cap,
        }
    }

    fn push(&mut self, sample: f64) {
        if self.samples.len() == self.cap {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    fn average(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().sum::<f64>() / self.samples.len() as f64
    }
}

fn millis(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1000.0
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct QueueMetricsSnapshot {
    pub depth: usize,
    pub peak_depth: usize,
    pub enqueued: u64,
    pub dequeued: u64,
    pub dropped: u64,
    pub sampled: u64,
    pub processed: u64,
    pub failed: u64,
    pub avg_enqueue_latency_ms: f64,
    pub avg_dequeue_latency_ms: f64,
    pub avg_batch_processing_ms: f64,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct SinkMetricsSnapshot {
    pub writes: u64,
    pub successes: u64,
    pub failures: u64,
    pub retries: u64,
    pub avg_write_latency_ms: f64,
    pub avg_batch_size: f64,
    pub last_error: Option<String>,
    pub last_error_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct ProcessorMetricsSnapshot {
    pub executions: u64,
    pub successes: u64,
    pub failures: u64,
    pub min_latency_ms: f64,
    pub max_latency_ms: f64,
    pub total_latency_ms: f64,
    pub bytes_processed: u64,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct SystemMetricsSnapshot {
    pub memory_bytes: u64,
    pub cpu_percent: f64,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct MetricsSnapshot {
    pub queue: QueueMetricsSnapshot,
    pub sinks: BTreeMap<String, SinkMetricsSnapshot>,
    pub processors: BTreeMap<String, ProcessorMetricsSnapshot>,
    pub system: Option<SystemMetricsSnapshot>,
}

struct QueueStats {
    depth: usize,
    peak_depth: usize,
    enqueued: u64,
    dequeued: u64,
    dropped: u64,
    sampled: u64,
    processed: u64,
    failed: u64,
    enqueue_latency: MovingWindow,
    dequeue_latency: MovingWindow,
    batch_processing: MovingWindow,
}

struct SinkStats {
    writes: u64,
    successes: u64,
    failures: u64,
    retries: u64,
    write_latency: MovingWindow,
    batch_size: MovingWindow,
    last_error: Option<String>,
    last_error_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct ProcessorStats {
    executions: u64,
    successes: u64,
    failures: u64,
    min_latency_ms: Option<f64>,
    max_latency_ms: f64,
    total_latency_ms: f64,
    bytes_processed: u64,
}

struct MetricsInner {
    queue: QueueStats,
    sinks: BTreeMap<String, SinkStats>,
    processors: BTreeMap<String, ProcessorStats>,
}

pub struct MetricsCollector {
    enabled: bool,
    sample_window: usize,
    inner: Mutex<MetricsInner>,
    system: Mutex<sysinfo::System>,
}

impl MetricsCollector {
    pub fn new(enabled: bool, sample_window: usize) -> Self {
        Self {
            enabled,
            sample_window,
            inner: Mutex::new(MetricsInner {
                queue: QueueStats {
                    depth: 0,
                    peak_depth: 0,
                    enqueued: 0,
                    dequeued: 0,
                    dropped: 0,
                    sampled: 0,
                    processed: 0,
                    failed: 0,
                    enqueue_latency: MovingWindow::new(sample_window),
                    dequeue_latency: MovingWindow::new(sample_window),
                    batch_processing: MovingWindow::new(sample_window),
                },
                sinks: BTreeMap::new(),
                processors: BTreeMap::new(),
            }),
            system: Mutex::new(sysinfo::System::new()),
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    // Queue side.

    pub fn record_enqueue(&self, latency: Duration, depth: usize) {
        if !self.enabled {
            return;
        }
        let mut inner = self.inner.lock();
        inner.queue.enqueued += 1;
        inner.queue.depth = depth;
        inner.queue.peak_depth = inner.queue.peak_depth.max(depth);
        inner.queue.enqueue_latency.push(millis(latency));
    }

    pub fn record_dequeue(&self, latency: Duration, depth: usize) {
        if !self.enabled {
            return;
        }
        let mut inner = self.inner.lock();
        inner.queue.dequeued += 1;
        inner.queue.depth = depth;
        inner.queue.dequeue_latency.push(millis(latency));
    }

    pub fn record_dropped(&self) {
        if !self.enabled {
            return;
        }
        self.inner.lock().queue.dropped += 1;
    }

    pub fn record_sampled(&self) {
        if !self.enabled {
            return;
        }
        self.inner.lock().queue.sampled += 1;
    }

    pub fn record_batch_processing(&self, duration: Duration) {
        if !self.enabled {
            return;
        }
        self.inner
            .lock()
            .queue
            .batch_processing
            .push(millis(duration));
    }

    pub fn record_event_processed(&self) {
        if !self.enabled {
            return;
        }
        self.inner.lock().queue.processed += 1;
    }

    pub fn record_event_failed(&self) {
        if !self.enabled {
            return;
        }
        self.inner.lock().queue.failed += 1;
    }

    // Sink side.

    pub fn record_sink_write(&self, sink: &str, latency: Duration, success: bool) {
        if !self.enabled {
            return;
        }
        let mut inner = self.inner.lock();
        let stats = sink_entry(&mut inner, sink, self.sample_window);
        stats.writes += 1;
        if success {
            stats.successes += 1;
        } else {
            stats.failures += 1;
        }
        stats.write_latency.push(millis(latency));
    }

    pub fn record_sink_retry(&self, sink: &str) {
        if !self.enabled {
            return;
        }
        let mut inner = self.inner.lock();
        sink_entry(&mut inner, sink, self.sample_window).retries += 1;
    }

    pub fn record_sink_batch_size(&self, sink: &str, size: usize) {
        if !self.enabled {
            return;
        }
        let mut inner = self.inner.lock();
        sink_entry(&mut inner, sink, self.sample_window)
            .batch_size
            .push(size as f64);
    }

    pub fn record_sink_error(&self, sink: &str, error: String, at: DateTime<Utc>) {
        if !self.enabled {
            return;
        }
        let mut inner = self.inner.lock();
        let stats = sink_entry(&mut inner, sink, self.sample_window);
        stats.last_error = Some(error);
        stats.last_error_at = Some(at);
    }

    // Processor side.

    pub fn record_processor(&self, processor: &str, duration: Duration, success: bool, bytes: usize) {
        if !self.enabled {
            return;
        }
        let mut inner = self.inner.lock();
        let stats = inner.processors.entry(processor.to_string()).or_default();
        let latency_ms = millis(duration);
        stats.executions += 1;
        if success {
            stats.successes += 1;
        } else {
            stats.failures += 1;
        }
        stats.min_latency_ms = Some(match stats.min_latency_ms {
            Some(min) => min.min(latency_ms),
            None => latency_ms,
        });
        stats.max_latency_ms = stats.max_latency_ms.max(latency_ms);
        stats.total_latency_ms += latency_ms;
        stats.bytes_processed += bytes as u64;
    }

    /// Current resident memory and CPU for this process. Refreshes sysinfo
    /// state, so callers should treat it as a sampling operation.
    pub fn sample_system(&self) -> Option<SystemMetricsSnapshot> {
        let pid = sysinfo::get_current_pid().ok()?;
        let mut system = self.system.lock();
        system.refresh_processes(sysinfo::ProcessesToUpdate::Some(&[pid]), true);
        let process = system.process(pid)?;
        Some(SystemMetricsSnapshot {
            memory_bytes: process.memory(),
            cpu_percent: f64::from(process.cpu_usage()),
        })
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.snapshot_with_system(false)
    }

    pub fn snapshot_with_system(&self, include_system: bool) -> MetricsSnapshot {
        let inner = self.inner.lock();
        let queue = QueueMetricsSnapshot {
            depth: inner.queue.depth,
            peak_depth: inner.queue.peak_depth,
            enqueued: inner.queue.enqueued,
            dequeued: inner.queue.dequeued,
            dropped: inner.queue.dropped,
            sampled: inner.queue.sampled,
            processed: inner.queue.processed,
            failed: inner.queue.failed,
            avg_enqueue_latency_ms: inner.queue.enqueue_latency.average(),
            avg_dequeue_latency_ms: inner.queue.dequeue_latency.average(),
            avg_batch_processing_ms: inner.queue.batch_processing.average(),
        };
        let sinks = inner
            .sinks
            .iter()
            .map(|(name, stats)| {
                (
                    name.clone(),
                    SinkMetricsSnapshot {
                        writes: stats.writes,
                        successes: stats.successes,
                        failures: stats.failures,
                        retries: stats.retries,
                        avg_write_latency_ms: stats.write_latency.average(),
                        avg_batch_size: stats.batch_size.average(),
                        last_error: stats.last_error.clone(),
                        last_error_at: stats.last_error_at,
                    },
                )
            })
            .collect();
        let processors = inner
            .processors
            .iter()
            .map(|(name, stats)| {
                (
                    name.clone(),
                    ProcessorMetricsSnapshot {
                        executions: stats.executions,
                        successes: stats.successes,
                        failures: stats.failures,
                        min_latency_ms: stats.min_latency_ms.unwrap_or(0.0),
                        max_latency_ms: stats.max_latency_ms,
                        total_latency_ms: stats.total_latency_ms,
                        bytes_processed: stats.bytes_processed,
                    },
                )
            })
            .collect();
        drop(inner);

        MetricsSnapshot {
            queue,
            sinks,
            processors,
            system: if include_system {
                self.sample_system()
            } else {
                None
            },
        }
    }
}

fn sink_entry<'a>(
    inner: &'a mut MetricsInner,
    sink: &str,
    sample_window: usize,
) -> &'a mut SinkStats {
    inner
        .sinks
        .entry(sink.to_string())
        .or_insert_with(|| SinkStats {
            writes: 0,
            successes: 0,
            failures: 0,
            retries: 0,
            write_latency: MovingWindow::new(sample_window),
            batch_size: MovingWindow::new(sample_window),
            last_error: None,
            last_error_at: None,
        })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::MetricsCollector;

    #[test]
    fn test_queue_counters_and_peak_depth() {
        let metrics = MetricsCollector::new(true, 100);
        metrics.record_enqueue(Duration::from_millis(1), 1);
        metrics.record_enqueue(Duration::from_millis(3), 2);
        metrics.record_dequeue(Duration::from_millis(2), 1);
        metrics.record_dropped();
        metrics.record_sampled();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.queue.enqueued, 2);
        assert_eq!(snapshot.queue.dequeued, 1);
        assert_eq!(snapshot.queue.dropped, 1);
        assert_eq!(snapshot.queue.sampled, 1);
        assert_eq!(snapshot.queue.peak_depth, 2);
        assert!((snapshot.queue.avg_enqueue_latency_ms - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_moving_window_is_bounded() {
        let metrics = MetricsCollector::new(true, 2);
        for latency in [10, 20, 60] {
            metrics.record_enqueue(Duration::from_millis(latency), 0);
        }
        // Only the last two samples (20ms, 60ms) remain.
        let snapshot = metrics.snapshot();
        assert!((snapshot.queue.avg_enqueue_latency_ms - 40.0).abs() < 1e-9);
    }

    #[test]
    fn test_sink_stats_track_last_error() {
        let metrics = MetricsCollector::new(true, 100);
        metrics.record_sink_write("loki", Duration::from_millis(5), true);
        metrics.record_sink_write("loki", Duration::from_millis(7), false);
        metrics.record_sink_retry("loki");
        metrics.record_sink_error("loki", "connection refused".to_string(), chrono::Utc::now());

        let snapshot = metrics.snapshot();
        let loki = &snapshot.sinks["loki"];
        assert_eq!(loki.writes, 2);
        assert_eq!(loki.successes, 1);
        assert_eq!(loki.failures, 1);
        assert_eq!(loki.retries, 1);
        assert_eq!(loki.last_error.as_deref(), Some("connection refused"));
        assert!(loki.last_error_at.is_some());
    }

    #[test]
    fn test_processor_latency_min_max_sum() {
        let metrics = MetricsCollector::new(true, 100);
        metrics.record_processor("redactor", Duration::from_millis(2), true, 100);
        metrics.record_processor("redactor", Duration::from_millis(8), true, 150);
        metrics.record_processor("redactor", Duration::from_millis(4), false, 0);

        let snapshot = metrics.snapshot();
        let redactor = &snapshot.processors["redactor"];
        assert_eq!(redactor.executions, 3);
        assert_eq!(redactor.successes, 2);
        assert_eq!(redactor.failures, 1);
        assert!((redactor.min_latency_ms - 2.0).abs() < 1e-9);
        assert!((redactor.max_latency_ms - 8.0).abs() < 1e-9);
        assert!((redactor.total_latency_ms - 14.0).abs() < 1e-9);
        assert_eq!(redactor.bytes_processed, 250);
    }

    #[test]
    fn test_disabled_collector_records_nothing() {
        let metrics = MetricsCollector::new(false, 100);
        metrics.record_enqueue(Duration::from_millis(1), 1);
        metrics.record_sink_write("stdout", Duration::from_millis(1), true);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.queue.enqueued, 0);
        assert!(snapshot.sinks.is_empty());
    }
}
