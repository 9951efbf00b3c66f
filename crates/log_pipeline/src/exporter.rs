//! Prometheus surface: a text serializer over the collector's snapshot and
//! the embedded HTTP server exposing `/metrics` and `/health`. The registry
//! is transient, built per scrape from snapshot values, so nothing here is
//! process-global and two containers can export side by side.

use std::{
    net::SocketAddr,
    sync::Arc,
};

use axum::{
    extract::State,
    response::IntoResponse,
    routing::get,
    Json,
    Router,
};
use common::runtime::{
    Runtime,
    SpawnHandle,
};
use parking_lot::Mutex;
use prometheus::{
    Encoder,
    Gauge,
    GaugeVec,
    IntCounter,
    IntCounterVec,
    IntGauge,
    Opts,
    Registry,
    TextEncoder,
};

use crate::metrics::{
    MetricsCollector,
    MetricsSnapshot,
};

fn int_counter(registry: &Registry, name: &str, help: &str, value: u64) {
    if let Ok(counter) = IntCounter::new(name.to_string(), help.to_string()) {
        counter.inc_by(value);
        let _ = registry.register(Box::new(counter));
    }
}

fn int_gauge(registry: &Registry, name: &str, help: &str, value: i64) {
    if let Ok(gauge) = IntGauge::new(name.to_string(), help.to_string()) {
        gauge.set(value);
        let _ = registry.register(Box::new(gauge));
    }
}

fn gauge(registry: &Registry, name: &str, help: &str, value: f64) {
    if let Ok(gauge) = Gauge::new(name.to_string(), help.to_string()) {
        gauge.set(value);
        let _ = registry.register(Box::new(gauge));
    }
}

/// Serialize a snapshot in the Prometheus text exposition format.
pub fn render_exposition(snapshot: &MetricsSnapshot) -> String {
    let registry = Registry::new();

    let queue = &snapshot.queue;
    int_gauge(
        &registry,
        "logwire_queue_depth",
        "Current delivery queue depth",
        queue.depth as i64,
    );
    int_gauge(
        &registry,
        "logwire_queue_peak_depth",
        "Highest observed delivery queue depth",
        queue.peak_depth as i64,
    );
    int_counter(
        &registry,
        "logwire_queue_enqueued_total",
        "Events accepted into the queue",
        queue.enqueued,
    );
    int_counter(
        &registry,
        "logwire_queue_dequeued_total",
        "Events pulled by the worker",
        queue.dequeued,
    );
    int_counter(
        &registry,
        "logwire_queue_dropped_total",
        "Events refused at the queue boundary",
        queue.dropped,
    );
    int_counter(
        &registry,
        "logwire_queue_sampled_total",
        "Events rejected by sampling",
        queue.sampled,
    );
    int_counter(
        &registry,
        "logwire_events_processed_total",
        "Events delivered to every sink",
        queue.processed,
    );
    int_counter(
        &registry,
        "logwire_events_failed_total",
        "Events given up on after retries",
        queue.failed,
    );
    gauge(
        &registry,
        "logwire_queue_enqueue_latency_ms",
        "Moving-average enqueue latency",
        queue.avg_enqueue_latency_ms,
    );
    gauge(
        &registry,
        "logwire_queue_dequeue_latency_ms",
        "Moving-average dequeue latency",
        queue.avg_dequeue_latency_ms,
    );
    gauge(
        &registry,
        "logwire_queue_batch_processing_ms",
        "Moving-average batch processing duration",
        queue.avg_batch_processing_ms,
    );

    if !snapshot.sinks.is_empty() {
        let writes = IntCounterVec::new(
            Opts::new("logwire_sink_writes_total", "Writes attempted per sink"),
            &["sink"],
        );
        let successes = IntCounterVec::new(
            Opts::new("logwire_sink_successes_total", "Successful writes per sink"),
            &["sink"],
        );
        let failures = IntCounterVec::new(
            Opts::new("logwire_sink_failures_total", "Failed writes per sink"),
            &["sink"],
        );
        let retries = IntCounterVec::new(
            Opts::new("logwire_sink_retries_total", "Write retries per sink"),
            &["sink"],
        );
        let latency = GaugeVec::new(
            Opts::new(
                "logwire_sink_write_latency_ms",
                "Moving-average write latency per sink",
            ),
            &["sink"],
        );
        let batch_size = GaugeVec::new(
            Opts::new(
                "logwire_sink_batch_size",
                "Moving-average worker batch size per sink",
            ),
            &["sink"],
        );
        if let (Ok(writes), Ok(successes), Ok(failures), Ok(retries), Ok(latency), Ok(batch_size)) =
            (writes, successes, failures, retries, latency, batch_size)
        {
            for (name, stats) in &snapshot.sinks {
                writes.with_label_values(&[name]).inc_by(stats.writes);
                successes.with_label_values(&[name]).inc_by(stats.successes);
                failures.with_label_values(&[name]).inc_by(stats.failures);
                retries.with_label_values(&[name]).inc_by(stats.retries);
                latency
                    .with_label_values(&[name])
                    .set(stats.avg_write_latency_ms);
                batch_size
                    .with_label_values(&[name])
                    .set(stats.avg_batch_size);
            }
            let _ = registry.register(Box::new(writes));
            let _ = registry.register(Box::new(successes));
            let _ = registry.register(Box::new(failures));
            let _ = registry.register(Box::new(retries));
            let _ = registry.register(Box::new(latency));
            let _ = registry.register(Box::new(batch_size));
        }
    }

    if !snapshot.processors.is_empty() {
        let executions = IntCounterVec::new(
            Opts::new(
                "logwire_processor_executions_total",
                "Chain executions per processor",
            ),
            &["processor"],
        );
        let failures = IntCounterVec::new(
            Opts::new(
                "logwire_processor_failures_total",
                "Failed executions per processor",
            ),
            &["processor"],
        );
        let bytes = IntCounterVec::new(
            Opts::new(
                "logwire_processor_bytes_total",
                "Serialized event bytes seen per processor",
            ),
            &["processor"],
        );
        if let (Ok(executions), Ok(failures), Ok(bytes)) = (executions, failures, bytes) {
            for (name, stats) in &snapshot.processors {
                executions
                    .with_label_values(&[name])
                    .inc_by(stats.executions);
                failures.with_label_values(&[name]).inc_by(stats.failures);
                bytes
                    .with_label_values(&[name])
                    .inc_by(stats.bytes_processed);
            }
            let _ = registry.register(Box::new(executions));
            let _ = registry.register(Box::new(failures));
            let _ = registry.register(Box::new(bytes));
        }
    }

    if let Some(system) = &snapshot.system {
        int_gauge(
            &registry,
            "logwire_process_memory_bytes",
            "Resident memory of this process",
            system.memory_bytes as i64,
        );
        gauge(
            &registry,
            "logwire_process_cpu_percent",
            "CPU usage of this process",
            system.cpu_percent,
        );
    }

    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    if let Err(e) = encoder.encode(&registry.gather(), &mut buffer) {
        tracing::warn!("failed to encode metrics exposition: {e}");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

/// The embedded scrape endpoint. Owned by the container: built at configure
/// time, bound and spawned in `setup`, stopped during shutdown.
pub struct PrometheusExporter {
    host: String,
    port: u16,
    metrics: Arc<MetricsCollector>,
    server: Mutex<Option<Box<dyn SpawnHandle>>>,
    bound_addr: Mutex<Option<SocketAddr>>,
}

impl PrometheusExporter {
    pub fn new(host: String, port: u16, metrics: Arc<MetricsCollector>) -> Self {
        Self {
            host,
            port,
            metrics,
            server: Mutex::new(None),
            bound_addr: Mutex::new(None),
        }
    }

    pub async fn start<RT: Runtime>(&self, rt: &RT) -> anyhow::Result<()> {
        if self.server.lock().is_some() {
            return Ok(());
        }
        let listener =
            tokio::net::TcpListener::bind((self.host.as_str(), self.port)).await?;
        let local_addr = listener.local_addr()?;
        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/health", get(health_handler))
            .with_state(self.metrics.clone());
        let handle = rt.spawn("prometheus_exporter", async move {
            if let Err(e) = axum::serve(listener, app).await {
                tracing::error!("prometheus exporter exited: {e}");
            }
        });
        *self.bound_addr.lock() = Some(local_addr);
        *self.server.lock() = Some(handle);
        tracing::info!("prometheus exporter listening on {local_addr}");
        Ok(())
    }

    /// Address actually bound, once started. Useful with port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.bound_addr.lock()
    }

    pub async fn stop(&self) {
        if let Some(mut handle) = self.server.lock().take() {
            handle.shutdown();
        }
        *self.bound_addr.lock() = None;
    }
}

async fn metrics_handler(State(metrics): State<Arc<MetricsCollector>>) -> impl IntoResponse {
    let snapshot = metrics.snapshot_with_system(true);
    (
        [(
            http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        render_exposition(&snapshot),
    )
}

async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "healthy" }))
}
