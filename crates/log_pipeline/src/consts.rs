use std::time::Duration;

// Delivery queue
pub const DEFAULT_QUEUE_MAXSIZE: usize = 1000;
pub const DEFAULT_BATCH_SIZE: usize = 10;
pub const DEFAULT_BATCH_TIMEOUT: Duration = Duration::from_secs(1);
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);
pub const DEFAULT_MAX_RETRIES: u32 = 3;
/// Cap on a single retry sleep regardless of attempt count.
pub const RETRY_MAX_DELAY: Duration = Duration::from_secs(60);
/// Budget for draining in-flight events at shutdown. Events still queued
/// past the deadline are counted as failures.
pub const SHUTDOWN_DRAIN_DEADLINE: Duration = Duration::from_secs(5);

// Sinks
pub const SINK_CLOSE_DEADLINE: Duration = Duration::from_secs(5);
/// Per-request timeout for HTTP-style sinks.
pub const HTTP_SINK_WRITE_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_FILE_MAX_BYTES: u64 = 10 * 1024 * 1024;
pub const DEFAULT_FILE_BACKUP_COUNT: usize = 5;
pub const DEFAULT_LOKI_BATCH_SIZE: usize = 100;
pub const DEFAULT_LOKI_BATCH_INTERVAL: Duration = Duration::from_secs(2);

// Stateful processors
pub const DEFAULT_THROTTLE_MAX_RATE: usize = 100;
pub const DEFAULT_THROTTLE_WINDOW: Duration = Duration::from_secs(60);
pub const DEFAULT_THROTTLE_KEY_FIELD: &str = "source";
/// Fraction of over-limit events admitted under the `sample` strategy.
pub const THROTTLE_SAMPLE_ADMIT_RATE: f64 = 0.1;
pub const DEFAULT_THROTTLE_KEY_CAP: usize = 1000;
pub const DEFAULT_DEDUPE_WINDOW: Duration = Duration::from_secs(60);
pub const DEFAULT_DEDUPE_MAX_CACHE_SIZE: usize = 10_000;
/// Cache utilization above which a background sweep is scheduled.
pub const SWEEP_UTILIZATION_THRESHOLD: f64 = 0.8;

// Metrics
pub const DEFAULT_METRICS_SAMPLE_WINDOW: usize = 100;
pub const DEFAULT_PROMETHEUS_HOST: &str = "127.0.0.1";
pub const DEFAULT_PROMETHEUS_PORT: u16 = 8000;
