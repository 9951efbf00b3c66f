//! Enrichers add fields and never drop. Failures stay local: a sampling
//! error omits the field, a panicking custom enricher is logged at debug and
//! the event is untouched.

use std::{
    panic::{
        catch_unwind,
        AssertUnwindSafe,
    },
    sync::{
        Arc,
        LazyLock,
    },
};

use async_trait::async_trait;
use common::{
    context::ContextCarrier,
    errors::ProcessorError,
    event::reserved,
    LogEvent,
};
use parking_lot::Mutex;

use super::{
    Processor,
    ProcessorOutcome,
};

static HOSTNAME: LazyLock<String> =
    LazyLock::new(|| gethostname::gethostname().to_string_lossy().into_owned());
static PID: LazyLock<u32> = LazyLock::new(std::process::id);

/// Adds `hostname` and `pid` if absent. Both are immutable for the life of
/// the process, so they are sampled exactly once.
pub struct HostProcessEnricher;

#[async_trait]
impl Processor for HostProcessEnricher {
    fn name(&self) -> &'static str {
        "host_process_enricher"
    }

    async fn process(&self, event: &mut LogEvent) -> Result<ProcessorOutcome, ProcessorError> {
        if !event.contains_key(reserved::HOSTNAME) {
            event.insert(reserved::HOSTNAME, HOSTNAME.clone());
        }
        if !event.contains_key(reserved::PID) {
            event.insert(reserved::PID, *PID);
        }
        Ok(ProcessorOutcome::Continue)
    }
}

/// Adds `memory_mb` and `cpu_percent` (two decimals) if absent. If sampling
/// fails the fields are silently omitted.
pub struct ResourceSnapshotEnricher {
    system: Mutex<sysinfo::System>,
}

impl ResourceSnapshotEnricher {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(sysinfo::System::new()),
        }
    }

    fn sample(&self) -> Option<(f64, f64)> {
        let pid = sysinfo::get_current_pid().ok()?;
        let mut system = self.system.lock();
        system.refresh_processes(sysinfo::ProcessesToUpdate::Some(&[pid]), true);
        let process = system.process(pid)?;
        let memory_mb = process.memory() as f64 / (1024.0 * 1024.0);
        let cpu_percent = f64::from(process.cpu_usage());
        Some((round2(memory_mb), round2(cpu_percent)))
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[async_trait]
impl Processor for ResourceSnapshotEnricher {
    fn name(&self) -> &'static str {
        "resource_snapshot_enricher"
    }

    async fn process(&self, event: &mut LogEvent) -> Result<ProcessorOutcome, ProcessorError> {
        if event.contains_key("memory_mb") && event.contains_key("cpu_percent") {
            return Ok(ProcessorOutcome::Continue);
        }
        if let Some((memory_mb, cpu_percent)) = self.sample() {
            if !event.contains_key("memory_mb") {
                event.insert("memory_mb", memory_mb);
            }
            if !event.contains_key("cpu_percent") {
                event.insert("cpu_percent", cpu_percent);
            }
        }
        Ok(ProcessorOutcome::Continue)
    }
}

/// Copies non-null scalars from the context carrier's snapshot into the
/// event. Caller-supplied values win over ambient context.
pub struct RequestMetadataEnricher {
    carrier: ContextCarrier,
}

impl RequestMetadataEnricher {
    pub fn new(carrier: ContextCarrier) -> Self {
        Self { carrier }
    }
}

#[async_trait]
impl Processor for RequestMetadataEnricher {
    fn name(&self) -> &'static str {
        "request_metadata_enricher"
    }

    async fn process(&self, event: &mut LogEvent) -> Result<ProcessorOutcome, ProcessorError> {
        for (key, value) in self.carrier.snapshot() {
            if value.is_scalar() && !event.contains_key(&key) {
                event.insert(key, value);
            }
        }
        Ok(ProcessorOutcome::Continue)
    }
}

pub type EnricherFn = Arc<dyn Fn(&mut LogEvent) + Send + Sync>;

/// User-registered enrichment functions, run in registration order after the
/// built-ins. A panic leaves the event exactly as it was.
pub struct CustomEnrichers {
    enrichers: Vec<(String, EnricherFn)>,
}

impl CustomEnrichers {
    pub fn new(enrichers: Vec<(String, EnricherFn)>) -> Self {
        Self { enrichers }
    }
}

#[async_trait]
impl Processor for CustomEnrichers {
    fn name(&self) -> &'static str {
        "custom_enrichers"
    }

    async fn process(&self, event: &mut LogEvent) -> Result<ProcessorOutcome, ProcessorError> {
        for (name, enricher) in &self.enrichers {
            let mut scratch = event.clone();
            match catch_unwind(AssertUnwindSafe(|| enricher(&mut scratch))) {
                Ok(()) => *event = scratch,
                Err(_) => {
                    tracing::debug!("custom enricher `{name}` panicked; event unchanged");
                },
            }
        }
        Ok(ProcessorOutcome::Continue)
    }
}
