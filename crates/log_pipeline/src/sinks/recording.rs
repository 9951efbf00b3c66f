//! Test sink that records every delivered event, with optional injected
//! latency and failures.

use std::{
    sync::{
        atomic::{
            AtomicUsize,
            Ordering,
        },
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use common::{
    errors::{
        SinkError,
        SinkErrorKind,
    },
    runtime::Runtime,
    LogEvent,
};
use parking_lot::RwLock;

use super::LogSink;

pub struct RecordingSink<RT: Runtime> {
    rt: RT,
    name: String,
    events: Arc<RwLock<Vec<Arc<LogEvent>>>>,
    write_delay: Option<Duration>,
    fail_next_writes: AtomicUsize,
    close_calls: AtomicUsize,
}

impl<RT: Runtime> RecordingSink<RT> {
    pub fn new(rt: RT, name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            rt,
            name: name.into(),
            events: Arc::new(RwLock::new(Vec::new())),
            write_delay: None,
            fail_next_writes: AtomicUsize::new(0),
            close_calls: AtomicUsize::new(0),
        })
    }

    /// A sink that sleeps on every write, for backpressure tests.
    pub fn slow(rt: RT, name: impl Into<String>, write_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            rt,
            name: name.into(),
            events: Arc::new(RwLock::new(Vec::new())),
            write_delay: Some(write_delay),
            fail_next_writes: AtomicUsize::new(0),
            close_calls: AtomicUsize::new(0),
        })
    }

    /// Make the next `count` writes fail with a retryable error.
    pub fn fail_next_writes(&self, count: usize) {
        self.fail_next_writes.store(count, Ordering::SeqCst);
    }

    pub fn events(&self) -> Vec<Arc<LogEvent>> {
        self.events.read().clone()
    }

    pub fn messages(&self) -> Vec<String> {
        self.events.read().iter().map(|e| e.message.clone()).collect()
    }

    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<RT: Runtime> LogSink for RecordingSink<RT> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn write(&self, event: &Arc<LogEvent>) -> Result<(), SinkError> {
        if let Some(delay) = self.write_delay {
            self.rt.wait(delay).await;
        }
        let remaining = self
            .fail_next_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if remaining {
            return Err(SinkError::new(
                SinkErrorKind::Connection,
                self.name.clone(),
                "write",
                self.rt.utc_now(),
            )
            .with_event(event));
        }
        self.events.write().push(event.clone());
        Ok(())
    }

    async fn close(&self) -> Result<(), SinkError> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
