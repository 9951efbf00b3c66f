//! The producer façade. A `Logger` is cheap to clone and bound to one
//! container: it filters on level, runs the chain, and hands the result to
//! the delivery queue (or writes sinks inline when the queue is disabled).
//! Nothing here ever raises toward the caller; the return value says whether
//! the event was accepted.

use std::sync::Arc;

use common::{
    runtime::Runtime,
    EventValue,
    Level,
    LogEvent,
};

use crate::{
    metrics::MetricsCollector,
    processors::ProcessorChain,
    queue::DeliveryQueue,
    sinks::SinkRecord,
};

pub(crate) enum Dispatch<RT: Runtime> {
    Queue(Arc<DeliveryQueue<RT>>),
    Sync(Vec<Arc<SinkRecord>>),
}

struct LoggerInner<RT: Runtime> {
    rt: RT,
    min_level: Level,
    chain: Arc<ProcessorChain>,
    dispatch: Dispatch<RT>,
    metrics: Arc<MetricsCollector>,
}

pub struct Logger<RT: Runtime> {
    inner: Arc<LoggerInner<RT>>,
}

impl<RT: Runtime> std::fmt::Debug for Logger<RT> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Logger").finish_non_exhaustive()
    }
}

impl<RT: Runtime> Clone for Logger<RT> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<RT: Runtime> Logger<RT> {
    pub(crate) fn new(
        rt: RT,
        min_level: Level,
        chain: Arc<ProcessorChain>,
        dispatch: Dispatch<RT>,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            inner: Arc::new(LoggerInner {
                rt,
                min_level,
                chain,
                dispatch,
                metrics,
            }),
        }
    }

    pub fn min_level(&self) -> Level {
        self.inner.min_level
    }

    /// Emit one event. Below-threshold events never enter the chain.
    pub async fn log(
        &self,
        level: Level,
        message: impl Into<String>,
        fields: impl IntoIterator<Item = (String, EventValue)>,
    ) -> bool {
        if level < self.inner.min_level {
            return false;
        }
        let mut event = LogEvent::new(self.inner.rt.utc_now(), level, message);
        for (key, value) in fields {
            event.insert(key, value);
        }

        let Some(event) = self.inner.chain.run(event).await else {
            return false;
        };

        match &self.inner.dispatch {
            Dispatch::Queue(queue) => queue.enqueue(Arc::new(event)).await,
            Dispatch::Sync(sinks) => {
                let event = Arc::new(event);
                let mut delivered = true;
                for record in sinks {
                    let started = self.inner.rt.monotonic_now();
                    let result = record.sink.write(&event).await;
                    self.inner.metrics.record_sink_write(
                        record.name(),
                        started.elapsed(),
                        result.is_ok(),
                    );
                    if let Err(e) = result {
                        self.inner.metrics.record_sink_error(
                            record.name(),
                            e.to_string(),
                            self.inner.rt.utc_now(),
                        );
                        tracing::warn!("synchronous sink write failed: {e}");
                        delivered = false;
                    }
                }
                delivered
            },
        }
    }

    /// Emit from a non-async call site. Must not be invoked from inside the
    /// async runtime; producers already in a task should use `log`.
    pub fn log_blocking(
        &self,
        level: Level,
        message: impl Into<String>,
        fields: impl IntoIterator<Item = (String, EventValue)>,
    ) -> bool {
        futures::executor::block_on(self.log(level, message, fields))
    }

    pub async fn debug(
        &self,
        message: impl Into<String>,
        fields: impl IntoIterator<Item = (String, EventValue)>,
    ) -> bool {
        self.log(Level::Debug, message, fields).await
    }

    pub async fn info(
        &self,
        message: impl Into<String>,
        fields: impl IntoIterator<Item = (String, EventValue)>,
    ) -> bool {
        self.log(Level::Info, message, fields).await
    }

    pub async fn warn(
        &self,
        message: impl Into<String>,
        fields: impl IntoIterator<Item = (String, EventValue)>,
    ) -> bool {
        self.log(Level::Warn, message, fields).await
    }

    pub async fn error(
        &self,
        message: impl Into<String>,
        fields: impl IntoIterator<Item = (String, EventValue)>,
    ) -> bool {
        self.log(Level::Error, message, fields).await
    }

    pub async fn critical(
        &self,
        message: impl Into<String>,
        fields: impl IntoIterator<Item = (String, EventValue)>,
    ) -> bool {
        self.log(Level::Critical, message, fields).await
    }
}

/// Empty field set for message-only call sites.
pub fn no_fields() -> impl IntoIterator<Item = (String, EventValue)> {
    std::iter::empty()
}
