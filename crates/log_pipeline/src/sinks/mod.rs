//! The sink contract and construction. A sink accepts one event at a time,
//! closes idempotently within the drain deadline, and reports failures as
//! typed `SinkError`s. Construction resolves URIs through a typed builder
//! registry: known schemes build the in-tree sinks, custom schemes resolve
//! through user registrations, and anything else is a configuration error
//! naming every scheme we do know.

use std::{
    collections::HashMap,
    sync::Arc,
};

use async_trait::async_trait;
use common::{
    errors::{
        ConfigurationError,
        SinkError,
    },
    runtime::Runtime,
    LogEvent,
};
use futures::FutureExt;
use parking_lot::Mutex;

use crate::{
    batch::{
        BatchConfig,
        BatchManager,
    },
    config::{
        uri::validate_scheme,
        QueueSettings,
        SinkUri,
    },
    processors::render::RenderMode,
    retry::retry_with_base_delay,
};

pub mod file;
pub mod http;
pub mod loki;
#[cfg(any(test, feature = "testing"))]
pub mod recording;
pub mod stdout;

pub use file::FileSink;
pub use http::{
    HttpPoster,
    ReqwestPoster,
};
pub use loki::LokiSink;
pub use stdout::StdoutSink;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkLifecycle {
    New,
    Started,
    Stopped,
}

/// How a sink wants batching handled: not at all, internally (it owns its
/// own batch manager), or wrapped by the pipeline's batch manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchingMode {
    None,
    Internal,
    Wrapped(BatchConfig),
}

#[async_trait]
pub trait LogSink: Send + Sync {
    /// Stable short identifier, used as a metrics label.
    fn name(&self) -> &str;

    fn batching(&self) -> BatchingMode {
        BatchingMode::None
    }

    async fn start(&self) -> Result<(), SinkError> {
        Ok(())
    }

    async fn write(&self, event: &Arc<LogEvent>) -> Result<(), SinkError>;

    /// Idempotent; must complete within the drain deadline during shutdown.
    async fn close(&self) -> Result<(), SinkError>;
}

/// One delivery target as the worker sees it: the sink plus its lifecycle
/// state. Write stats live in the metrics collector under the sink's name.
pub struct SinkRecord {
    pub sink: Arc<dyn LogSink>,
    lifecycle: Mutex<SinkLifecycle>,
}

impl std::fmt::Debug for SinkRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SinkRecord")
            .field("sink", &self.sink.name())
            .field("lifecycle", &self.lifecycle)
            .finish()
    }
}

impl SinkRecord {
    pub fn new(sink: Arc<dyn LogSink>) -> Arc<Self> {
        Arc::new(Self {
            sink,
            lifecycle: Mutex::new(SinkLifecycle::New),
        })
    }

    pub fn name(&self) -> &str {
        self.sink.name()
    }

    pub fn lifecycle(&self) -> SinkLifecycle {
        *self.lifecycle.lock()
    }

    pub async fn start(&self) -> Result<(), SinkError> {
        if *self.lifecycle.lock() == SinkLifecycle::Started {
            return Ok(());
        }
        self.sink.start().await?;
        *self.lifecycle.lock() = SinkLifecycle::Started;
        Ok(())
    }

    pub async fn close(&self) -> Result<(), SinkError> {
        if *self.lifecycle.lock() == SinkLifecycle::Stopped {
            return Ok(());
        }
        let result = self.sink.close().await;
        *self.lifecycle.lock() = SinkLifecycle::Stopped;
        result
    }
}

pub type SinkBuilder<RT> = Arc<
    dyn Fn(&SinkUri, &SinkBuildContext<RT>) -> Result<Arc<dyn LogSink>, ConfigurationError>
        + Send
        + Sync,
>;

/// Everything a builder might need to assemble a sink.
pub struct SinkBuildContext<RT: Runtime> {
    pub rt: RT,
    pub poster: Arc<dyn HttpPoster>,
    pub console_format: RenderMode,
    pub queue: QueueSettings,
}

/// Scheme-keyed registry of custom sink builders. Built-in schemes are
/// resolved first and cannot be shadowed.
pub struct SinkRegistry<RT: Runtime> {
    builders: Mutex<HashMap<String, SinkBuilder<RT>>>,
}

const BUILTIN_SCHEMES: &[&str] = &["stdout", "file", "loki", "https"];

impl<RT: Runtime> SinkRegistry<RT> {
    pub fn new() -> Self {
        Self {
            builders: Mutex::new(HashMap::new()),
        }
    }

    pub fn register(
        &self,
        scheme: &str,
        builder: SinkBuilder<RT>,
    ) -> Result<(), ConfigurationError> {
        if !validate_scheme(scheme) {
            return Err(ConfigurationError::new(
                "sinks",
                scheme,
                "a scheme of letters, digits, `+`, `-`, `.` starting with a letter",
            ));
        }
        if BUILTIN_SCHEMES.contains(&scheme) {
            return Err(ConfigurationError::new(
                "sinks",
                scheme,
                "a scheme that does not shadow a built-in sink",
            ));
        }
        self.builders
            .lock()
            .insert(scheme.to_ascii_lowercase(), builder);
        Ok(())
    }

    fn get(&self, scheme: &str) -> Option<SinkBuilder<RT>> {
        self.builders.lock().get(scheme).cloned()
    }

    pub fn known_schemes(&self) -> Vec<String> {
        let mut schemes: Vec<String> = BUILTIN_SCHEMES.iter().map(|s| s.to_string()).collect();
        schemes.extend(self.builders.lock().keys().cloned());
        schemes.sort();
        schemes
    }
}

/// Build the ordered sink list from settings. Wrap-requesting sinks come
/// back wrapped in the pipeline batch manager.
pub fn build_sinks<RT: Runtime>(
    sink_uris: &[String],
    registry: &SinkRegistry<RT>,
    ctx: &SinkBuildContext<RT>,
) -> Result<Vec<Arc<SinkRecord>>, ConfigurationError> {
    let mut records = Vec::with_capacity(sink_uris.len());
    for raw in sink_uris {
        let uri = SinkUri::parse(raw)?;
        let sink: Arc<dyn LogSink> = match uri.scheme.as_str() {
            "stdout" => Arc::new(StdoutSink::new(ctx.rt.clone(), ctx.console_format)),
            "file" => Arc::new(FileSink::from_uri(ctx.rt.clone(), &uri)?),
            // `https` reaches the aggregator only when the netloc says so;
            // other https URIs fall through to the custom registry.
            "loki" => build_loki(&uri, ctx)?,
            "https" if uri.host.as_deref().is_some_and(|h| h.contains("loki")) => {
                build_loki(&uri, ctx)?
            },
            scheme => match registry.get(scheme) {
                Some(builder) => builder(&uri, ctx)?,
                None => {
                    return Err(ConfigurationError::new(
                        "sinks",
                        raw,
                        format!(
                            "a URI with a known sink scheme (one of: {})",
                            registry.known_schemes().join(", "),
                        ),
                    ));
                },
            },
        };
        let sink = match sink.batching() {
            BatchingMode::Wrapped(config) => {
                Arc::new(BatchedSink::new(&ctx.rt, sink, config, &ctx.queue)) as Arc<dyn LogSink>
            },
            BatchingMode::None | BatchingMode::Internal => sink,
        };
        records.push(SinkRecord::new(sink));
    }
    Ok(records)
}

fn build_loki<RT: Runtime>(
    uri: &SinkUri,
    ctx: &SinkBuildContext<RT>,
) -> Result<Arc<dyn LogSink>, ConfigurationError> {
    let config =
        loki::LokiConfig::from_uri(uri, ctx.queue.max_retries, ctx.queue.retry_delay())?;
    Ok(Arc::new(LokiSink::new(
        ctx.rt.clone(),
        config,
        ctx.poster.clone(),
    )))
}

/// Adapter that gives any sink size/interval batching via the batch
/// manager; the flush function is the retry-wrapped inner write.
pub struct BatchedSink {
    inner: Arc<dyn LogSink>,
    batch: Arc<BatchManager>,
}

impl BatchedSink {
    pub fn new<RT: Runtime>(
        rt: &RT,
        inner: Arc<dyn LogSink>,
        config: BatchConfig,
        queue: &QueueSettings,
    ) -> Self {
        let flush_target = inner.clone();
        let flush_rt = rt.clone();
        let max_retries = queue.max_retries;
        let retry_delay = queue.retry_delay();
        let batch = BatchManager::new(rt, config, {
            Arc::new(move |events: Vec<Arc<LogEvent>>| {
                let sink = flush_target.clone();
                let rt = flush_rt.clone();
                async move {
                    retry_with_base_delay(
                        &rt,
                        || {
                            let sink = sink.clone();
                            let events = events.clone();
                            async move {
                                for event in &events {
                                    sink.write(event).await?;
                                }
                                Ok(())
                            }
                        },
                        max_retries,
                        retry_delay,
                    )
                    .await
                }
                .boxed()
            })
        });
        Self { inner, batch }
    }
}

#[async_trait]
impl LogSink for BatchedSink {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn batching(&self) -> BatchingMode {
        BatchingMode::Internal
    }

    async fn write(&self, event: &Arc<LogEvent>) -> Result<(), SinkError> {
        self.batch.add(event.clone()).await;
        Ok(())
    }

    async fn close(&self) -> Result<(), SinkError> {
        self.batch.close().await;
        self.inner.close().await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use common::runtime::testing::TestRuntime;

    use super::{
        build_sinks,
        http::testing::StaticHttpPoster,
        SinkBuildContext,
        SinkRegistry,
    };
    use crate::{
        config::QueueSettings,
        processors::render::RenderMode,
        sinks::recording::RecordingSink,
    };

    fn build_ctx(rt: TestRuntime) -> SinkBuildContext<TestRuntime> {
        SinkBuildContext {
            rt,
            poster: Arc::new(StaticHttpPoster::new()),
            console_format: RenderMode::Json,
            queue: QueueSettings::default(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_builds_known_schemes() {
        let rt = TestRuntime::new();
        let ctx = build_ctx(rt.clone());
        let registry = SinkRegistry::new();
        let records = build_sinks(
            &[
                "stdout".to_string(),
                "loki://loki.internal:3100".to_string(),
            ],
            &registry,
            &ctx,
        )
        .unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].name(), "stdout");
        assert_eq!(records[1].name(), "loki");
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_scheme_lists_known_ones() {
        let rt = TestRuntime::new();
        let ctx = build_ctx(rt.clone());
        let registry: SinkRegistry<TestRuntime> = SinkRegistry::new();
        let err = build_sinks(&["mystery://x".to_string()], &registry, &ctx).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("stdout"));
        assert!(message.contains("loki"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_custom_scheme_resolves_through_registry() {
        let rt = TestRuntime::new();
        let ctx = build_ctx(rt.clone());
        let registry: SinkRegistry<TestRuntime> = SinkRegistry::new();
        registry
            .register(
                "capture",
                Arc::new(|_, ctx| {
                    let sink: Arc<dyn super::LogSink> = RecordingSink::new(ctx.rt.clone(), "capture");
                    Ok(sink)
                }),
            )
            .unwrap();
        let records = build_sinks(&["capture://anything".to_string()], &registry, &ctx).unwrap();
        assert_eq!(records[0].name(), "capture");
    }

    #[tokio::test(start_paused = true)]
    async fn test_registry_rejects_builtin_shadowing() {
        let rt = TestRuntime::new();
        let registry: SinkRegistry<TestRuntime> = SinkRegistry::new();
        let _ = rt;
        assert!(registry
            .register(
                "stdout",
                Arc::new(|_, ctx| {
                    let sink: Arc<dyn super::LogSink> = RecordingSink::new(ctx.rt.clone(), "x");
                    Ok(sink)
                }),
            )
            .is_err());
    }
}
