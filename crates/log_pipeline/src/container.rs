//! The lifecycle root. A container owns every pipeline component (context
//! carrier, chain, queue, worker, sinks, metrics, registry) and nothing it
//! owns is shared with any other container. Callers construct a container,
//! `configure` it for a bound logger, optionally `setup` async components,
//! and `shutdown` when done. All transitions are explicit and idempotent.

use std::{
    io::IsTerminal,
    sync::Arc,
    time::Duration,
};

use async_cache::LockRegistry;
use common::{
    context::ContextCarrier,
    errors::ConfigurationError,
    runtime::{
        with_timeout,
        Runtime,
        SpawnHandle,
    },
};
use futures::FutureExt;
use parking_lot::Mutex;

use crate::{
    config::{
        ConsoleFormat,
        Settings,
        ValidationModeSetting,
    },
    consts,
    exporter::PrometheusExporter,
    logger::{
        Dispatch,
        Logger,
    },
    metrics::MetricsCollector,
    processors::{
        dedupe::DedupeProcessor,
        enrich::{
            CustomEnrichers,
            EnricherFn,
            HostProcessEnricher,
            RequestMetadataEnricher,
            ResourceSnapshotEnricher,
        },
        redact::RedactionProcessor,
        render::RenderMode,
        sample::SamplerProcessor,
        throttle::ThrottleProcessor,
        validate::{
            FieldType,
            ValidationMode,
            ValidationProcessor,
        },
        Processor,
        ProcessorChain,
    },
    queue::{
        DeliveryQueue,
        QueueCounters,
        QueueWorker,
    },
    registry::ComponentRegistry,
    sinks::{
        build_sinks,
        HttpPoster,
        ReqwestPoster,
        SinkBuildContext,
        SinkRecord,
        SinkRegistry,
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ContainerState {
    New,
    Configured,
    Setup,
    Stopped,
}

struct RuntimeParts<RT: Runtime> {
    logger: Logger<RT>,
    metrics: Arc<MetricsCollector>,
    sinks: Vec<Arc<SinkRecord>>,
    queue: Option<Arc<DeliveryQueue<RT>>>,
    worker: Option<Box<dyn SpawnHandle>>,
    exporter: Option<Arc<PrometheusExporter>>,
    drain_budget: Duration,
}

pub struct Container<RT: Runtime> {
    rt: RT,
    carrier: ContextCarrier,
    state: Mutex<ContainerState>,
    registry: ComponentRegistry,
    sink_registry: SinkRegistry<RT>,
    custom_enrichers: Mutex<Vec<(String, EnricherFn)>>,
    poster_override: Mutex<Option<Arc<dyn HttpPoster>>>,
    parts: Mutex<Option<RuntimeParts<RT>>>,
}

impl<RT: Runtime> Container<RT> {
    pub fn new(rt: RT) -> Arc<Self> {
        Arc::new(Self {
            rt,
            carrier: ContextCarrier::new(),
            state: Mutex::new(ContainerState::New),
            registry: ComponentRegistry::new(),
            sink_registry: SinkRegistry::new(),
            custom_enrichers: Mutex::new(Vec::new()),
            poster_override: Mutex::new(None),
            parts: Mutex::new(None),
        })
    }

    pub fn state(&self) -> ContainerState {
        *self.state.lock()
    }

    /// The context carrier scoped to this container. Middleware binds
    /// request frames here; enrichers read them back.
    pub fn context(&self) -> &ContextCarrier {
        &self.carrier
    }

    /// Custom sink schemes must be registered before `configure`.
    pub fn sink_registry(&self) -> &SinkRegistry<RT> {
        &self.sink_registry
    }

    /// Register an enrichment function, appended after the built-ins in
    /// registration order. Takes effect at `configure`.
    pub fn register_enricher(
        &self,
        name: impl Into<String>,
        enricher: EnricherFn,
    ) -> Result<(), ConfigurationError> {
        if self.state() != ContainerState::New {
            return Err(ConfigurationError::new(
                "enrichers",
                name.into(),
                "registration before configure()",
            ));
        }
        self.custom_enrichers.lock().push((name.into(), enricher));
        Ok(())
    }

    /// Swap the HTTP layer under push sinks (tests).
    pub fn set_http_poster(&self, poster: Arc<dyn HttpPoster>) {
        *self.poster_override.lock() = Some(poster);
    }

    /// Outbound trace headers for HTTP clients, read from the current
    /// context frame.
    pub fn trace_headers(&self) -> http::HeaderMap {
        crate::outbound::trace_headers(&self.carrier)
    }

    /// Validate settings, build the pipeline, start the worker, and return a
    /// bound logger. Idempotent: a second call returns the logger from the
    /// first.
    pub async fn configure(
        &self,
        settings: Option<Settings>,
    ) -> Result<Logger<RT>, ConfigurationError> {
        {
            let state = self.state.lock();
            match *state {
                ContainerState::New => {},
                ContainerState::Configured | ContainerState::Setup => {
                    drop(state);
                    if let Some(parts) = self.parts.lock().as_ref() {
                        return Ok(parts.logger.clone());
                    }
                    return Err(ConfigurationError::new(
                        "container",
                        "configured",
                        "a container with built components",
                    ));
                },
                ContainerState::Stopped => {
                    return Err(ConfigurationError::new(
                        "container",
                        "stopped",
                        "configure() before shutdown(), or reset() first",
                    ));
                },
            }
        }

        let settings = match settings {
            Some(settings) => settings,
            None => Settings::from_env()?,
        };
        settings.validate()?;

        let console_format = resolve_console_format(settings.core.json_console);
        let metrics = Arc::new(MetricsCollector::new(
            settings.metrics.enabled,
            settings.metrics.sample_window,
        ));
        let locks = Arc::new(LockRegistry::new());

        let chain = Arc::new(
            self.build_chain(&settings, &metrics, locks.clone())
                .map_err(|e| {
                    ConfigurationError::new("security", e.processor().to_string(), e.to_string())
                })?,
        );

        let poster: Arc<dyn HttpPoster> = self
            .poster_override
            .lock()
            .clone()
            .unwrap_or_else(|| Arc::new(ReqwestPoster::new()));

        let sink_ctx = SinkBuildContext {
            rt: self.rt.clone(),
            poster,
            console_format,
            queue: settings.queue.clone(),
        };
        let sinks = build_sinks(&settings.core.sinks, &self.sink_registry, &sink_ctx)?;
        for record in &sinks {
            let started = with_timeout(
                "sink startup",
                consts::SINK_CLOSE_DEADLINE,
                async { record.start().await.map_err(anyhow::Error::from) },
            )
            .await;
            if let Err(e) = started {
                return Err(ConfigurationError::new(
                    "sinks",
                    record.name().to_string(),
                    format!("a sink that starts cleanly ({e:#})"),
                ));
            }
        }

        let (dispatch, queue, worker) = if settings.queue.enabled {
            let (queue, rx) = DeliveryQueue::new(
                self.rt.clone(),
                &settings.queue,
                settings.core.sampling_rate,
                metrics.clone(),
            );
            let queue = Arc::new(queue);
            let worker = QueueWorker::new(
                self.rt.clone(),
                rx,
                sinks.clone(),
                &settings.queue,
                queue.counters(),
                queue.stop_signal(),
                metrics.clone(),
            )
            .start();
            (Dispatch::Queue(queue.clone()), Some(queue), Some(worker))
        } else {
            (Dispatch::Sync(sinks.clone()), None, None)
        };

        let exporter = if settings.metrics.prometheus_enabled {
            Some(Arc::new(PrometheusExporter::new(
                settings.metrics.prometheus_host.clone(),
                settings.metrics.prometheus_port,
                metrics.clone(),
            )))
        } else {
            None
        };

        let logger = Logger::new(
            self.rt.clone(),
            settings.core.level,
            chain,
            dispatch,
            metrics.clone(),
        );

        self.registry.register(metrics.clone());
        let cleanup_locks = locks.clone();
        self.registry.register_with_cleanup(locks, move || {
            async move {
                cleanup_locks.cleanup_unused().await;
            }
            .boxed()
        });

        let drain_budget =
            consts::SHUTDOWN_DRAIN_DEADLINE + settings.queue.batch_timeout() + Duration::from_secs(1);
        *self.parts.lock() = Some(RuntimeParts {
            logger: logger.clone(),
            metrics,
            sinks,
            queue,
            worker,
            exporter,
            drain_budget,
        });
        *self.state.lock() = ContainerState::Configured;
        tracing::debug!("container configured with {} sink(s)", settings.core.sinks.len());
        Ok(logger)
    }

    fn build_chain(
        &self,
        settings: &Settings,
        metrics: &Arc<MetricsCollector>,
        locks: Arc<LockRegistry>,
    ) -> Result<ProcessorChain, common::errors::ProcessorError> {
        let security = &settings.security;
        let mut processors: Vec<Box<dyn Processor>> = vec![
            Box::new(HostProcessEnricher),
            Box::new(ResourceSnapshotEnricher::new()),
            Box::new(RequestMetadataEnricher::new(self.carrier.clone())),
        ];

        let custom = self.custom_enrichers.lock().clone();
        if !custom.is_empty() {
            processors.push(Box::new(CustomEnrichers::new(custom)));
        }

        if !security.redact_patterns.is_empty() || !security.redact_fields.is_empty() {
            processors.push(Box::new(RedactionProcessor::new(
                &security.redact_patterns,
                security.redact_fields.clone(),
                security.redact_replacement.clone(),
                security.redact_level,
            )?));
        }
        if security.enable_auto_redact_pii {
            processors.push(Box::new(RedactionProcessor::auto_pii(
                security.redact_replacement.clone(),
                security.redact_level,
            )?));
        }

        // With the queue enabled, sampling is applied at the enqueue
        // boundary so rejections count as `sampled`; without it the sampler
        // runs in the chain.
        if !settings.queue.enabled && settings.core.sampling_rate < 1.0 {
            processors.push(Box::new(SamplerProcessor::new(
                self.rt.clone(),
                settings.core.sampling_rate,
            )?));
        }

        if security.enable_throttling {
            processors.push(Box::new(ThrottleProcessor::new(
                self.rt.clone(),
                security.throttle_max_rate,
                Duration::from_secs(security.throttle_window_seconds),
                security.throttle_key_field.clone(),
                security.throttle_strategy,
                consts::DEFAULT_THROTTLE_KEY_CAP,
                locks.clone(),
            )?));
        }
        if security.enable_deduplication {
            processors.push(Box::new(DedupeProcessor::new(
                self.rt.clone(),
                Duration::from_secs(security.dedupe_window_seconds),
                security.dedupe_fields.clone(),
                security.dedupe_max_cache_size,
                security.dedupe_hash_algorithm,
                locks,
            )?));
        }

        if settings.validation.enabled {
            let mut field_types = std::collections::BTreeMap::new();
            for (field, type_name) in &settings.validation.field_types {
                let ty = type_name.parse::<FieldType>().map_err(|_| {
                    common::errors::ProcessorError::configuration(
                        "validation_processor",
                        format!("unknown field type `{type_name}` for `{field}`"),
                    )
                })?;
                field_types.insert(field.clone(), ty);
            }
            let mode = match settings.validation.mode {
                ValidationModeSetting::Strict => ValidationMode::Strict,
                ValidationModeSetting::Lenient => ValidationMode::Lenient,
                ValidationModeSetting::Fix => ValidationMode::Fix,
            };
            processors.push(Box::new(ValidationProcessor::new(
                settings.validation.required_fields.clone(),
                field_types,
                mode,
            )));
        }

        let mut chain = ProcessorChain::new(processors);
        if settings.metrics.enabled {
            chain = chain.with_metrics(metrics.clone());
        }
        Ok(chain)
    }

    /// Start async-lifecycle components (the Prometheus server). Idempotent.
    pub async fn setup(&self) -> anyhow::Result<()> {
        {
            let state = self.state.lock();
            match *state {
                ContainerState::Configured => {},
                ContainerState::Setup => return Ok(()),
                ContainerState::New => anyhow::bail!("setup() requires configure() first"),
                ContainerState::Stopped => anyhow::bail!("container is stopped"),
            }
        }
        let exporter = self
            .parts
            .lock()
            .as_ref()
            .and_then(|parts| parts.exporter.clone());
        if let Some(exporter) = exporter {
            exporter.start(&self.rt).await?;
        }
        *self.state.lock() = ContainerState::Setup;
        Ok(())
    }

    pub fn logger(&self) -> Option<Logger<RT>> {
        self.parts.lock().as_ref().map(|parts| parts.logger.clone())
    }

    pub fn metrics(&self) -> Option<Arc<MetricsCollector>> {
        self.parts.lock().as_ref().map(|parts| parts.metrics.clone())
    }

    pub fn queue_counters(&self) -> Option<Arc<QueueCounters>> {
        self.parts
            .lock()
            .as_ref()
            .and_then(|parts| parts.queue.as_ref().map(|queue| queue.counters()))
    }

    pub fn prometheus_exporter(&self) -> Option<Arc<PrometheusExporter>> {
        self.parts
            .lock()
            .as_ref()
            .and_then(|parts| parts.exporter.clone())
    }

    /// Graceful shutdown: close sinks, clean registry components, stop the
    /// exporter, then stop the worker and let it drain inside its deadline.
    /// Idempotent; after this no further sink write is initiated.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        let Some(parts) = self.parts.lock().take() else {
            *self.state.lock() = ContainerState::Stopped;
            return Ok(());
        };
        *self.state.lock() = ContainerState::Stopped;

        // Refuse producers first so the drain below is bounded.
        if let Some(queue) = &parts.queue {
            queue.mark_stopping();
        }

        for record in &parts.sinks {
            let closed = with_timeout("sink close", consts::SINK_CLOSE_DEADLINE, async {
                record.close().await.map_err(anyhow::Error::from)
            })
            .await;
            if let Err(e) = closed {
                tracing::warn!("sink `{}` failed to close: {e:#}", record.name());
            }
        }

        self.registry.cleanup().await;

        if let Some(exporter) = &parts.exporter {
            exporter.stop().await;
        }

        if let Some(mut worker) = parts.worker {
            let joined =
                tokio::time::timeout(parts.drain_budget, worker.join()).await;
            if joined.is_err() {
                tracing::warn!("worker did not drain inside its budget, canceling");
                worker.shutdown();
                let _ = worker.join().await;
            }
        }

        tracing::debug!("container shut down");
        Ok(())
    }

    /// Best-effort synchronous shutdown: signal the worker and cancel it
    /// rather than blocking the caller on a drain. Intended for process-exit
    /// hooks where no executor is available.
    pub fn shutdown_sync(&self) {
        let Some(mut parts) = self.parts.lock().take() else {
            *self.state.lock() = ContainerState::Stopped;
            return;
        };
        *self.state.lock() = ContainerState::Stopped;
        if let Some(queue) = &parts.queue {
            queue.mark_stopping();
        }
        if let Some(worker) = parts.worker.as_mut() {
            worker.shutdown();
        }
    }

    /// Shutdown and return to the unconfigured state (tests).
    pub async fn reset(&self) -> anyhow::Result<()> {
        self.shutdown().await?;
        *self.state.lock() = ContainerState::New;
        Ok(())
    }
}

fn resolve_console_format(format: ConsoleFormat) -> RenderMode {
    match format {
        ConsoleFormat::Json => RenderMode::Json,
        ConsoleFormat::Pretty => RenderMode::Pretty { color: true },
        ConsoleFormat::Auto => {
            if std::io::stdout().is_terminal() {
                RenderMode::Pretty { color: true }
            } else {
                RenderMode::Json
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::Arc,
        time::Duration,
    };

    use common::{
        runtime::testing::TestRuntime,
        EventValue,
        Level,
    };
    use maplit::btreemap;

    use super::{
        Container,
        ContainerState,
    };
    use crate::{
        config::Settings,
        logger::no_fields,
        sinks::recording::RecordingSink,
    };

    fn recording_settings() -> Settings {
        let mut settings = Settings::default();
        settings.core.sinks = vec!["capture://".to_string()];
        settings
    }

    /// Wire a recording sink through the custom scheme registry so tests can
    /// observe deliveries.
    fn attach_recording_sink(
        container: &Arc<Container<TestRuntime>>,
        rt: &TestRuntime,
    ) -> Arc<RecordingSink<TestRuntime>> {
        let sink = RecordingSink::new(rt.clone(), "capture");
        let registered = sink.clone();
        container
            .sink_registry()
            .register(
                "capture",
                Arc::new(move |_, _| {
                    let sink: Arc<dyn crate::sinks::LogSink> = registered.clone();
                    Ok(sink)
                }),
            )
            .unwrap();
        sink
    }

    #[tokio::test(start_paused = true)]
    async fn test_configure_is_idempotent() -> anyhow::Result<()> {
        let rt = TestRuntime::new();
        let container = Container::new(rt.clone());
        let sink = attach_recording_sink(&container, &rt);
        let logger_a = container.configure(Some(recording_settings())).await?;
        let logger_b = container.configure(None).await?;
        assert_eq!(container.state(), ContainerState::Configured);

        logger_a.info("one", no_fields()).await;
        logger_b.info("two", no_fields()).await;
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(sink.messages(), vec!["one", "two"]);

        container.shutdown().await?;
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_level_filter_applies_before_chain() -> anyhow::Result<()> {
        let rt = TestRuntime::new();
        let container = Container::new(rt.clone());
        let sink = attach_recording_sink(&container, &rt);
        let mut settings = recording_settings();
        settings.core.level = Level::Warn;
        let logger = container.configure(Some(settings)).await?;

        assert!(!logger.info("quiet", no_fields()).await);
        assert!(logger.error("loud", no_fields()).await);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(sink.messages(), vec!["loud"]);

        container.shutdown().await?;
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_new_writes() -> anyhow::Result<()> {
        let rt = TestRuntime::new();
        let container = Container::new(rt.clone());
        let sink = attach_recording_sink(&container, &rt);
        let logger = container.configure(Some(recording_settings())).await?;

        logger.info("before", no_fields()).await;
        tokio::time::sleep(Duration::from_secs(2)).await;
        container.shutdown().await?;
        assert_eq!(container.state(), ContainerState::Stopped);
        assert!(sink.close_calls() >= 1);

        assert!(!logger.info("after", no_fields()).await);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(sink.messages(), vec!["before"]);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_containers_are_isolated() -> anyhow::Result<()> {
        let rt = TestRuntime::new();
        let container_a = Container::new(rt.clone());
        let container_b = Container::new(rt.clone());
        let sink_a = attach_recording_sink(&container_a, &rt);
        let sink_b = attach_recording_sink(&container_b, &rt);

        let mut settings_a = recording_settings();
        settings_a.core.level = Level::Debug;
        let mut settings_b = recording_settings();
        settings_b.core.level = Level::Error;

        let logger_a = container_a.configure(Some(settings_a)).await?;
        let _logger_b = container_b.configure(Some(settings_b)).await?;

        logger_a.info("only for a", no_fields()).await;
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert_eq!(sink_a.messages(), vec!["only for a"]);
        assert!(sink_b.messages().is_empty());

        let metrics_a = container_a.metrics().unwrap().snapshot();
        let metrics_b = container_b.metrics().unwrap().snapshot();
        assert_eq!(metrics_a.queue.enqueued, 1);
        assert_eq!(metrics_b.queue.enqueued, 0);

        container_a.shutdown().await?;
        container_b.shutdown().await?;
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_settings_fail_configure() {
        let rt = TestRuntime::new();
        let container = Container::new(rt);
        let mut settings = Settings::default();
        settings.core.sampling_rate = 2.0;
        let err = container.configure(Some(settings)).await.unwrap_err();
        assert_eq!(err.setting, "core.sampling_rate");
        assert_eq!(container.state(), ContainerState::New);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_allows_reconfigure() -> anyhow::Result<()> {
        let rt = TestRuntime::new();
        let container = Container::new(rt.clone());
        let _sink = attach_recording_sink(&container, &rt);
        container.configure(Some(recording_settings())).await?;
        container.reset().await?;
        assert_eq!(container.state(), ContainerState::New);

        // The scheme registry survives reset, so reconfigure works.
        container.configure(Some(recording_settings())).await?;
        container.shutdown().await?;
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_context_flows_into_events() -> anyhow::Result<()> {
        let rt = TestRuntime::new();
        let container = Container::new(rt.clone());
        let sink = attach_recording_sink(&container, &rt);
        let logger = container.configure(Some(recording_settings())).await?;

        container
            .context()
            .scope(
                btreemap! {
                    "trace_id".to_string() => EventValue::from("trace-42"),
                },
                async {
                    logger.info("traced", no_fields()).await;
                },
            )
            .await;
        tokio::time::sleep(Duration::from_secs(2)).await;

        let events = sink.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].get("trace_id"), Some(EventValue::from("trace-42")));
        assert!(events[0].get("hostname").is_some());
        assert!(events[0].get("pid").is_some());

        container.shutdown().await?;
        Ok(())
    }
}
