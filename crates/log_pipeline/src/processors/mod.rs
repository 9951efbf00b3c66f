//! The processor chain: a fixed, ordered list of transforms applied to every
//! event before it reaches the queue. Processors mutate the event in place
//! and return a verdict; dropping is a return value, never an exception.
//! Failures are absorbed here according to each processor's declared error
//! policy, so a broken processor can never take down a producer.

use std::sync::Arc;

use async_trait::async_trait;
use common::{
    errors::ProcessorError,
    EventValue,
    Level,
    LogEvent,
};

use crate::metrics::MetricsCollector;

pub mod dedupe;
pub mod enrich;
pub mod redact;
pub mod render;
pub mod sample;
pub mod throttle;
pub mod validate;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorOutcome {
    Continue,
    Drop,
}

/// What the chain does when a processor fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorPolicy {
    /// Log a warning and keep the event (default).
    PassThrough,
    /// Discard the event.
    Drop,
    /// Replace the event with a minimal error-shaped one.
    FallbackValue,
}

#[async_trait]
pub trait Processor: Send + Sync {
    fn name(&self) -> &'static str;

    fn error_policy(&self) -> ErrorPolicy {
        ErrorPolicy::PassThrough
    }

    async fn process(&self, event: &mut LogEvent) -> Result<ProcessorOutcome, ProcessorError>;
}

/// Minimal shape substituted under `ErrorPolicy::FallbackValue`.
fn fallback_event(original: &LogEvent) -> LogEvent {
    let mut event = LogEvent::new(original.timestamp, Level::Error, original.message.clone());
    event.insert("processor_error", EventValue::Bool(true));
    event
}

/// Ordered pipeline, fixed at container configure time. Walks processors in
/// declared order and short-circuits on the first drop.
pub struct ProcessorChain {
    processors: Vec<Box<dyn Processor>>,
    metrics: Option<Arc<MetricsCollector>>,
}

impl ProcessorChain {
    pub fn new(processors: Vec<Box<dyn Processor>>) -> Self {
        Self {
            processors,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        if metrics.enabled() {
            self.metrics = Some(metrics);
        }
        self
    }

    pub fn len(&self) -> usize {
        self.processors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processors.is_empty()
    }

    pub async fn run(&self, mut event: LogEvent) -> Option<LogEvent> {
        for processor in &self.processors {
            let bytes = self
                .metrics
                .as_ref()
                .map(|_| event.serialized_len())
                .unwrap_or(0);
            let started = std::time::Instant::now();
            let result = processor.process(&mut event).await;
            if let Some(metrics) = &self.metrics {
                metrics.record_processor(
                    processor.name(),
                    started.elapsed(),
                    result.is_ok(),
                    bytes,
                );
            }
            match result {
                Ok(ProcessorOutcome::Continue) => {},
                Ok(ProcessorOutcome::Drop) => return None,
                Err(e) => match processor.error_policy() {
                    ErrorPolicy::PassThrough => {
                        tracing::warn!("processor `{}` failed, passing event through: {e}", processor.name());
                    },
                    ErrorPolicy::Drop => {
                        tracing::warn!("processor `{}` failed, dropping event: {e}", processor.name());
                        return None;
                    },
                    ErrorPolicy::FallbackValue => {
                        tracing::warn!(
                            "processor `{}` failed, substituting fallback event: {e}",
                            processor.name()
                        );
                        event = fallback_event(&event);
                    },
                },
            }
        }
        Some(event)
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use chrono::Utc;
    use common::{
        errors::ProcessorError,
        EventValue,
        Level,
        LogEvent,
    };

    use super::{
        ErrorPolicy,
        Processor,
        ProcessorChain,
        ProcessorOutcome,
    };

    struct Tagger(&'static str);

    #[async_trait]
    impl Processor for Tagger {
        fn name(&self) -> &'static str {
            "tagger"
        }

        async fn process(
            &self,
            event: &mut LogEvent,
        ) -> Result<ProcessorOutcome, ProcessorError> {
            let order = match event.get("order") {
                Some(EventValue::String(s)) => format!("{s},{}", self.0),
                _ => self.0.to_string(),
            };
            event.insert("order", order);
            Ok(ProcessorOutcome::Continue)
        }
    }

    struct Dropper;

    #[async_trait]
    impl Processor for Dropper {
        fn name(&self) -> &'static str {
            "dropper"
        }

        async fn process(
            &self,
            _event: &mut LogEvent,
        ) -> Result<ProcessorOutcome, ProcessorError> {
            Ok(ProcessorOutcome::Drop)
        }
    }

    struct Failer(ErrorPolicy);

    #[async_trait]
    impl Processor for Failer {
        fn name(&self) -> &'static str {
            "failer"
        }

        fn error_policy(&self) -> ErrorPolicy {
            self.0
        }

        async fn process(
            &self,
            _event: &mut LogEvent,
        ) -> Result<ProcessorOutcome, ProcessorError> {
            Err(ProcessorError::execution(
                "failer",
                anyhow::anyhow!("boom"),
            ))
        }
    }

    fn test_event() -> LogEvent {
        LogEvent::new(Utc::now(), Level::Info, "hello")
    }

    #[tokio::test]
    async fn test_runs_in_declared_order() {
        let chain = ProcessorChain::new(vec![Box::new(Tagger("a")), Box::new(Tagger("b"))]);
        let event = chain.run(test_event()).await.unwrap();
        assert_eq!(event.get("order"), Some(EventValue::from("a,b")));
    }

    #[tokio::test]
    async fn test_short_circuits_on_drop() {
        let chain = ProcessorChain::new(vec![
            Box::new(Tagger("a")),
            Box::new(Dropper),
            Box::new(Tagger("never")),
        ]);
        assert!(chain.run(test_event()).await.is_none());
    }

    #[tokio::test]
    async fn test_pass_through_keeps_event() {
        let chain = ProcessorChain::new(vec![
            Box::new(Failer(ErrorPolicy::PassThrough)),
            Box::new(Tagger("after")),
        ]);
        let event = chain.run(test_event()).await.unwrap();
        assert_eq!(event.get("order"), Some(EventValue::from("after")));
        assert_eq!(event.message, "hello");
    }

    #[tokio::test]
    async fn test_drop_policy_drops() {
        let chain = ProcessorChain::new(vec![Box::new(Failer(ErrorPolicy::Drop))]);
        assert!(chain.run(test_event()).await.is_none());
    }

    #[tokio::test]
    async fn test_fallback_policy_substitutes_error_shape() {
        let chain = ProcessorChain::new(vec![Box::new(Failer(ErrorPolicy::FallbackValue))]);
        let event = chain.run(test_event()).await.unwrap();
        assert_eq!(event.level, Level::Error);
        assert_eq!(event.message, "hello");
        assert_eq!(event.get("processor_error"), Some(EventValue::Bool(true)));
    }
}
