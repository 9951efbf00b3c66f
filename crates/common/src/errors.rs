//! Typed failure taxonomy for the pipeline.
//!
//! Configuration problems are fatal at configure time and never retried.
//! Sink failures carry enough context to be diagnosed from metrics alone,
//! and classify themselves as retryable or not. Nothing in this module is
//! ever surfaced to a producer call site: enqueue returns a boolean and the
//! worker records failures instead of raising them.

use std::fmt;

use chrono::{
    DateTime,
    Utc,
};

use crate::event::LogEvent;

fn as_source(cause: &anyhow::Error) -> &(dyn std::error::Error + 'static) {
    cause.as_ref()
}

/// Invalid settings, reported synchronously from `configure` with the
/// offending setting name, the value we saw, and what was expected.
#[derive(Debug, thiserror::Error)]
#[error("invalid setting `{setting}`: got `{value}`, expected {expected}")]
pub struct ConfigurationError {
    pub setting: String,
    pub value: String,
    pub expected: String,
}

impl ConfigurationError {
    pub fn new(
        setting: impl Into<String>,
        value: impl Into<String>,
        expected: impl Into<String>,
    ) -> Self {
        Self {
            setting: setting.into(),
            value: value.into(),
            expected: expected.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum SinkErrorKind {
    Connection,
    Timeout,
    Write,
    Configuration,
}

/// A failed sink operation. `Configuration` is the only kind the worker will
/// not retry.
#[derive(Debug)]
pub struct SinkError {
    pub kind: SinkErrorKind,
    pub sink_name: String,
    pub operation: &'static str,
    pub event_keys: Vec<String>,
    pub event_size: usize,
    pub timestamp: DateTime<Utc>,
    pub cause: Option<anyhow::Error>,
}

impl SinkError {
    pub fn new(
        kind: SinkErrorKind,
        sink_name: impl Into<String>,
        operation: &'static str,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            kind,
            sink_name: sink_name.into(),
            operation,
            event_keys: Vec::new(),
            event_size: 0,
            timestamp,
            cause: None,
        }
    }

    pub fn with_event(mut self, event: &LogEvent) -> Self {
        self.event_keys = event.keys();
        self.event_size = event.serialized_len();
        self
    }

    pub fn with_cause(mut self, cause: impl Into<anyhow::Error>) -> Self {
        self.cause = Some(cause.into());
        self
    }

    pub fn is_retryable(&self) -> bool {
        !matches!(self.kind, SinkErrorKind::Configuration)
    }
}

impl fmt::Display for SinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "sink `{}` failed during {} ({}, {} keys, {} bytes)",
            self.sink_name,
            self.operation,
            self.kind,
            self.event_keys.len(),
            self.event_size,
        )?;
        if let Some(cause) = &self.cause {
            write!(f, ": {cause}")?;
        }
        Ok(())
    }
}

impl std::error::Error for SinkError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause.as_ref().map(as_source)
    }
}

/// Enqueue or per-event delivery failure, recorded by the worker.
#[derive(Debug)]
pub struct QueueError {
    pub operation: &'static str,
    pub event_keys: Vec<String>,
    pub total_sinks: usize,
    pub failed_sinks: usize,
    pub cause: Option<anyhow::Error>,
}

impl QueueError {
    pub fn new(operation: &'static str) -> Self {
        Self {
            operation,
            event_keys: Vec::new(),
            total_sinks: 0,
            failed_sinks: 0,
            cause: None,
        }
    }

    pub fn with_event_keys(mut self, event_keys: Vec<String>) -> Self {
        self.event_keys = event_keys;
        self
    }

    pub fn with_sink_counts(mut self, total_sinks: usize, failed_sinks: usize) -> Self {
        self.total_sinks = total_sinks;
        self.failed_sinks = failed_sinks;
        self
    }

    pub fn with_cause(mut self, cause: impl Into<anyhow::Error>) -> Self {
        self.cause = Some(cause.into());
        self
    }
}

impl fmt::Display for QueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "queue {} failed ({}/{} sinks failed, {} event keys)",
            self.operation,
            self.failed_sinks,
            self.total_sinks,
            self.event_keys.len(),
        )?;
        if let Some(cause) = &self.cause {
            write!(f, ": {cause}")?;
        }
        Ok(())
    }
}

impl std::error::Error for QueueError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause.as_ref().map(as_source)
    }
}

/// Processor failures. Execution errors are absorbed by the chain per the
/// processor's error policy; the other kinds are fatal at configure time.
#[derive(Debug)]
pub enum ProcessorError {
    Configuration {
        processor: &'static str,
        reason: String,
    },
    Execution {
        processor: &'static str,
        cause: anyhow::Error,
    },
    Registration {
        processor: String,
        reason: String,
    },
}

impl ProcessorError {
    pub fn execution(processor: &'static str, cause: impl Into<anyhow::Error>) -> Self {
        Self::Execution {
            processor,
            cause: cause.into(),
        }
    }

    pub fn configuration(processor: &'static str, reason: impl Into<String>) -> Self {
        Self::Configuration {
            processor,
            reason: reason.into(),
        }
    }

    pub fn processor(&self) -> &str {
        match self {
            Self::Configuration { processor, .. } | Self::Execution { processor, .. } => processor,
            Self::Registration { processor, .. } => processor,
        }
    }
}

impl fmt::Display for ProcessorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Configuration { processor, reason } => {
                write!(f, "processor `{processor}` misconfigured: {reason}")
            },
            Self::Execution { processor, cause } => {
                write!(f, "processor `{processor}` failed: {cause}")
            },
            Self::Registration { processor, reason } => {
                write!(f, "processor `{processor}` registration failed: {reason}")
            },
        }
    }
}

impl std::error::Error for ProcessorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Execution { cause, .. } => Some(as_source(cause)),
            _ => None,
        }
    }
}

/// Context-carrier misuse. Logged at debug, never surfaced.
#[derive(Debug, thiserror::Error)]
#[error("context {operation} outside an active scope: {reason}")]
pub struct ContextError {
    pub operation: &'static str,
    pub reason: String,
}
