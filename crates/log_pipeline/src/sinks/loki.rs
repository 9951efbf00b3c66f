//! Loki-style HTTP push sink. Events batch internally and each flush posts a
//! streams payload with nanosecond timestamps to `/loki/api/v1/push`.

use std::{
    collections::BTreeMap,
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use common::{
    errors::{
        ConfigurationError,
        SinkError,
    },
    runtime::Runtime,
    LogEvent,
};
use futures::FutureExt;
use reqwest::header::{
    HeaderMap,
    HeaderValue,
    CONTENT_TYPE,
};
use serde_json::{
    json,
    Value as JsonValue,
};

use super::{
    http::HttpPoster,
    BatchingMode,
    LogSink,
};
use crate::{
    batch::{
        BatchConfig,
        BatchManager,
    },
    config::SinkUri,
    consts,
    processors::render::render_json,
    retry::retry_with_base_delay,
};

pub const LOKI_PUSH_PATH: &str = "/loki/api/v1/push";
const DEFAULT_LOKI_PORT: u16 = 3100;

#[derive(Clone)]
pub struct LokiConfig {
    pub url: reqwest::Url,
    pub labels: BTreeMap<String, String>,
    pub batch: BatchConfig,
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl LokiConfig {
    /// `loki://host:port?labels=k=v,k=v&batch_size=..&batch_interval=..`,
    /// or `https://` when the netloc is the aggregator's.
    pub fn from_uri(
        uri: &SinkUri,
        max_retries: u32,
        retry_delay: Duration,
    ) -> Result<Self, ConfigurationError> {
        let Some(host) = &uri.host else {
            return Err(ConfigurationError::new(
                "sinks",
                uri.render(),
                "loki://host[:port][?labels=..]",
            ));
        };
        let scheme = if uri.scheme == "https" { "https" } else { "http" };
        let port = uri.port.unwrap_or(DEFAULT_LOKI_PORT);
        let raw = format!("{scheme}://{host}:{port}{LOKI_PUSH_PATH}");
        let url = raw.parse().map_err(|e| {
            ConfigurationError::new("sinks", raw, format!("a valid push URL ({e})"))
        })?;

        let mut labels = BTreeMap::new();
        if let Some(raw_labels) = uri.query_str("labels") {
            for pair in raw_labels.split(',').filter(|p| !p.is_empty()) {
                let Some((key, value)) = pair.split_once('=') else {
                    return Err(ConfigurationError::new(
                        "sinks",
                        raw_labels,
                        "labels as k=v[,k=v...]",
                    ));
                };
                labels.insert(key.to_string(), value.to_string());
            }
        }

        let batch_size = match uri.query_int("batch_size") {
            Some(v) if v > 0 => v as usize,
            Some(v) => {
                return Err(ConfigurationError::new(
                    "sinks",
                    v.to_string(),
                    "batch_size > 0",
                ));
            },
            None => consts::DEFAULT_LOKI_BATCH_SIZE,
        };
        let batch_interval = match uri.query_float("batch_interval") {
            Some(v) if v > 0.0 => Duration::from_secs_f64(v),
            Some(v) => {
                return Err(ConfigurationError::new(
                    "sinks",
                    v.to_string(),
                    "batch_interval > 0",
                ));
            },
            None => consts::DEFAULT_LOKI_BATCH_INTERVAL,
        };

        Ok(Self {
            url,
            labels,
            batch: BatchConfig {
                batch_size,
                batch_interval,
            },
            max_retries,
            retry_delay,
        })
    }
}

struct LokiInner<RT: Runtime> {
    rt: RT,
    config: LokiConfig,
    poster: Arc<dyn HttpPoster>,
}

impl<RT: Runtime> LokiInner<RT> {
    /// Retry-wrapped push of one batch; the batch manager counts the batch
    /// lost if this still fails.
    async fn push_batch(self: Arc<Self>, events: Vec<Arc<LogEvent>>) -> anyhow::Result<()> {
        let payload = build_payload(&self.config.labels, &events);
        let body = Bytes::from(serde_json::to_vec(&payload)?);
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        retry_with_base_delay(
            &self.rt,
            || {
                let body = body.clone();
                let headers = headers.clone();
                let inner = self.clone();
                async move {
                    let status = inner
                        .poster
                        .post(&inner.config.url, headers, body)
                        .await?;
                    if !status.is_success() {
                        anyhow::bail!("loki push returned {status}");
                    }
                    Ok(())
                }
            },
            self.config.max_retries,
            self.config.retry_delay,
        )
        .await
    }
}

/// Each event renders as one JSON line; Loki expects stringified nanosecond
/// timestamps.
fn build_payload(labels: &BTreeMap<String, String>, events: &[Arc<LogEvent>]) -> JsonValue {
    let values: Vec<JsonValue> = events
        .iter()
        .map(|event| {
            let ns = event
                .timestamp
                .timestamp_nanos_opt()
                .unwrap_or_else(|| event.timestamp.timestamp_micros().saturating_mul(1000));
            json!([ns.to_string(), render_json(event)])
        })
        .collect();
    json!({
        "streams": [{
            "stream": labels,
            "values": values,
        }]
    })
}

pub struct LokiSink<RT: Runtime> {
    inner: Arc<LokiInner<RT>>,
    batch: Arc<BatchManager>,
}

impl<RT: Runtime> LokiSink<RT> {
    pub fn new(rt: RT, config: LokiConfig, poster: Arc<dyn HttpPoster>) -> Self {
        let inner = Arc::new(LokiInner {
            rt: rt.clone(),
            config: config.clone(),
            poster,
        });
        let flush_inner = inner.clone();
        let batch = BatchManager::new(&rt, config.batch, {
            Arc::new(move |events| flush_inner.clone().push_batch(events).boxed())
        });
        Self { inner, batch }
    }

    pub fn lost_events(&self) -> u64 {
        self.batch.lost_events()
    }
}

#[async_trait]
impl<RT: Runtime> LogSink for LokiSink<RT> {
    fn name(&self) -> &str {
        "loki"
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
        Ok(())
    }
}
