//! Object-safe HTTP layer for push sinks, so tests can swap the network for
//! static routes.

use async_trait::async_trait;
use bytes::Bytes;
use common::errors::SinkErrorKind;
use http::StatusCode;
use reqwest::header::HeaderMap;

use crate::consts;

#[derive(Debug, thiserror::Error)]
#[error("http post failed ({kind}): {cause}")]
pub struct HttpPostError {
    pub kind: SinkErrorKind,
    #[source]
    pub cause: std::io::Error,
}

impl HttpPostError {
    fn new(kind: SinkErrorKind, message: String) -> Self {
        Self {
            kind,
            cause: std::io::Error::other(message),
        }
    }
}

#[async_trait]
pub trait HttpPoster: Send + Sync {
    async fn post(
        &self,
        url: &reqwest::Url,
        headers: HeaderMap,
        body: Bytes,
    ) -> Result<StatusCode, HttpPostError>;
}

/// Production poster. The client carries the per-request write timeout, so
/// slow aggregators classify as `Timeout` and stay retry-eligible.
pub struct ReqwestPoster {
    client: reqwest::Client,
}

impl ReqwestPoster {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(consts::HTTP_SINK_WRITE_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self { client }
    }
}

#[async_trait]
impl HttpPoster for ReqwestPoster {
    async fn post(
        &self,
        url: &reqwest::Url,
        headers: HeaderMap,
        body: Bytes,
    ) -> Result<StatusCode, HttpPostError> {
        let response = self
            .client
            .post(url.clone())
            .headers(headers)
            .body(body)
            .send()
            .await
            .map_err(|e| {
                let kind = if e.is_timeout() {
                    SinkErrorKind::Timeout
                } else if e.is_connect() {
                    SinkErrorKind::Connection
                } else {
                    SinkErrorKind::Write
                };
                HttpPostError::new(kind, e.to_string())
            })?;
        Ok(response.status())
    }
}

#[cfg(any(test, feature = "testing"))]
pub mod testing {
    use std::collections::HashMap;

    use async_trait::async_trait;
    use bytes::Bytes;
    use common::errors::SinkErrorKind;
    use http::StatusCode;
    use parking_lot::Mutex;
    use reqwest::header::HeaderMap;

    use super::{
        HttpPostError,
        HttpPoster,
    };

    type Handler = Box<dyn Fn(&Bytes) -> Result<StatusCode, HttpPostError> + Send + Sync>;

    /// Static routing table plus a request log. Unregistered URLs fail with
    /// a connection error, which is what an unreachable endpoint looks like.
    pub struct StaticHttpPoster {
        routes: Mutex<HashMap<String, Handler>>,
        requests: Mutex<Vec<(String, Bytes)>>,
    }

    impl StaticHttpPoster {
        pub fn new() -> Self {
            Self {
                routes: Mutex::new(HashMap::new()),
                requests: Mutex::new(Vec::new()),
            }
        }

        pub fn register(
            &self,
            url: &str,
            handler: impl Fn(&Bytes) -> Result<StatusCode, HttpPostError> + Send + Sync + 'static,
        ) {
            self.routes
                .lock()
                .insert(url.to_string(), Box::new(handler));
        }

        pub fn register_ok(&self, url: &str) {
            self.register(url, |_| Ok(StatusCode::NO_CONTENT));
        }

        pub fn requests(&self) -> Vec<(String, Bytes)> {
            self.requests.lock().clone()
        }
    }

    #[async_trait]
    impl HttpPoster for StaticHttpPoster {
        async fn post(
            &self,
            url: &reqwest::Url,
            _headers: HeaderMap,
            body: Bytes,
        ) -> Result<StatusCode, HttpPostError> {
            self.requests.lock().push((url.to_string(), body.clone()));
            let routes = self.routes.lock();
            match routes.get(url.as_str()) {
                Some(handler) => handler(&body),
                None => Err(HttpPostError {
                    kind: SinkErrorKind::Connection,
                    cause: std::io::Error::other(format!("no route registered for {url}")),
                }),
            }
        }
    }
}
