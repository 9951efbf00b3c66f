//! Outbound trace propagation: turn the current context frame into request
//! headers so downstream services can correlate. Callers attach these to
//! their HTTP client requests; nothing here patches a client globally.

use common::context::{
    keys,
    ContextCarrier,
};
use http::{
    HeaderMap,
    HeaderName,
    HeaderValue,
};

pub const TRACE_ID_HEADER: &str = "x-trace-id";
pub const SPAN_ID_HEADER: &str = "x-span-id";

/// Headers for the carrier's current frame. Empty when no request scope is
/// active or the values are not header-safe.
pub fn trace_headers(carrier: &ContextCarrier) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (header, key) in [
        (TRACE_ID_HEADER, keys::TRACE_ID),
        (SPAN_ID_HEADER, keys::SPAN_ID),
    ] {
        let Some(value) = carrier.get(key) else {
            continue;
        };
        let Some(value) = value.as_str().map(|s| s.to_string()) else {
            continue;
        };
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(header.as_bytes()),
            HeaderValue::from_str(&value),
        ) {
            headers.insert(name, value);
        }
    }
    headers
}

#[cfg(test)]
mod tests {
    use common::{
        context::{
            keys,
            ContextCarrier,
        },
        EventValue,
    };
    use maplit::btreemap;

    use super::{
        trace_headers,
        SPAN_ID_HEADER,
        TRACE_ID_HEADER,
    };

    #[tokio::test]
    async fn test_headers_from_active_scope() {
        let carrier = ContextCarrier::new();
        carrier
            .scope(
                btreemap! {
                    keys::TRACE_ID.to_string() => EventValue::from("t-1"),
                    keys::SPAN_ID.to_string() => EventValue::from("s-1"),
                },
                async {
                    let headers = trace_headers(&carrier);
                    assert_eq!(headers.get(TRACE_ID_HEADER).unwrap(), "t-1");
                    assert_eq!(headers.get(SPAN_ID_HEADER).unwrap(), "s-1");
                },
            )
            .await;
    }

    #[tokio::test]
    async fn test_no_scope_means_no_headers() {
        let carrier = ContextCarrier::new();
        assert!(trace_headers(&carrier).is_empty());
    }
}
