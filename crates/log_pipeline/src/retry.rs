//! Exponential-backoff executor for async operations (the delivery path's
//! retry primitive). Does not classify errors; callers keep configuration
//! errors away from it.

use std::{
    future::Future,
    time::Duration,
};

use common::runtime::Runtime;

use crate::consts;

/// Run `op` up to `max_retries + 1` times. Between attempts `n` and `n + 1`
/// waits `min(base_delay * 2^n, max_delay)`. Returns the last error once
/// attempts are exhausted.
pub async fn retry<RT, T, F, Fut>(
    rt: &RT,
    mut op: F,
    max_retries: u32,
    base_delay: Duration,
    max_delay: Duration,
) -> anyhow::Result<T>
where
    RT: Runtime,
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                if attempt >= max_retries {
                    return Err(e);
                }
                let exp = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
                let delay = base_delay.checked_mul(exp).unwrap_or(max_delay).min(max_delay);
                tracing::debug!(
                    "attempt {} failed, retrying in {delay:?}: {e:#}",
                    attempt + 1
                );
                rt.wait(delay).await;
                attempt += 1;
            },
        }
    }
}

/// `retry` with the pipeline-wide delay cap.
pub async fn retry_with_base_delay<RT, T, F, Fut>(
    rt: &RT,
    op: F,
    max_retries: u32,
    base_delay: Duration,
) -> anyhow::Result<T>
where
    RT: Runtime,
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    retry(rt, op, max_retries, base_delay, consts::RETRY_MAX_DELAY).await
}
