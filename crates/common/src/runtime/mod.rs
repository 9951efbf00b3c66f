//! Runtime trait abstracting time, scheduling, and randomness so pipeline
//! code runs identically under production tokio and the deterministic test
//! clock.

use std::{
    future::Future,
    pin::Pin,
    time::{
        Duration,
        SystemTime,
    },
};

use chrono::{
    DateTime,
    Utc,
};
use futures::future::{
    BoxFuture,
    FusedFuture,
};
use rand::RngCore;
use thiserror::Error;

pub mod prod;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

#[derive(Error, Debug)]
pub enum JoinError {
    #[error("Future canceled")]
    Canceled,
    #[error("Future panicked: {0:?}")]
    Panicked(anyhow::Error),
}

impl From<tokio::task::JoinError> for JoinError {
    fn from(e: tokio::task::JoinError) -> Self {
        if e.is_cancelled() {
            JoinError::Canceled
        } else {
            JoinError::Panicked(anyhow::anyhow!("{e}"))
        }
    }
}

/// Handle to a spawned worker task. `shutdown` preempts the task at its next
/// yield point; `join` waits for it to finish.
pub trait SpawnHandle: Send + Sync {
    fn shutdown(&mut self);
    fn join(&mut self) -> BoxFuture<'_, Result<(), JoinError>>;
}

/// Shutdown the associated future, preempting it at its next yield point,
/// and join on its result. Cancellation is not an error here.
pub async fn shutdown_and_join(mut handle: Box<dyn SpawnHandle>) -> anyhow::Result<()> {
    handle.shutdown();
    if let Err(e) = handle.join().await {
        if !matches!(e, JoinError::Canceled) {
            return Err(e.into());
        }
    }
    Ok(())
}

/// OS-esque services for pipeline code: sleeping, spawning, clocks, and
/// randomness. Production uses tokio directly; tests substitute a paused
/// clock and a seeded rng so timing-dependent behavior is reproducible.
pub trait Runtime: Clone + Send + Sync + 'static {
    /// Sleep for the given duration.
    fn wait(&self, duration: Duration) -> Pin<Box<dyn FusedFuture<Output = ()> + Send + 'static>>;

    /// Spawn a future on the runtime's executor.
    fn spawn(
        &self,
        name: &'static str,
        f: impl Future<Output = ()> + Send + 'static,
    ) -> Box<dyn SpawnHandle>;

    /// A potentially-virtualized wall clock.
    fn system_time(&self) -> SystemTime;

    /// A potentially-virtualized monotonic clock. `tokio::time::Instant` so
    /// paused-clock tests advance it automatically.
    fn monotonic_now(&self) -> tokio::time::Instant;

    /// Use the runtime's source of randomness.
    fn with_rng<R>(&self, f: impl FnOnce(&mut dyn RngCore) -> R) -> R;

    fn utc_now(&self) -> DateTime<Utc> {
        DateTime::<Utc>::from(self.system_time())
    }
}

/// Bound an operation by a deadline. Timeouts respect the virtual clock in
/// tests.
pub async fn with_timeout<T>(
    description: &'static str,
    duration: Duration,
    fut: impl Future<Output = anyhow::Result<T>>,
) -> anyhow::Result<T> {
    match tokio::time::timeout(duration, fut).await {
        Ok(result) => result,
        Err(_) => anyhow::bail!("{description} timed out after {duration:?}"),
    }
}
