//! Production implementation of the Runtime trait over a tokio handle.

use std::{
    future::Future,
    pin::Pin,
    time::{
        Duration,
        SystemTime,
    },
};

use futures::{
    future::FusedFuture,
    FutureExt,
};
use rand::RngCore;
use tokio::runtime::Handle as TokioRuntimeHandle;

use super::{
    JoinError,
    Runtime,
    SpawnHandle,
};

pub struct FutureHandle {
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl SpawnHandle for FutureHandle {
    fn shutdown(&mut self) {
        if let Some(handle) = &self.handle {
            handle.abort();
        }
    }

    fn join(&mut self) -> futures::future::BoxFuture<'_, Result<(), JoinError>> {
        async move {
            match self.handle.take() {
                Some(handle) => handle.await.map_err(JoinError::from),
                // Joining twice is a no-op, matching task semantics.
                None => Ok(()),
            }
        }
        .boxed()
    }
}

/// Runtime for running in production that sleeps for wallclock time and
/// spawns onto the ambient tokio executor.
#[derive(Clone)]
pub struct ProdRuntime {
    rt: TokioRuntimeHandle,
}

impl ProdRuntime {
    /// Capture the current tokio handle. Must be called from within a tokio
    /// context (`#[tokio::main]` or a runtime guard).
    pub fn new() -> Self {
        Self {
            rt: TokioRuntimeHandle::current(),
        }
    }

    pub fn handle(&self) -> &TokioRuntimeHandle {
        &self.rt
    }

    /// Run a future to completion from a synchronous call site. Panics if
    /// invoked from within an async context, per tokio's `block_on` rules.
    pub fn block_on<F: Future>(&self, f: F) -> F::Output {
        self.rt.block_on(f)
    }
}

impl Runtime for ProdRuntime {
    fn wait(&self, duration: Duration) -> Pin<Box<dyn FusedFuture<Output = ()> + Send + 'static>> {
        Box::pin(tokio::time::sleep(duration).fuse())
    }

    fn spawn(
        &self,
        _name: &'static str,
        f: impl Future<Output = ()> + Send + 'static,
    ) -> Box<dyn SpawnHandle> {
        let handle = self.rt.spawn(f);
        Box::new(FutureHandle {
            handle: Some(handle),
        })
    }

    fn system_time(&self) -> SystemTime {
        SystemTime::now()
    }

    fn monotonic_now(&self) -> tokio::time::Instant {
        tokio::time::Instant::now()
    }

    fn with_rng<R>(&self, f: impl FnOnce(&mut dyn RngCore) -> R) -> R {
        let mut rng = rand::rng();
        f(&mut rng)
    }
}
