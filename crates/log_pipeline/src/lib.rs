//! A structured logging runtime for network services.
//!
//! Applications emit structured events through a [`Logger`]; a per-container
//! processor chain enriches, redacts, samples, throttles, deduplicates, and
//! validates them; a bounded async queue decouples producers from sink I/O;
//! and a single worker fans each event out to every sink with batching and
//! retries. A [`Container`] owns one instance of everything, so independent
//! containers share no observable state.
//!
//! ```ignore
//! let container = Container::new(ProdRuntime::new());
//! let logger = container.configure(Some(Settings::from_env()?)).await?;
//! logger.info("server started", [("port".to_string(), 8080u32.into())]).await;
//! container.shutdown().await?;
//! ```

pub mod batch;
pub mod bridge;
pub mod config;
pub mod consts;
pub mod container;
pub mod exporter;
pub mod logger;
pub mod metrics;
pub mod outbound;
pub mod processors;
pub mod queue;
pub mod registry;
pub mod retry;
pub mod sinks;

pub use common::{
    context::ContextCarrier,
    errors,
    EventValue,
    Level,
    LogEvent,
};
pub use config::Settings;
pub use container::{
    Container,
    ContainerState,
};
pub use logger::Logger;
pub use metrics::MetricsCollector;
pub use sinks::LogSink;
