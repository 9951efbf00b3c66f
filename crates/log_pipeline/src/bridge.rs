//! Opt-in forwarder from the `log` crate's macros into a container's
//! pipeline. The `log` logger slot is process-wide, so unlike everything
//! else in this crate the bridge is explicitly installed by the caller, and
//! installation fails if another logger already holds the slot.

use common::{
    errors::ConfigurationError,
    runtime::Runtime,
    Level,
};
use log::{
    Log,
    Metadata,
    Record,
};

use crate::logger::Logger;

fn map_level(level: log::Level) -> Level {
    match level {
        log::Level::Trace | log::Level::Debug => Level::Debug,
        log::Level::Info => Level::Info,
        log::Level::Warn => Level::Warn,
        log::Level::Error => Level::Error,
    }
}

fn to_filter(level: Level) -> log::LevelFilter {
    match level {
        Level::Debug => log::LevelFilter::Debug,
        Level::Info => log::LevelFilter::Info,
        Level::Warn => log::LevelFilter::Warn,
        Level::Error | Level::Critical => log::LevelFilter::Error,
    }
}

pub struct LogBridge<RT: Runtime> {
    rt: RT,
    logger: Logger<RT>,
}

impl<RT: Runtime> LogBridge<RT> {
    pub fn new(rt: RT, logger: Logger<RT>) -> Self {
        Self { rt, logger }
    }
}

impl<RT: Runtime> Log for LogBridge<RT> {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        map_level(metadata.level()) >= self.logger.min_level()
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let level = map_level(record.level());
        let message = record.args().to_string();
        let target = record.target().to_string();
        let logger = self.logger.clone();
        // `Log::log` is sync and may run inside the async runtime, so the
        // pipeline call is spawned rather than blocked on.
        self.rt.spawn("log_bridge", async move {
            logger
                .log(
                    level,
                    message,
                    [("target".to_string(), target.into())],
                )
                .await;
        });
    }

    fn flush(&self) {}
}

/// Install the bridge as the process-wide `log` logger. Returns a
/// configuration error if a logger is already installed.
pub fn install<RT: Runtime>(rt: RT, logger: Logger<RT>) -> Result<(), ConfigurationError> {
    let max_level = to_filter(logger.min_level());
    log::set_boxed_logger(Box::new(LogBridge::new(rt, logger))).map_err(|_| {
        ConfigurationError::new(
            "log_bridge",
            "install",
            "a process without an already-installed `log` logger",
        )
    })?;
    log::set_max_level(max_level);
    Ok(())
}
