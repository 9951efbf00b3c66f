use std::{
    io::Write,
    sync::Arc,
};

use async_trait::async_trait;
use common::{
    errors::{
        SinkError,
        SinkErrorKind,
    },
    runtime::Runtime,
    LogEvent,
};

use super::LogSink;
use crate::processors::render::{
    render,
    RenderMode,
};

/// Writes one rendered line per event to the process's stdout.
pub struct StdoutSink<RT: Runtime> {
    rt: RT,
    mode: RenderMode,
}

impl<RT: Runtime> StdoutSink<RT> {
    pub fn new(rt: RT, mode: RenderMode) -> Self {
        Self { rt, mode }
    }
}

#[async_trait]
impl<RT: Runtime> LogSink for StdoutSink<RT> {
    fn name(&self) -> &str {
        "stdout"
    }

    async fn write(&self, event: &Arc<LogEvent>) -> Result<(), SinkError> {
        let mut line = render(event, self.mode);
        line.push('\n');
        let mut out = std::io::stdout().lock();
        out.write_all(line.as_bytes()).map_err(|e| {
            SinkError::new(SinkErrorKind::Write, "stdout", "write", self.rt.utc_now())
                .with_event(event)
                .with_cause(e)
        })
    }

    async fn close(&self) -> Result<(), SinkError> {
        let mut out = std::io::stdout().lock();
        out.flush().map_err(|e| {
            SinkError::new(SinkErrorKind::Write, "stdout", "close", self.rt.utc_now()).with_cause(e)
        })
    }
}
