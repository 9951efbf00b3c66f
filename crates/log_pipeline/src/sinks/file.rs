use std::{
    fs,
    fs::{
        File,
        OpenOptions,
    },
    io::Write,
    path::{
        Path,
        PathBuf,
    },
    sync::Arc,
};

use async_trait::async_trait;
use common::{
    errors::{
        ConfigurationError,
        SinkError,
        SinkErrorKind,
    },
    runtime::Runtime,
    LogEvent,
};
use parking_lot::Mutex;

use super::LogSink;
use crate::{
    config::SinkUri,
    consts,
    processors::render::render_json,
};

struct FileState {
    file: Option<File>,
    size: u64,
}

/// Newline-delimited JSON with size-based rotation: when a write would push
/// the file past `max_bytes`, the file rotates to `<path>.1` and historical
/// files shift up, keeping `backup_count` of them.
pub struct FileSink<RT: Runtime> {
    rt: RT,
    path: PathBuf,
    max_bytes: u64,
    backup_count: usize,
    state: Mutex<FileState>,
}

impl<RT: Runtime> FileSink<RT> {
    pub fn new(
        rt: RT,
        path: PathBuf,
        max_bytes: u64,
        backup_count: usize,
    ) -> Result<Self, ConfigurationError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                ConfigurationError::new(
                    "sinks",
                    path.display().to_string(),
                    format!("a writable log directory ({e})"),
                )
            })?;
        }
        let file = open_append(&path).map_err(|e| {
            ConfigurationError::new(
                "sinks",
                path.display().to_string(),
                format!("a writable log file ({e})"),
            )
        })?;
        let size = file.metadata().map(|m| m.len()).unwrap_or(0);
        Ok(Self {
            rt,
            path,
            max_bytes,
            backup_count,
            state: Mutex::new(FileState {
                file: Some(file),
                size,
            }),
        })
    }

    pub fn from_uri(rt: RT, uri: &SinkUri) -> Result<Self, ConfigurationError> {
        let Some(path) = &uri.path else {
            return Err(ConfigurationError::new(
                "sinks",
                uri.render(),
                "file:///absolute/path[?maxBytes=..&backupCount=..]",
            ));
        };
        let max_bytes = match uri.query_int("maxBytes") {
            Some(v) if v > 0 => v as u64,
            Some(v) => {
                return Err(ConfigurationError::new(
                    "sinks",
                    v.to_string(),
                    "maxBytes > 0",
                ));
            },
            None => consts::DEFAULT_FILE_MAX_BYTES,
        };
        let backup_count = match uri.query_int("backupCount") {
            Some(v) if v >= 0 => v as usize,
            Some(v) => {
                return Err(ConfigurationError::new(
                    "sinks",
                    v.to_string(),
                    "backupCount >= 0",
                ));
            },
            None => consts::DEFAULT_FILE_BACKUP_COUNT,
        };
        Self::new(rt, PathBuf::from(path), max_bytes, backup_count)
    }

    fn write_error(&self, operation: &'static str, e: std::io::Error) -> SinkError {
        SinkError::new(SinkErrorKind::Write, "file", operation, self.rt.utc_now()).with_cause(e)
    }

    fn rotate(&self, state: &mut FileState) -> std::io::Result<()> {
        state.file = None;
        if self.backup_count == 0 {
            state.file = Some(File::create(&self.path)?);
            state.size = 0;
            return Ok(());
        }
        for index in (1..self.backup_count).rev() {
            let from = backup_path(&self.path, index);
            if from.exists() {
                fs::rename(&from, backup_path(&self.path, index + 1))?;
            }
        }
        if self.path.exists() {
            fs::rename(&self.path, backup_path(&self.path, 1))?;
        }
        state.file = Some(open_append(&self.path)?);
        state.size = 0;
        Ok(())
    }
}

fn backup_path(path: &Path, index: usize) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(format!(".{index}"));
    PathBuf::from(name)
}

fn open_append(path: &Path) -> std::io::Result<File> {
    OpenOptions::new().append(true).create(true).open(path)
}

#[async_trait]
impl<RT: Runtime> LogSink for FileSink<RT> {
    fn name(&self) -> &str {
        "file"
    }

    async fn write(&self, event: &Arc<LogEvent>) -> Result<(), SinkError> {
        let mut line = render_json(event);
        line.push('\n');
        let bytes = line.as_bytes();

        let mut state = self.state.lock();
        if state.file.is_none() {
            let file = open_append(&self.path).map_err(|e| self.write_error("write", e))?;
            state.size = file.metadata().map(|m| m.len()).unwrap_or(0);
            state.file = Some(file);
        }
        if state.size > 0 && state.size + bytes.len() as u64 > self.max_bytes {
            self.rotate(&mut state)
                .map_err(|e| self.write_error("rotate", e))?;
        }
        let file = state.file.as_mut().ok_or_else(|| {
            self.write_error("write", std::io::Error::other("log file closed"))
        })?;
        file.write_all(bytes)
            .and_then(|_| file.flush())
            .map_err(|e| {
                SinkError::new(SinkErrorKind::Write, "file", "write", self.rt.utc_now())
                    .with_event(event)
                    .with_cause(e)
            })?;
        state.size += bytes.len() as u64;
        Ok(())
    }

    async fn close(&self) -> Result<(), SinkError> {
        let mut state = self.state.lock();
        if let Some(mut file) = state.file.take() {
            file.flush().map_err(|e| self.write_error("close", e))?;
        }
        Ok(())
    }
}
