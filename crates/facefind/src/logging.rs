//! Process logging.
//!
//! `init` installs the global subscriber exactly once and hands back a
//! [`LogHandle`]; the owner calls [`LogHandle::shutdown`] before exit so
//! buffered file output is flushed.
//!
//! The file log rolls over daily and keeps a week of files.

use std::path::Path;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

/// Log files kept on disk, one per day.
const LOG_RETENTION_FILES: usize = 7;
const LOG_ROTATION: Rotation = Rotation::DAILY;

/// Owner of the process logging setup.
pub struct LogHandle {
    guard: Option<WorkerGuard>,
}

impl LogHandle {
    /// Flush pending file output and stop the writer thread.
    pub fn shutdown(self) {
        drop(self.guard);
    }

    /// Log the run's fatal error, if any, then shut down.
    pub fn finish<T, E: std::fmt::Display>(self, result: &Result<T, E>) {
        if let Err(e) = result {
            tracing::error!("run failed: {e:#}");
        }
        self.shutdown();
    }
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Rolling appender for `path`: files are named `<file name>.<date>` in the
/// parent directory, and only the newest [`LOG_RETENTION_FILES`] are kept.
fn rolling_appender(path: &Path) -> std::io::Result<RollingFileAppender> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let prefix = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "facefind.log".to_string());

    RollingFileAppender::builder()
        .rotation(LOG_ROTATION)
        .filename_prefix(prefix)
        .max_log_files(LOG_RETENTION_FILES)
        .build(dir)
        .map_err(std::io::Error::other)
}

fn file_layer(writer: NonBlocking) -> impl Layer<Registry> {
    tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(writer)
        .with_filter(env_filter())
}

/// Install stderr logging (filtered by `RUST_LOG`, default `info`) plus an
/// optional rolling file layer.
pub fn init(log_file: Option<&Path>) -> std::io::Result<LogHandle> {
    let (writer, guard) = match log_file {
        Some(path) => {
            let (writer, guard) = tracing_appender::non_blocking(rolling_appender(path)?);
            (Some(writer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(writer.map(file_layer))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr).with_filter(env_filter()))
        .try_init()
        .map_err(std::io::Error::other)?;

    Ok(LogHandle { guard })
}
