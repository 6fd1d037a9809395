//! Installs the process-wide tracing subscriber: a colored console layer and
//! a JSON layer written to a daily rolling file under `log_dir`.

use std::path::Path;

use thiserror::Error;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("failed to create log directory: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid log filter '{0}'")]
    Filter(String),
    #[error("global subscriber already installed: {0}")]
    Init(String),
}

/// Builds the filter from `RUST_LOG` when set, else from `level`.
pub fn build_filter(level: &str) -> Result<EnvFilter, LoggingError> {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .map_err(|_| LoggingError::Filter(level.to_string()))
}

/// Initializes logging. Keep the returned guard alive until exit or buffered
/// file lines are lost.
pub fn setup_logging(log_dir: &Path, level: &str, app_name: &str) -> Result<WorkerGuard, LoggingError> {
    std::fs::create_dir_all(log_dir)?;

    let file_appender = rolling::daily(log_dir, format!("{app_name}.log"));
    let (non_blocking_appender, guard) = non_blocking(file_appender);

    let console_layer = fmt::layer().with_target(true).with_ansi(true);

    let file_layer = fmt::layer()
        .with_ansi(false)
        .with_writer(non_blocking_appender)
        .json();

    tracing_subscriber::registry()
        .with(build_filter(level)?)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| LoggingError::Init(e.to_string()))?;

    Ok(guard)
}
