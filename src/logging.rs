use anyhow::Context;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::LogConfig;

const LOG_FILE_PREFIX: &str = "routinely.log";

/// Keeps the file sink flushing. Hold it for the lifetime of the process.
#[must_use]
pub struct LogGuard {
    _file: Option<WorkerGuard>,
}

pub fn build_filter(config: &LogConfig) -> anyhow::Result<EnvFilter> {
    EnvFilter::try_new(&config.filter)
        .with_context(|| format!("invalid log filter {:?}", config.filter))
}

/// Installs the global subscriber: JSON lines on stderr, plus a daily rolling
/// file when `config.dir` is set. `log` records are bridged into `tracing`.
pub fn init_logging(config: &LogConfig) -> anyhow::Result<LogGuard> {
    let filter = build_filter(config)?;

    let stderr_layer = fmt::layer()
        .json()
        .with_target(true)
        .with_timer(UtcTime::rfc_3339())
        .with_writer(std::io::stderr);

    let (file_layer, guard) = match &config.dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("create log directory {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .json()
                .with_target(true)
                .with_ansi(false)
                .with_timer(UtcTime::rfc_3339())
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let subscriber = tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer);
    tracing::subscriber::set_global_default(subscriber)
        .context("install global tracing subscriber")?;

    // Ignore "already set": another bridge may have been installed by an embedding host.
    let _ = tracing_log::LogTracer::init();

    tracing::info!(
        target: "routinely",
        event = "logging_initialized",
        filter = %config.filter,
        file_sink = config.dir.is_some()
    );

    Ok(LogGuard { _file: guard })
}
