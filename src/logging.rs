//! Logging setup.
//!
//! Events go to stderr and, when a log file is requested, to a plain-text
//! file that the dashboard serves through `GET /logs`. `RUST_LOG` overrides
//! the configured level.

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

use crate::config::LoggingConfig;

/// Keeps the file writer alive. Dropping it flushes buffered lines.
pub struct Guard {
    _file_guard: Option<WorkerGuard>,
}

/// Installs the global subscriber. With `to_file` unset only stderr is used.
pub fn init(config: &LoggingConfig, to_file: bool) -> Result<Guard> {
    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(env_filter(&config.level));

    let (file_layer, file_guard) = if to_file {
        std::fs::create_dir_all(&config.dir)
            .with_context(|| format!("Failed to create log dir: {}", config.dir.display()))?;
        let appender = tracing_appender::rolling::never(&config.dir, &config.file);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        let layer = fmt::layer()
            .with_ansi(false)
            .with_writer(writer)
            .with_filter(env_filter(&config.level));
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .context("Failed to install log subscriber")?;

    Ok(Guard {
        _file_guard: file_guard,
    })
}

fn env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}
