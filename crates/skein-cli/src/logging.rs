//! Logging initialization.
//!
//! Dual-output tracing: stderr (human-readable, env-filtered) and an
//! optional append-mode log file behind `--log`.

use std::fs::OpenOptions;
use std::path::Path;

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Install the tracing subscriber.
///
/// Returns a [`WorkerGuard`] when a log file is configured; hold it for the
/// lifetime of the program so buffered lines flush on exit.
pub fn init_tracing(log_path: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let Some(path) = log_path else {
        tracing_subscriber::fmt()
            .with_writer(std::io::stderr)
            .with_env_filter(EnvFilter::from_default_env())
            .init();
        return Ok(None);
    };

    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("cannot open log file '{}'", path.display()))?;
    let (non_blocking, guard) = tracing_appender::non_blocking(file);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(EnvFilter::from_default_env()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(non_blocking)
                .with_filter(EnvFilter::new("info")),
        )
        .init();

    Ok(Some(guard))
}
