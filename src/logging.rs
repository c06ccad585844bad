use std::fs;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::constants::DEFAULT_LOG_FILE;

/// Initializes the logging system with both console and file output.
///
/// The file layer appends one JSON object per event to
/// `<log_dir>/data_pipeline.log`. Keep the returned guard alive until exit
/// so buffered lines are flushed.
pub fn init_logging(log_dir: &Path) -> std::io::Result<WorkerGuard> {
    fs::create_dir_all(log_dir)?;

    // Single append-only file, no rotation
    let file_appender = tracing_appender::rolling::never(log_dir, DEFAULT_LOG_FILE);
    let (non_blocking_writer, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .json()
        .with_ansi(false)
        .with_writer(non_blocking_writer);

    let console_layer = fmt::layer().with_target(false).with_writer(std::io::stdout);

    // Respect RUST_LOG if set
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("subscriber_pipeline=info,warn"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(console_layer)
        .init();

    Ok(guard)
}
