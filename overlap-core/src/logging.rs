//! Logging infrastructure for the tracer daemon.
//!
//! Logs are written to `~/.overlap/logs/tracer.log` with daily rotation. The
//! daemon has no terminal surface, so nothing is written to stdout.

use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

use crate::paths;

/// Initialize the logging system.
///
/// Sets up tracing with:
/// - File output to the state directory's `logs/` folder
/// - Daily log rotation
/// - Log level from `RUST_LOG`, defaulting to `info`
pub fn init() -> crate::error::Result<LoggingGuard> {
    let log_dir = paths::log_dir();
    std::fs::create_dir_all(&log_dir)?;

    let file_appender = RollingFileAppender::new(Rotation::DAILY, &log_dir, "tracer.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true)
        .with_file(true)
        .with_line_number(true);

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .init();

    tracing::info!(log_dir = %log_dir.display(), "Logging initialized");

    Ok(LoggingGuard { _guard: guard })
}

/// Initialize logging for tests (logs to the test writer).
pub fn init_test() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .with_span_events(FmtSpan::CLOSE)
        .try_init();
}

/// Guard that keeps the logging system alive.
///
/// When dropped, flushes any pending log writes.
pub struct LoggingGuard {
    _guard: tracing_appender::non_blocking::WorkerGuard,
}
