//! Logging initialization.
//!
//! Console logging by default; daily-rotated file logging when a log
//! directory is supplied. Filtering follows `RUST_LOG` with an `info`
//! fallback.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::time::LocalTime;
use tracing_subscriber::EnvFilter;

/// Initialize the global subscriber.
///
/// With a directory, logs go to `fleettrack.log.<date>` inside it and the
/// returned guard must be held for the lifetime of the process - dropping
/// it stops the background writer and loses buffered lines.
pub fn init_logging(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "fleettrack.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .with_timer(LocalTime::rfc_3339())
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_timer(LocalTime::rfc_3339())
                .init();
            None
        }
    }
}
