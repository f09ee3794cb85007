//! Logging initialisation for hostler.
//!
//! Stderr output is always enabled, filtered by `RUST_LOG` (default `info`).
//! When the `HOSTLER_LOG` environment variable is set to `1`, structured logs
//! are additionally written to `hostler.log` inside the working directory.
//!
//! Returns a guard that must be kept alive for the duration of the process so
//! that buffered log lines are flushed on exit.

use std::path::Path;

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

pub struct LogGuard {
    _file_guard: Option<tracing_appender::non_blocking::WorkerGuard>,
}

/// Initialise the global tracing subscriber.
///
/// Call once from `main`, store the returned `LogGuard` in a local variable
/// for the duration of the process.
pub fn init(workdir: &Path) -> LogGuard {
    let env_filter = || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let file_guard = if std::env::var("HOSTLER_LOG").as_deref() == Ok("1") {
        let _ = std::fs::create_dir_all(workdir);
        let file_appender = tracing_appender::rolling::never(workdir, "hostler.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        let file_layer = fmt::layer().with_writer(non_blocking).with_ansi(false);

        tracing_subscriber::registry()
            .with(env_filter())
            .with(fmt::layer().with_writer(std::io::stderr))
            .with(file_layer)
            .init();

        Some(guard)
    } else {
        tracing_subscriber::registry()
            .with(env_filter())
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();

        None
    };

    LogGuard {
        _file_guard: file_guard,
    }
}
