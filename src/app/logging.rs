use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::app::config::LoggingConfig;
use crate::platform::AppPaths;

const LOG_FILE_PREFIX: &str = "relaychat.log";

/// Default filter when `RUST_LOG` is not set.
pub fn default_directive(config: &LoggingConfig, debug: bool) -> String {
    let level = if debug { "debug" } else { config.level.as_str() };
    format!("relaychat={}", level)
}

/// Installs the global subscriber: stderr always, plus a daily-rolling file
/// under the logs directory when enabled. Keep the returned guard alive for
/// the life of the process or buffered file output is lost.
pub fn init_logging(config: &LoggingConfig, paths: &AppPaths, debug: bool) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(config, debug)));

    let stderr_layer = fmt::layer().with_writer(std::io::stderr).with_target(false);

    if config.log_to_file {
        let appender = tracing_appender::rolling::daily(paths.logs_dir(), LOG_FILE_PREFIX);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        let file_layer = fmt::layer().with_writer(writer).with_ansi(false);

        tracing_subscriber::registry()
            .with(filter)
            .with(stderr_layer)
            .with(file_layer)
            .init();
        Some(guard)
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(stderr_layer)
            .init();
        None
    }
}
