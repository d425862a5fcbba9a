///! Logging configuration module
///! Provides structured logging with a console layer and an optional rolling file layer

use std::io;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::LoggingConfig;

const LOG_FILE_PREFIX: &str = "shoal.log";

/// Initialize the global subscriber.
///
/// The returned guard flushes the file writer on drop and must live as long as the process.
pub fn init(config: &LoggingConfig) -> Result<Option<WorkerGuard>, Box<dyn std::error::Error>> {
    // RUST_LOG wins over the configured level
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let console_layer = if config.json_format {
        fmt::layer()
            .with_target(true)
            .with_ansi(false)
            .json()
            .with_writer(io::stdout)
            .boxed()
    } else {
        fmt::layer()
            .with_target(true)
            .with_level(true)
            .with_thread_ids(false)
            .with_ansi(true)
            .with_writer(io::stdout)
            .boxed()
    };

    let guard = if config.file_logging_enabled {
        std::fs::create_dir_all(&config.log_dir)?;
        let file_appender = rolling::daily(&config.log_dir, LOG_FILE_PREFIX);
        let (writer, guard) = non_blocking(file_appender);

        let file_layer = fmt::layer()
            .with_target(true)
            .with_level(true)
            .with_thread_ids(true)
            .with_ansi(false)
            .json()
            .with_writer(writer);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .with(file_layer)
            .try_init()?;

        Some(guard)
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .try_init()?;

        None
    };

    tracing::info!("Logging initialized - level: {}", config.level);

    Ok(guard)
}

/// Log a cluster operation with context
#[macro_export]
macro_rules! log_cluster_operation {
    ($op:expr, $cluster_id:expr) => {
        tracing::info!(
            operation = %$op,
            cluster_id = $cluster_id,
            "Cluster operation"
        )
    };
    ($op:expr, $cluster_id:expr, $($key:ident = $value:expr),+) => {
        tracing::info!(
            operation = %$op,
            cluster_id = $cluster_id,
            $($key = $value),+,
            "Cluster operation"
        )
    };
}
