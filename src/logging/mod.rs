// Logging module - tracing subscriber initialization
//
// Logs go to stderr (human or JSON format) and optionally to a rotating
// file via a non-blocking appender. The returned guard must be held for
// the lifetime of the process: dropping it flushes and stops the appender
// worker thread.

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::{LogRotation, LoggingConfig};

/// Initialize the global tracing subscriber from config.
///
/// `RUST_LOG` takes precedence over the configured level so ad-hoc debugging
/// never requires a config edit.
pub fn init(config: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let stderr_layer: Box<dyn Layer<_> + Send + Sync> = if config.json {
        fmt::layer().json().with_writer(std::io::stderr).boxed()
    } else {
        fmt::layer().with_writer(std::io::stderr).boxed()
    };

    let (file_layer, guard) = if config.file_enabled {
        std::fs::create_dir_all(&config.file_dir)
            .with_context(|| format!("failed to create log dir {}", config.file_dir.display()))?;

        let appender = match config.file_rotation {
            LogRotation::Hourly => {
                tracing_appender::rolling::hourly(&config.file_dir, &config.file_prefix)
            }
            LogRotation::Daily => {
                tracing_appender::rolling::daily(&config.file_dir, &config.file_prefix)
            }
            LogRotation::Never => {
                tracing_appender::rolling::never(&config.file_dir, format!("{}.log", config.file_prefix))
            }
        };
        let (writer, guard) = tracing_appender::non_blocking(appender);
        let layer: Box<dyn Layer<_> + Send + Sync> =
            fmt::layer().with_ansi(false).with_writer(writer).boxed();
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .init();

    Ok(guard)
}
