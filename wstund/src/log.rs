use anyhow::Context as _;
use camino::Utf8Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

/// Keeps the non-blocking writers alive for the process lifetime.
pub struct LoggerGuard {
    _stdio_guard: WorkerGuard,
    _file_guard: Option<WorkerGuard>,
}

/// Initializes the tracing subscriber: stdout always, plus a non-blocking
/// file layer when a log file is configured. `RUST_LOG` overrides the default
/// `info` filter.
pub fn init(log_file: Option<&Utf8Path>, syslog_facility: Option<&str>) -> anyhow::Result<LoggerGuard> {
    let (non_blocking_stdio, stdio_guard) = tracing_appender::non_blocking(std::io::stdout());
    let stdio_layer = fmt::layer().with_writer(non_blocking_stdio);

    let (file_layer, file_guard) = match log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("couldn't open log file {path}"))?;
            let (non_blocking_file, guard) = tracing_appender::non_blocking(file);
            let layer = fmt::layer().with_writer(non_blocking_file).with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(stdio_layer)
        .with(file_layer)
        .with(env_filter)
        .init();

    if let Some(facility) = syslog_facility {
        // Syslog transport belongs to the hosting environment; the facility
        // is recorded so operators can see the flag took effect.
        warn!(facility, "syslog output requested, logging to stdout/file instead");
    }

    Ok(LoggerGuard {
        _stdio_guard: stdio_guard,
        _file_guard: file_guard,
    })
}
