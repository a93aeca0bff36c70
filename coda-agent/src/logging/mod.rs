use crate::config::UiConfig;
use std::io;
use std::path::Path;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, fmt};

/// Command-line override of the configured console level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Verbosity {
    Quiet,
    #[default]
    Normal,
    Verbose,
}

/// Keeps the background log-file writer alive; dropping it flushes the file.
#[must_use]
pub struct LoggingGuard {
    _file: Option<WorkerGuard>,
}

/// Filter directive for stderr output.
pub fn console_directive(configured: &str, verbosity: Verbosity) -> &'static str {
    match verbosity {
        Verbosity::Quiet => "error",
        Verbosity::Verbose => "debug",
        Verbosity::Normal => match configured.trim().to_lowercase().as_str() {
            "none" | "off" => "off",
            "error" => "error",
            "info" => "info",
            "debug" => "debug",
            "trace" => "trace",
            _ => "warn",
        },
    }
}

fn file_writer(path: &Path) -> io::Result<(NonBlocking, WorkerGuard)> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let name = path
        .file_name()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "log file path has no file name"))?;
    std::fs::create_dir_all(dir)?;

    let appender = RollingFileAppender::builder()
        .rotation(Rotation::NEVER)
        .filename_prefix(name.to_string_lossy())
        .build(dir)
        .map_err(io::Error::other)?;
    Ok(tracing_appender::non_blocking(appender))
}

/// Installs the process-wide subscriber: console logs on stderr, plus a
/// plain-text file when `ui.log_file` is set. `RUST_LOG` overrides the
/// console level. Calling this twice leaves the first subscriber in place.
pub fn init(ui: &UiConfig, verbosity: Verbosity) -> LoggingGuard {
    let console_filter = match std::env::var("RUST_LOG") {
        Ok(value) if !value.trim().is_empty() => EnvFilter::new(value),
        _ => EnvFilter::new(console_directive(&ui.console_log_level, verbosity)),
    };
    let console = fmt::layer()
        .with_writer(io::stderr)
        .with_target(false)
        .with_filter(console_filter);

    let mut guard = None;
    let file_layer = match ui.log_file.as_deref().map(file_writer) {
        Some(Ok((writer, worker))) => {
            guard = Some(worker);
            Some(
                fmt::layer()
                    .with_writer(writer)
                    .with_ansi(false)
                    .with_filter(EnvFilter::new("debug")),
            )
        }
        Some(Err(e)) => {
            eprintln!("Could not open log file: {}", e);
            None
        }
        None => None,
    };

    let _ = tracing_subscriber::registry()
        .with(console)
        .with(file_layer)
        .try_init();

    LoggingGuard { _file: guard }
}
