use anyhow::Result;
use std::{
    fs,
    io::{self, IsTerminal},
    path::Path,
};
use tracing_appender::non_blocking;
use tracing_subscriber::{filter::LevelFilter, fmt, prelude::*, EnvFilter};

/// Keeps the background log writers alive. Dropping it flushes and stops logging.
pub struct LogGuards {
    _file: non_blocking::WorkerGuard,
    _console: Option<non_blocking::WorkerGuard>,
}

pub const LOG_FILE: &str = "shaderinject.log";

/// Log to [`LOG_FILE`] in `dir`, and to the console when the host has one attached.
pub fn setup_logging(dir: impl AsRef<Path>) -> Result<LogGuards> {
    let f = io::BufWriter::new(fs::File::create(dir.as_ref().join(LOG_FILE))?);
    let (file_writer, file_guard) = non_blocking(f);

    let file_layer = fmt::layer()
        .with_writer(file_writer)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_filter(LevelFilter::DEBUG);

    let (console_layer, console_guard) = if io::stdout().is_terminal() {
        let (console_writer, console_guard) = non_blocking(io::stdout());
        let layer = fmt::layer()
            .with_writer(console_writer)
            .with_ansi(true)
            .compact()
            .with_filter(LevelFilter::INFO);
        (Some(layer), Some(console_guard))
    } else {
        (None, None)
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("shaderinject=debug,{}=debug", env!("CARGO_PKG_NAME")))
    });

    tracing_subscriber::registry()
        .with(file_layer)
        .with(console_layer)
        .with(filter)
        .try_init()?;

    tracing::info!(console = console_guard.is_some(), "Logging initialized");

    Ok(LogGuards {
        _file: file_guard,
        _console: console_guard,
    })
}
