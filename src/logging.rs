//! Tracing setup.
//!
//! `RUST_LOG` takes precedence over the configured level. An empty
//! `logging.file` logs to stdout only.

use std::fs::{self, File};
use std::path::Path;
use std::sync::Arc;

use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::writer::{BoxMakeWriter, MakeWriterExt};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Layer, Registry};

use crate::config::LoggingConfig;
use crate::Result;

fn level_filter(level: &str) -> LevelFilter {
    match level.trim().to_lowercase().as_str() {
        "off" => LevelFilter::OFF,
        "trace" => LevelFilter::TRACE,
        "debug" => LevelFilter::DEBUG,
        "warn" | "warning" => LevelFilter::WARN,
        "error" => LevelFilter::ERROR,
        _ => LevelFilter::INFO,
    }
}

fn env_filter(level: &str) -> EnvFilter {
    EnvFilter::builder()
        .with_default_directive(level_filter(level).into())
        .from_env_lossy()
}

/// Stdout, teed into the log file when one is configured.
fn make_writer(file: &str) -> Result<BoxMakeWriter> {
    if file.trim().is_empty() {
        return Ok(BoxMakeWriter::new(std::io::stdout));
    }

    if let Some(parent) = Path::new(file).parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let log_file = Arc::new(File::create(file)?);
    Ok(BoxMakeWriter::new(std::io::stdout.and(log_file)))
}

/// Install the global subscriber described by `config`.
pub fn init(config: &LoggingConfig) -> Result<()> {
    let fmt = tracing_subscriber::fmt::layer()
        .with_writer(make_writer(&config.file)?)
        .with_ansi(false)
        .with_target(true);

    let layer: Box<dyn Layer<Registry> + Send + Sync> = if config.format.eq_ignore_ascii_case("json") {
        fmt.json().with_current_span(false).boxed()
    } else {
        fmt.boxed()
    };

    tracing_subscriber::registry()
        .with(layer)
        .with(env_filter(&config.level))
        .init();
    Ok(())
}

/// Console-only fallback when [`init`] cannot open its log file.
pub fn init_console_only(level: &str) {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .with(env_filter(level))
        .init();
}
