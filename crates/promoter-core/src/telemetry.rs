//! Centralised tracing initialisation for the promoter binary.
//!
//! Call [`init_tracing`] once at program start. Output always goes to
//! stderr; when a log file is configured every event is also appended to it
//! without ANSI colours.
//!
//! Safe to call more than once, subsequent calls are ignored.

use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::Arc;

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::error::PromoterResult;

/// Map a configured level name to a tracing level.
///
/// `WARNING` and `CRITICAL` are accepted for compatibility with
/// existing configuration files.
pub fn parse_level(name: &str) -> Option<Level> {
    match name.to_ascii_uppercase().as_str() {
        "TRACE" => Some(Level::TRACE),
        "DEBUG" => Some(Level::DEBUG),
        "INFO" => Some(Level::INFO),
        "WARN" | "WARNING" => Some(Level::WARN),
        "ERROR" | "CRITICAL" => Some(Level::ERROR),
        _ => None,
    }
}

/// Open `path` for appending, creating parent directories.
pub fn open_log_file(path: &Path) -> PromoterResult<File> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(OpenOptions::new().create(true).append(true).open(path)?)
}

/// Initialise the global tracing subscriber.
///
/// * `json`: emit newline-delimited JSON on stderr.
/// * `level`: default verbosity when `RUST_LOG` is not set.
/// * `log_file`: optional file receiving a plain-text copy of every event.
pub fn init_tracing(json: bool, level: Level, log_file: Option<File>) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()));

    let file_layer = log_file.map(|file| {
        fmt::layer()
            .with_ansi(false)
            .with_target(false)
            .with_writer(Arc::new(file))
    });

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(file_layer)
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_writer(std::io::stderr)
                    .json(),
            )
            .try_init()
            .ok();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(file_layer)
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .try_init()
            .ok();
    }
}
