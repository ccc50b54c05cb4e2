//! Logging setup and configuration

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Where log lines go
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum LogTarget {
    /// Standard error, with colours when attached to a terminal
    #[default]
    Stderr,
    /// Append to a file, no ANSI escapes
    File(PathBuf),
}

/// Setup tracing subscriber for the application
///
/// `default_level` must be a plain level name (`info`, `debug`, ...);
/// `RUST_LOG` takes precedence over it. A log file that cannot
/// be opened is not fatal: output falls back to stderr and a warning is
/// logged once the subscriber is installed.
pub fn setup_logging(default_level: &str, target: &LogTarget) -> crate::Result<()> {
    // A bare word would otherwise be taken as a target directive
    let level: LevelFilter = default_level
        .parse()
        .map_err(|_| crate::Error::InvalidFilter(format!("unknown level '{}'", default_level)))?;
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::default().add_directive(level.into()));

    let mut fallback = None;
    let file = match target {
        LogTarget::Stderr => None,
        LogTarget::File(path) => match OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => Some(file),
            Err(e) => {
                fallback = Some(format!(
                    "Cannot open log file {}: {}, using stderr",
                    path.display(),
                    e
                ));
                None
            }
        },
    };

    let (file_layer, stderr_layer) = match file {
        Some(file) => (
            Some(fmt::layer().with_ansi(false).with_writer(Mutex::new(file))),
            None,
        ),
        None => (None, Some(fmt::layer().with_writer(std::io::stderr))),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(stderr_layer)
        .try_init()
        .map_err(|e| crate::Error::LoggerInstall(e.to_string()))?;

    if let Some(message) = fallback {
        tracing::warn!("{}", message);
    }

    Ok(())
}
