//! Common error types

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// `RUST_LOG` or the configured level is not a valid filter directive
    #[error("Invalid log filter: {0}")]
    InvalidFilter(String),

    /// A global subscriber was already installed
    #[error("Failed to install logger: {0}")]
    LoggerInstall(String),
}

pub type Result<T> = std::result::Result<T, Error>;
