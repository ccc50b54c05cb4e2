//! Common utilities for usbctl
//!
//! This crate provides the pieces every part of the server leans on:
//! the crate-wide error type, tracing setup, and the process-wide shutdown
//! signal observed by the poll loop, the accept loop and stream handlers.

pub mod error;
pub mod logging;
pub mod shutdown;
pub mod test_utils;

pub use error::{Error, Result};
pub use logging::{LogTarget, setup_logging};
pub use shutdown::Shutdown;
