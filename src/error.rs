//! Crate-level error types
//!
//! Errors that reach the binary: configuration, socket binding, logger
//! setup and notifier construction. Per-connection failures never surface
//! here; the relay handles them where they happen.

use std::io;

use thiserror::Error;

use crate::notify::NotifyError;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (bind, file access)
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Configuration file could not be parsed
    #[error("invalid configuration file: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Configuration parsed but failed validation
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Logging could not be installed
    #[error("logging setup failed: {0}")]
    Logging(String),

    /// Outage notifier could not be built
    #[error(transparent)]
    Notify(#[from] NotifyError),
}

impl Error {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }
}
