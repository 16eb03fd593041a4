//! Error types for the server crate.

use hacknet_core::{FsError, PersistError};
use thiserror::Error;

/// Errors raised while configuring or running the server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Invalid configuration value
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Socket or file I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed JSON (config file or client message)
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Seeding a virtual filesystem failed
    #[error(transparent)]
    Fs(#[from] FsError),

    /// The tick driver task died
    #[error("tick driver failed: {0}")]
    Driver(String),

    /// Storage backend failure
    #[error(transparent)]
    Persist(#[from] PersistError),
}
