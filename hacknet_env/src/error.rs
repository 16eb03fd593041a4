//! Error types for the hacknet environment abstraction.

use crate::types::ContextId;
use thiserror::Error;

/// Errors that can occur in the environment abstraction layer.
#[derive(Debug, Error)]
pub enum EnvError {
    /// The connection behind a person context has gone away
    #[error("Context closed: {0}")]
    ContextClosed(ContextId),

    /// Event serialization/deserialization failed
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Context operation failed
    #[error("Context error: {0}")]
    ContextError(String),
}

impl EnvError {
    /// Creates a context-closed error.
    pub fn closed(id: ContextId) -> Self {
        Self::ContextClosed(id)
    }

    /// Creates a serialization error.
    pub fn serialization(msg: impl std::fmt::Display) -> Self {
        Self::SerializationError(msg.to_string())
    }
}
