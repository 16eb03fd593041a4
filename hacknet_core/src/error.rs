//! Error taxonomy of the scheduler.
//!
//! - [`DispatchError`]: fatal to one command, reported to its origin
//! - [`TaskError`]: fatal to one process, logged and force-completed
//! - [`KillError`]: a kill request that did not go through
//! - [`FsError`]: virtual filesystem lookups, reported by the calling program
//! - [`PersistError`]: storage failures, logged and retried next interval

use hacknet_env::{Pid, SystemId};
use thiserror::Error;

/// A command could not be turned into a process.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("not logged in")]
    NotLoggedIn,

    #[error("unknown system: {0}")]
    UnknownSystem(String),

    #[error("{0}: command not found")]
    CommandNotFound(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("login failed for {user}@{hostname}")]
    LoginFailed { user: String, hostname: String },

    #[error("empty command")]
    EmptyCommand,

    #[error("{program}: failed to start: {reason}")]
    StartFailed { program: String, reason: String },
}

/// A process step failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    #[error("step failed: {0}")]
    Failed(String),

    #[error("step panicked: {0}")]
    Panicked(String),
}

impl TaskError {
    /// Creates a step failure.
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }
}

/// A kill request was refused or had nothing to kill.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KillError {
    #[error("no such process: {pid} on {system}")]
    NoSuchProcess { system: SystemId, pid: Pid },

    #[error("process {pid} did not terminate")]
    Vetoed { pid: Pid },

    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

/// Virtual filesystem failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FsError {
    #[error("{0}: no such file or directory")]
    NotFound(String),

    #[error("{0}: not a directory")]
    NotADirectory(String),

    #[error("{0}: is a directory")]
    IsADirectory(String),
}

/// Persistence failures.
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}
