//! Common error types shared across crates

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Common result type
pub type Result<T> = std::result::Result<T, CommonError>;

/// Coarse classification every crate error maps onto.
///
/// The API layer uses this to pick a response status without matching on
/// every crate-specific variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    /// Malformed input, rejected before any side effect
    Validation,
    /// Duplicate listen address/port or duplicate peer key
    Conflict,
    /// Start requested on something already running
    AlreadyRunning,
    /// Operation not valid for the current lifecycle state
    InvalidState,
    /// The OS refused a socket bind
    Bind,
    /// The tunnel could not be brought up
    Start,
    /// A live change could not be pushed to the running tunnel
    Sync,
    /// Insufficient OS privilege
    Permission,
    /// Unknown id
    NotFound,
    /// Probe or connect timeout
    Timeout,
    /// Caller is not allowed to mutate state
    Unauthorized,
    /// Persistence backing store failed
    Storage,
    /// A required external tool is missing
    Unavailable,
    /// Anything else
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Conflict => "conflict",
            ErrorKind::AlreadyRunning => "already_running",
            ErrorKind::InvalidState => "invalid_state",
            ErrorKind::Bind => "bind",
            ErrorKind::Start => "start",
            ErrorKind::Sync => "sync",
            ErrorKind::Permission => "permission",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::Storage => "storage",
            ErrorKind::Unavailable => "unavailable",
            ErrorKind::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Common errors that can occur across crates
#[derive(Error, Debug)]
pub enum CommonError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Storage backend error
    #[error("Storage error: {0}")]
    Storage(String),
}

impl CommonError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            CommonError::Validation(_) => ErrorKind::Validation,
            CommonError::Io(_) | CommonError::Serialization(_) | CommonError::Storage(_) => {
                ErrorKind::Storage
            }
        }
    }
}

impl From<serde_json::Error> for CommonError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
