//! Error types for the forwarding engine

use std::net::SocketAddr;
use thiserror::Error;
use vpn_types::{CommonError, ErrorKind};

pub type Result<T> = std::result::Result<T, ForwardError>;

#[derive(Error, Debug)]
pub enum ForwardError {
    #[error("Invalid rule: {0}")]
    Validation(String),

    #[error("Listen address conflict: {0}")]
    Conflict(String),

    #[error("Forward rule {0} not found")]
    NotFound(u64),

    #[error("Forward rule {0} is already running")]
    AlreadyRunning(u64),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Upstream connection to {0} failed: {1}")]
    Upstream(String, String),

    #[error("Connect to {0} timed out")]
    ConnectTimeout(SocketAddr),

    #[error("Metrics error: {0}")]
    Metrics(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Common(#[from] CommonError),
}

impl ForwardError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ForwardError::Validation(_) => ErrorKind::Validation,
            ForwardError::Conflict(_) => ErrorKind::Conflict,
            ForwardError::NotFound(_) => ErrorKind::NotFound,
            ForwardError::AlreadyRunning(_) => ErrorKind::AlreadyRunning,
            ForwardError::InvalidState(_) => ErrorKind::InvalidState,
            ForwardError::Bind { source, .. } => {
                if source.kind() == std::io::ErrorKind::PermissionDenied {
                    ErrorKind::Permission
                } else {
                    ErrorKind::Bind
                }
            }
            ForwardError::ConnectTimeout(_) => ErrorKind::Timeout,
            ForwardError::Upstream(..) | ForwardError::Metrics(_) | ForwardError::Io(_) => {
                ErrorKind::Internal
            }
            ForwardError::Common(e) => e.kind(),
        }
    }
}

impl From<prometheus::Error> for ForwardError {
    fn from(err: prometheus::Error) -> Self {
        Self::Metrics(err.to_string())
    }
}
