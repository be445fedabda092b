use thiserror::Error;
use vpn_types::{CommonError, ErrorKind};

#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Invalid port range: {0}")]
    InvalidRange(String),

    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("Scan cancelled after {completed} of {total} probes")]
    ScanCancelled { completed: usize, total: usize },

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Firewall operation failed: {0}")]
    FirewallError(String),

    #[error("Required tool '{0}' is not available")]
    ToolUnavailable(String),

    #[error("Command execution failed: {0}")]
    CommandError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error(transparent)]
    Common(#[from] CommonError),
}

impl NetworkError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            NetworkError::InvalidRange(_) | NetworkError::Validation(_) => ErrorKind::Validation,
            NetworkError::ScanCancelled { .. } => ErrorKind::Timeout,
            NetworkError::PermissionDenied(_) => ErrorKind::Permission,
            NetworkError::ToolUnavailable(_) => ErrorKind::Unavailable,
            NetworkError::FirewallError(_)
            | NetworkError::CommandError(_)
            | NetworkError::IoError(_) => ErrorKind::Internal,
            NetworkError::Common(e) => e.kind(),
        }
    }
}

pub type Result<T> = std::result::Result<T, NetworkError>;
