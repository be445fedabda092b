use thiserror::Error;
use vpn_crypto::CryptoError;
use vpn_types::{CommonError, ErrorKind};

pub type Result<T> = std::result::Result<T, WireGuardError>;

#[derive(Error, Debug)]
pub enum WireGuardError {
    #[error("Invalid configuration: {0}")]
    Validation(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Peer {0} not found")]
    PeerNotFound(u64),

    #[error("Interface is already up")]
    AlreadyRunning,

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Failed to start interface: {0}")]
    Start(String),

    #[error("Failed to stop interface: {0}")]
    Stop(String),

    #[error("Live peer update rejected: {0}")]
    Sync(String),

    #[error("No free address left in {0}")]
    AddressExhausted(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Tool not available: {0}")]
    ToolUnavailable(String),

    #[error("Command failed: {0}")]
    CommandError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Common(#[from] CommonError),
}

impl WireGuardError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            WireGuardError::Validation(_) => ErrorKind::Validation,
            WireGuardError::Conflict(_) | WireGuardError::AddressExhausted(_) => {
                ErrorKind::Conflict
            }
            WireGuardError::PeerNotFound(_) => ErrorKind::NotFound,
            WireGuardError::AlreadyRunning => ErrorKind::AlreadyRunning,
            WireGuardError::InvalidState(_) => ErrorKind::InvalidState,
            WireGuardError::Start(_) => ErrorKind::Start,
            WireGuardError::Sync(_) => ErrorKind::Sync,
            WireGuardError::PermissionDenied(_) => ErrorKind::Permission,
            WireGuardError::ToolUnavailable(_) => ErrorKind::Unavailable,
            WireGuardError::Stop(_) | WireGuardError::CommandError(_) | WireGuardError::Io(_) => {
                ErrorKind::Internal
            }
            WireGuardError::Crypto(e) => e.kind(),
            WireGuardError::Common(e) => e.kind(),
        }
    }
}
