use thiserror::Error;
use vpn_forward::ForwardError;
use vpn_network::NetworkError;
use vpn_types::{CommonError, ErrorKind};
use vpn_wireguard::WireGuardError;

pub type Result<T> = std::result::Result<T, ServiceError>;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Forward error: {0}")]
    Forward(#[from] ForwardError),

    #[error("WireGuard error: {0}")]
    WireGuard(#[from] WireGuardError),

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error(transparent)]
    Common(#[from] CommonError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config parse error: {0}")]
    TomlDe(#[from] toml::de::Error),

    #[error("Config serialize error: {0}")]
    TomlSer(#[from] toml::ser::Error),
}

impl ServiceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ServiceError::Unauthorized(_) => ErrorKind::Unauthorized,
            ServiceError::Config(_) | ServiceError::TomlDe(_) => ErrorKind::Validation,
            ServiceError::Forward(e) => e.kind(),
            ServiceError::WireGuard(e) => e.kind(),
            ServiceError::Network(e) => e.kind(),
            ServiceError::Common(e) => e.kind(),
            ServiceError::Io(_) | ServiceError::TomlSer(_) => ErrorKind::Internal,
        }
    }

    /// The service cannot keep running: the state store is gone or the
    /// tunnel tooling is missing
    pub fn is_fatal(&self) -> bool {
        matches!(self.kind(), ErrorKind::Storage)
            || matches!(self, ServiceError::WireGuard(WireGuardError::ToolUnavailable(_)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds_pass_through() {
        let err: ServiceError = ForwardError::NotFound(7).into();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let err: ServiceError = WireGuardError::AlreadyRunning.into();
        assert_eq!(err.kind(), ErrorKind::AlreadyRunning);

        let err: ServiceError = NetworkError::PermissionDenied("root".into()).into();
        assert_eq!(err.kind(), ErrorKind::Permission);
    }

    #[test]
    fn test_fatal_conditions() {
        let storage: ServiceError = CommonError::storage("disk gone").into();
        assert!(storage.is_fatal());

        let missing: ServiceError = WireGuardError::ToolUnavailable("wg".into()).into();
        assert!(missing.is_fatal());

        assert!(!ServiceError::Unauthorized("anonymous".into()).is_fatal());
        let sync: ServiceError = WireGuardError::Sync("rejected".into()).into();
        assert!(!sync.is_fatal());
    }
}
