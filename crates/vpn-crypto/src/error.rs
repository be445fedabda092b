use thiserror::Error;
use vpn_types::ErrorKind;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Key generation failed: {0}")]
    KeyGenerationError(String),

    #[error("Encoding error: {0}")]
    EncodingError(String),

    #[error("QR code generation failed: {0}")]
    QrCodeError(String),

    #[error("Invalid key format: {0}")]
    InvalidKeyFormat(String),

    #[error("Base64 decode error: {0}")]
    Base64Error(#[from] base64::DecodeError),

    #[error("Image error: {0}")]
    ImageError(#[from] image::ImageError),
}

impl CryptoError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CryptoError::InvalidKeyFormat(_) | CryptoError::Base64Error(_) => ErrorKind::Validation,
            CryptoError::KeyGenerationError(_)
            | CryptoError::EncodingError(_)
            | CryptoError::QrCodeError(_)
            | CryptoError::ImageError(_) => ErrorKind::Internal,
        }
    }
}

pub type Result<T> = std::result::Result<T, CryptoError>;
