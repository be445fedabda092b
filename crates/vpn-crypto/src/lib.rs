pub mod error;
pub mod keys;
pub mod qr;

pub use error::{CryptoError, Result};
pub use keys::{KeyPair, X25519KeyManager};
pub use qr::{ErrorCorrectionLevel, QrCodeGenerator};
