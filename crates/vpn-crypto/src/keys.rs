use crate::error::{CryptoError, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::rngs::OsRng;
use rand::RngCore;
use x25519_dalek::{PublicKey, StaticSecret};

const KEY_LEN: usize = 32;

#[derive(Clone)]
pub struct KeyPair {
    pub private_key: Vec<u8>,
    pub public_key: Vec<u8>,
}

impl KeyPair {
    /// WireGuard keys travel as standard padded base64
    pub fn private_key_base64(&self) -> String {
        BASE64.encode(&self.private_key)
    }

    pub fn public_key_base64(&self) -> String {
        BASE64.encode(&self.public_key)
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("private_key", &"<redacted>")
            .field("public_key", &self.public_key_base64())
            .finish()
    }
}

#[derive(Debug, Default)]
pub struct X25519KeyManager;

impl X25519KeyManager {
    pub fn new() -> Self {
        Self
    }

    pub fn generate_keypair(&self) -> Result<KeyPair> {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);

        let private_key = secret.to_bytes().to_vec();
        if private_key.iter().all(|&b| b == 0) {
            return Err(CryptoError::KeyGenerationError(
                "Random source produced an all-zero key".to_string(),
            ));
        }

        Ok(KeyPair {
            private_key,
            public_key: public.to_bytes().to_vec(),
        })
    }

    /// Random 32-byte symmetric key for the `PresharedKey` field
    pub fn generate_preshared_key(&self) -> Result<String> {
        let mut bytes = [0u8; KEY_LEN];
        OsRng
            .try_fill_bytes(&mut bytes)
            .map_err(|e| CryptoError::KeyGenerationError(e.to_string()))?;
        Ok(BASE64.encode(bytes))
    }

    pub fn derive_public_key(&self, private_key: &[u8]) -> Result<Vec<u8>> {
        let bytes = to_key_bytes(private_key, "Private key")?;
        let secret = StaticSecret::from(bytes);
        let public = PublicKey::from(&secret);

        Ok(public.to_bytes().to_vec())
    }

    pub fn from_base64(&self, private_base64: &str) -> Result<KeyPair> {
        let private_key = decode_key(private_base64, "Private key")?;
        let public_key = self.derive_public_key(&private_key)?;

        Ok(KeyPair {
            private_key,
            public_key,
        })
    }

    pub fn validate_keypair(&self, keypair: &KeyPair) -> Result<()> {
        let derived_public = self.derive_public_key(&keypair.private_key)?;

        if derived_public != keypair.public_key {
            return Err(CryptoError::InvalidKeyFormat(
                "Public key does not match private key".to_string(),
            ));
        }

        Ok(())
    }

    pub fn validate_public_key(&self, public_key_base64: &str) -> Result<()> {
        decode_key(public_key_base64, "Public key").map(|_| ())
    }

    pub fn validate_preshared_key(&self, preshared_key_base64: &str) -> Result<()> {
        decode_key(preshared_key_base64, "Preshared key").map(|_| ())
    }

    pub fn derive_public_key_base64(&self, private_key_base64: &str) -> Result<String> {
        let private_key = decode_key(private_key_base64, "Private key")?;
        let public_key = self.derive_public_key(&private_key)?;
        Ok(BASE64.encode(public_key))
    }
}

fn decode_key(encoded: &str, what: &str) -> Result<Vec<u8>> {
    let encoded = encoded.trim();
    if encoded.is_empty() {
        return Err(CryptoError::InvalidKeyFormat(format!("{} cannot be empty", what)));
    }

    let bytes = BASE64.decode(encoded).map_err(|e| {
        CryptoError::InvalidKeyFormat(format!("{}: invalid base64 encoding: {}", what, e))
    })?;
    to_key_bytes(&bytes, what)?;
    Ok(bytes)
}

fn to_key_bytes(bytes: &[u8], what: &str) -> Result<[u8; KEY_LEN]> {
    <[u8; KEY_LEN]>::try_from(bytes).map_err(|_| {
        CryptoError::InvalidKeyFormat(format!(
            "{} must be {} bytes, got {}",
            what,
            KEY_LEN,
            bytes.len()
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_generated_keypair_is_consistent() {
        let manager = X25519KeyManager::new();
        let keypair = manager.generate_keypair().unwrap();

        assert_eq!(keypair.private_key.len(), 32);
        assert_eq!(keypair.public_key.len(), 32);
        assert!(manager.validate_keypair(&keypair).is_ok());
        assert_eq!(keypair.public_key_base64().len(), 44);
        assert!(keypair.public_key_base64().ends_with('='));
    }

    #[test]
    fn test_from_base64_derives_same_public_key() {
        let manager = X25519KeyManager::new();
        let keypair = manager.generate_keypair().unwrap();

        let restored = manager.from_base64(&keypair.private_key_base64()).unwrap();
        assert_eq!(restored.public_key, keypair.public_key);
        assert_eq!(
            manager
                .derive_public_key_base64(&keypair.private_key_base64())
                .unwrap(),
            keypair.public_key_base64()
        );
    }

    #[test]
    fn test_public_key_validation() {
        let manager = X25519KeyManager::new();
        let keypair = manager.generate_keypair().unwrap();

        assert!(manager.validate_public_key(&keypair.public_key_base64()).is_ok());
        assert!(manager.validate_public_key("").is_err());
        assert!(manager.validate_public_key("not base64!").is_err());
        assert!(manager.validate_public_key(&BASE64.encode([7u8; 16])).is_err());
    }

    #[test]
    fn test_mismatched_keypair_rejected() {
        let manager = X25519KeyManager::new();
        let a = manager.generate_keypair().unwrap();
        let b = manager.generate_keypair().unwrap();

        let mixed = KeyPair {
            private_key: a.private_key.clone(),
            public_key: b.public_key.clone(),
        };
        assert!(manager.validate_keypair(&mixed).is_err());
    }

    #[test]
    fn test_preshared_key_is_valid_key() {
        let manager = X25519KeyManager::new();
        let psk = manager.generate_preshared_key().unwrap();
        assert!(manager.validate_preshared_key(&psk).is_ok());
    }

    #[test]
    fn test_debug_redacts_private_key() {
        let keypair = X25519KeyManager::new().generate_keypair().unwrap();
        let rendered = format!("{:?}", keypair);
        assert!(rendered.contains("<redacted>"));
        assert!(!rendered.contains(&keypair.private_key_base64()));
    }

    proptest! {
        #[test]
        fn prop_any_32_bytes_derive_a_valid_public_key(bytes in proptest::collection::vec(any::<u8>(), 32)) {
            let manager = X25519KeyManager::new();
            let public = manager.derive_public_key_base64(&BASE64.encode(&bytes)).unwrap();
            prop_assert!(manager.validate_public_key(&public).is_ok());
        }
    }
}
