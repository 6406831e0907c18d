/// Field-level encryption for sensitive identity attributes.
///
/// Recovery emails and mobile numbers are stored as AES-256-GCM ciphertext
/// in the format `v1:nonce:ciphertext` (all base64). Equality lookups on
/// recovery emails go through a deterministic SHA-256 blind index computed
/// over the normalised value, so uniqueness can be enforced without ever
/// decrypting the column.
use aes_gcm::{
    Aes256Gcm, Key, Nonce,
    aead::{Aead, KeyInit},
};
use base64::{Engine as _, engine::general_purpose};
use ring::rand::SecureRandom;

use crate::error::{Error, Result};

const NONCE_SIZE: usize = 12; // 96 bits for GCM
const KEY_SIZE: usize = 32; // 256 bits
const VERSION_PREFIX: &str = "v1:"; // Version tag for key rotation

#[derive(Clone)]
pub struct EncryptionManager {
    cipher: Aes256Gcm,
    version: String,
}

impl EncryptionManager {
    /// Build from the base64-encoded 256-bit key in configuration.
    pub fn new(key_b64: &str) -> Result<Self> {
        let key_bytes = general_purpose::STANDARD
            .decode(key_b64)
            .map_err(|_| Error::Internal("ENCRYPTION_KEY must be valid base64".to_string()))?;

        if key_bytes.len() != KEY_SIZE {
            return Err(Error::Internal(format!(
                "ENCRYPTION_KEY must be {} bytes (got {}). Generate with: openssl rand -base64 32",
                KEY_SIZE,
                key_bytes.len()
            )));
        }

        let key = Key::<Aes256Gcm>::from_slice(&key_bytes);

        Ok(Self {
            cipher: Aes256Gcm::new(key),
            version: VERSION_PREFIX.to_string(),
        })
    }

    /// Encrypt plaintext; returns `v1:nonce:ciphertext`.
    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        ring::rand::SystemRandom::new()
            .fill(&mut nonce_bytes)
            .map_err(|_| Error::Internal("Failed to generate nonce".to_string()))?;

        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| Error::Internal(format!("Encryption failed: {}", e)))?;

        let nonce_b64 = general_purpose::STANDARD.encode(nonce_bytes);
        let ciphertext_b64 = general_purpose::STANDARD.encode(&ciphertext);

        Ok(format!("{}{}:{}", self.version, nonce_b64, ciphertext_b64))
    }

    /// Decrypt `v1:nonce:ciphertext`; authentication failure means a wrong
    /// key or tampered data.
    pub fn decrypt(&self, encrypted: &str) -> Result<String> {
        let without_version = encrypted.strip_prefix(VERSION_PREFIX).ok_or_else(|| {
            Error::Internal("Invalid encryption format: missing version prefix".to_string())
        })?;

        let parts: Vec<&str> = without_version.split(':').collect();
        if parts.len() != 2 {
            return Err(Error::Internal(
                "Invalid encryption format: expected nonce:ciphertext".to_string(),
            ));
        }

        let nonce_bytes = general_purpose::STANDARD
            .decode(parts[0])
            .map_err(|e| Error::Internal(format!("Invalid nonce encoding: {}", e)))?;

        if nonce_bytes.len() != NONCE_SIZE {
            return Err(Error::Internal(format!(
                "Invalid nonce size: expected {}, got {}",
                NONCE_SIZE,
                nonce_bytes.len()
            )));
        }

        let ciphertext = general_purpose::STANDARD
            .decode(parts[1])
            .map_err(|e| Error::Internal(format!("Invalid ciphertext encoding: {}", e)))?;

        let nonce = Nonce::from_slice(&nonce_bytes);

        let plaintext_bytes = self
            .cipher
            .decrypt(nonce, ciphertext.as_ref())
            .map_err(|_| {
                Error::Internal("Decryption failed (wrong key or corrupted data)".to_string())
            })?;

        String::from_utf8(plaintext_bytes)
            .map_err(|e| Error::Internal(format!("Decrypted data is not valid UTF-8: {}", e)))
    }

    pub fn is_encrypted(data: &str) -> bool {
        data.starts_with(VERSION_PREFIX)
    }
}

/// Deterministic blind index over a normalised email: SHA-256, hex-encoded,
/// 64 characters. Stable across the deployment so uniqueness lookups hit
/// the same value from any instance.
pub fn blind_index(normalised: &str) -> String {
    let digest = ring::digest::digest(&ring::digest::SHA256, normalised.as_bytes());
    hex::encode(digest)
}

/// Email normalisation used everywhere an address becomes a lookup key:
/// trim then locale-insensitive lower-case.
pub fn normalise_email(email: &str) -> String {
    email.trim().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_manager() -> EncryptionManager {
        EncryptionManager::new("AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=").unwrap()
    }

    #[test]
    fn test_encrypt_decrypt() {
        let encryption = test_manager();

        let plaintext = "backup@example.com";
        let encrypted = encryption.encrypt(plaintext).unwrap();

        assert!(encrypted.starts_with("v1:"));
        assert_eq!(encryption.decrypt(&encrypted).unwrap(), plaintext);
    }

    #[test]
    fn test_encrypt_produces_different_ciphertexts() {
        let encryption = test_manager();

        let encrypted1 = encryption.encrypt("same data").unwrap();
        let encrypted2 = encryption.encrypt("same data").unwrap();

        // Different nonces, same plaintext
        assert_ne!(encrypted1, encrypted2);
        assert_eq!(encryption.decrypt(&encrypted1).unwrap(), "same data");
        assert_eq!(encryption.decrypt(&encrypted2).unwrap(), "same data");
    }

    #[test]
    fn test_decrypt_rejects_bad_input() {
        let encryption = test_manager();

        assert!(encryption.decrypt("invalid").is_err());
        assert!(encryption.decrypt("v1:onlyonepart").is_err());

        let mut corrupted = encryption.encrypt("test data").unwrap();
        corrupted.push('x');
        assert!(encryption.decrypt(&corrupted).is_err());
    }

    #[test]
    fn test_bad_keys_rejected() {
        assert!(EncryptionManager::new("not-base64!!!").is_err());
        assert!(EncryptionManager::new("dG9vc2hvcnQ=").is_err());
    }

    #[test]
    fn test_blind_index_deterministic() {
        let a = blind_index("backup@example.com");
        let b = blind_index("backup@example.com");
        let c = blind_index("other@example.com");

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|ch| ch.is_ascii_hexdigit()));
    }

    #[test]
    fn test_normalise_email() {
        assert_eq!(normalise_email("  User@Example.COM  "), "user@example.com");
        assert_eq!(
            blind_index(&normalise_email("User@Example.com")),
            blind_index("user@example.com")
        );
    }
}
