//! Symmetric encryption boundary for SFTP credentials and check numbers at
//! rest, trait-based like `infrastructure::sftp::SftpClient`.

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::RngCore;
use sha2_placeholder::derive_key;
use subtle::ConstantTimeEq;
use thiserror::Error;
use zeroize::Zeroizing;

#[derive(Debug, Error)]
pub enum EncryptionError {
    #[error("encryption key/salt not configured")]
    NotConfigured,
    #[error("ciphertext malformed or truncated")]
    Malformed,
    #[error("decryption failed")]
    DecryptionFailed,
}

pub trait Encryption: Send + Sync {
    fn encrypt(&self, plaintext: &str) -> Result<String, EncryptionError>;
    fn decrypt(&self, ciphertext: &str) -> Result<String, EncryptionError>;
}

/// AES-256-GCM implementation keyed from `encryption.key` + `encryption.salt`.
/// Ciphertext is hex-encoded `nonce || tag || bytes`.
pub struct AesGcmEncryption {
    cipher: Aes256Gcm,
}

impl AesGcmEncryption {
    pub fn new(key: &str, salt: &str) -> Result<Self, EncryptionError> {
        if key.trim().is_empty() || salt.trim().is_empty() {
            return Err(EncryptionError::NotConfigured);
        }
        let derived: Zeroizing<[u8; 32]> = Zeroizing::new(derive_key(key, salt));
        let cipher = Aes256Gcm::new_from_slice(derived.as_slice())
            .map_err(|_| EncryptionError::NotConfigured)?;
        Ok(Self { cipher })
    }
}

impl Encryption for AesGcmEncryption {
    fn encrypt(&self, plaintext: &str) -> Result<String, EncryptionError> {
        let mut nonce_bytes = [0u8; 12];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|_| EncryptionError::DecryptionFailed)?;
        let mut payload = nonce_bytes.to_vec();
        payload.extend_from_slice(&ciphertext);
        Ok(hex::encode(payload))
    }

    fn decrypt(&self, ciphertext: &str) -> Result<String, EncryptionError> {
        let raw = hex::decode(ciphertext).map_err(|_| EncryptionError::Malformed)?;
        if raw.len() < 12 {
            return Err(EncryptionError::Malformed);
        }
        let (nonce_bytes, body) = raw.split_at(12);
        let nonce = Nonce::from_slice(nonce_bytes);
        let plaintext = self
            .cipher
            .decrypt(nonce, body)
            .map_err(|_| EncryptionError::DecryptionFailed)?;
        String::from_utf8(plaintext).map_err(|_| EncryptionError::DecryptionFailed)
    }
}

/// Used (with a startup warning) when `encryption.key`/`encryption.salt` are
/// blank, per the configuration-surface table: credentials are stored in
/// plaintext rather than refusing to start.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEncryption;

impl Encryption for NoopEncryption {
    fn encrypt(&self, plaintext: &str) -> Result<String, EncryptionError> {
        Ok(plaintext.to_string())
    }

    fn decrypt(&self, ciphertext: &str) -> Result<String, EncryptionError> {
        Ok(ciphertext.to_string())
    }
}

/// Constant-time equality for check numbers / reservation boundaries, where a
/// timing side channel could otherwise leak how close a guess came.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

mod sha2_placeholder {
    //! Key derivation kept in one place so `AesGcmEncryption::new` can be
    //! reused without re-deriving by hand at every call site.
    use sha2::{Digest, Sha256};

    pub fn derive_key(key: &str, salt: &str) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(salt.as_bytes());
        hasher.update(key.as_bytes());
        hasher.finalize().into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_then_decrypt_round_trips() {
        let enc = AesGcmEncryption::new("test-key", "test-salt").unwrap();
        let ciphertext = enc.encrypt("s3cr3t-password").unwrap();
        assert_ne!(ciphertext, "s3cr3t-password");
        assert_eq!(enc.decrypt(&ciphertext).unwrap(), "s3cr3t-password");
    }

    #[test]
    fn new_rejects_blank_key_or_salt() {
        assert!(AesGcmEncryption::new("", "salt").is_err());
        assert!(AesGcmEncryption::new("key", "").is_err());
    }

    #[test]
    fn noop_encryption_passes_through() {
        let enc = NoopEncryption;
        let ciphertext = enc.encrypt("plain").unwrap();
        assert_eq!(ciphertext, "plain");
        assert_eq!(enc.decrypt(&ciphertext).unwrap(), "plain");
    }

    #[test]
    fn constant_time_eq_matches_and_rejects() {
        assert!(constant_time_eq("100045", "100045"));
        assert!(!constant_time_eq("100045", "100046"));
    }
}
