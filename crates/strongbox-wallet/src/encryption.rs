//! AES-256-GCM payload encryption with Argon2id key stretching.
//!
//! The stretching iteration count travels with the payload (wrapper
//! options), so it maps onto the Argon2id time cost while the memory cost
//! stays fixed.
//!
//! # Wire format
//! ```text
//! salt (16 bytes) || nonce (12 bytes) || ciphertext + auth_tag
//! ```

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use argon2::{Algorithm, Argon2, Params, Version};
use zeroize::Zeroizing;

use strongbox_core::error::CipherError;
use strongbox_core::traits::CipherService;

/// Salt length in bytes.
const SALT_LEN: usize = 16;

/// AES-GCM nonce length in bytes.
const NONCE_LEN: usize = 12;

/// Minimum encrypted payload size (salt + nonce + auth tag).
const MIN_ENCRYPTED_LEN: usize = SALT_LEN + NONCE_LEN + 16;

/// Argon2id memory cost in KiB.
const ARGON2_MEMORY_KIB: u32 = 64;

/// Derive a 256-bit encryption key from a password and salt using Argon2id
/// with `iterations` passes.
pub fn derive_key(password: &[u8], salt: &[u8], iterations: u32) -> Result<Zeroizing<[u8; 32]>, CipherError> {
    let params = Params::new(ARGON2_MEMORY_KIB, iterations, 1, Some(32))
        .map_err(|e| CipherError::Encryption(format!("key stretching: {e}")))?;
    let argon = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
    let mut key = Zeroizing::new([0u8; 32]);
    argon
        .hash_password_into(password, salt, &mut *key)
        .map_err(|e| CipherError::Encryption(format!("key stretching: {e}")))?;
    Ok(key)
}

/// [`CipherService`] backed by AES-256-GCM.
#[derive(Debug, Clone, Copy, Default)]
pub struct AesGcmCipher;

impl CipherService for AesGcmCipher {
    /// Generates a random salt and nonce. Returns
    /// `salt || nonce || ciphertext+tag`.
    fn encrypt(&self, plaintext: &[u8], password: &str, iterations: u32) -> Result<Vec<u8>, CipherError> {
        use rand::RngCore;
        let mut salt = [0u8; SALT_LEN];
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut salt);
        rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);

        let key = derive_key(password.as_bytes(), &salt, iterations)?;
        let cipher = Aes256Gcm::new_from_slice(&key[..])
            .map_err(|e| CipherError::Encryption(e.to_string()))?;
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext)
            .map_err(|e| CipherError::Encryption(e.to_string()))?;

        let mut result = Vec::with_capacity(SALT_LEN + NONCE_LEN + ciphertext.len());
        result.extend_from_slice(&salt);
        result.extend_from_slice(&nonce_bytes);
        result.extend_from_slice(&ciphertext);
        Ok(result)
    }

    /// Returns [`CipherError::Decryption`] if the password or iteration
    /// count is wrong (authentication tag mismatch).
    fn decrypt(&self, encrypted: &[u8], password: &str, iterations: u32) -> Result<Vec<u8>, CipherError> {
        if encrypted.len() < MIN_ENCRYPTED_LEN {
            return Err(CipherError::Malformed(format!(
                "encrypted data too short: {} < {MIN_ENCRYPTED_LEN}",
                encrypted.len()
            )));
        }

        let salt = &encrypted[..SALT_LEN];
        let nonce_bytes = &encrypted[SALT_LEN..SALT_LEN + NONCE_LEN];
        let ciphertext = &encrypted[SALT_LEN + NONCE_LEN..];

        let key = derive_key(password.as_bytes(), salt, iterations)?;
        let cipher = Aes256Gcm::new_from_slice(&key[..]).map_err(|_| CipherError::Decryption)?;
        let nonce = Nonce::from_slice(nonce_bytes);

        cipher.decrypt(nonce, ciphertext).map_err(|_| CipherError::Decryption)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const IT: u32 = 2;

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let password = "correct horse battery staple";
        let plaintext = b"secret wallet data";

        let encrypted = AesGcmCipher.encrypt(plaintext, password, IT).unwrap();
        let decrypted = AesGcmCipher.decrypt(&encrypted, password, IT).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn encrypt_decrypt_empty_data() {
        let encrypted = AesGcmCipher.encrypt(b"", "password", IT).unwrap();
        let decrypted = AesGcmCipher.decrypt(&encrypted, "password", IT).unwrap();
        assert!(decrypted.is_empty());
    }

    #[test]
    fn wrong_password_fails() {
        let encrypted = AesGcmCipher.encrypt(b"secret", "correct", IT).unwrap();
        let err = AesGcmCipher.decrypt(&encrypted, "wrong", IT).unwrap_err();
        assert_eq!(err, CipherError::Decryption);
    }

    #[test]
    fn wrong_iterations_fail() {
        let encrypted = AesGcmCipher.encrypt(b"secret", "pw", 2).unwrap();
        let err = AesGcmCipher.decrypt(&encrypted, "pw", 3).unwrap_err();
        assert_eq!(err, CipherError::Decryption);
    }

    #[test]
    fn zero_iterations_rejected() {
        let err = AesGcmCipher.encrypt(b"secret", "pw", 0).unwrap_err();
        assert!(matches!(err, CipherError::Encryption(_)));
    }

    #[test]
    fn truncated_data_fails() {
        let err = AesGcmCipher.decrypt(&[0u8; 10], "password", IT).unwrap_err();
        assert!(matches!(err, CipherError::Malformed(_)));
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let mut encrypted = AesGcmCipher.encrypt(b"secret data", "password", IT).unwrap();
        let last = encrypted.len() - 1;
        encrypted[last] ^= 0xFF;

        let err = AesGcmCipher.decrypt(&encrypted, "password", IT).unwrap_err();
        assert_eq!(err, CipherError::Decryption);
    }

    #[test]
    fn tampered_salt_fails() {
        let mut encrypted = AesGcmCipher.encrypt(b"secret", "password", IT).unwrap();
        encrypted[0] ^= 0xFF;

        let err = AesGcmCipher.decrypt(&encrypted, "password", IT).unwrap_err();
        assert_eq!(err, CipherError::Decryption);
    }

    #[test]
    fn derive_key_deterministic() {
        let key1 = derive_key(b"password", b"saltsaltsalt", IT).unwrap();
        let key2 = derive_key(b"password", b"saltsaltsalt", IT).unwrap();
        assert_eq!(*key1, *key2);
    }

    #[test]
    fn derive_key_depends_on_iterations() {
        let key1 = derive_key(b"password", b"saltsaltsalt", 1).unwrap();
        let key2 = derive_key(b"password", b"saltsaltsalt", 2).unwrap();
        assert_ne!(*key1, *key2);
    }

    #[test]
    fn encrypted_has_correct_overhead() {
        let encrypted = AesGcmCipher.encrypt(b"hello", "password", IT).unwrap();
        // salt(16) + nonce(12) + plaintext(5) + tag(16) = 49
        assert_eq!(encrypted.len(), SALT_LEN + NONCE_LEN + 5 + 16);
    }
}
