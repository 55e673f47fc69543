//! Secret-bearing fields and second-password (double) encryption.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use zeroize::Zeroizing;

use strongbox_core::error::{CipherError, CredentialError};
use strongbox_core::traits::CipherService;

use crate::error::WalletError;

/// A seed, extended private key or imported private key, either in the
/// clear or encrypted under the second password.
///
/// The variant is explicit on the wire so that a mixed state can be
/// detected without trial decryption.
#[derive(Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(untagged)]
pub enum Secret {
    Encrypted { encrypted: String },
    Plain(String),
}

impl Secret {
    pub fn plain(value: impl Into<String>) -> Self {
        Self::Plain(value.into())
    }

    pub fn is_encrypted(&self) -> bool {
        matches!(self, Self::Encrypted { .. })
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Encrypted { .. } => f.write_str("Secret::Encrypted([REDACTED])"),
            Self::Plain(_) => f.write_str("Secret::Plain([REDACTED])"),
        }
    }
}

/// Encrypts and decrypts secret fields under `shared_key || second_password`.
pub struct FieldCipher<'a> {
    cipher: &'a dyn CipherService,
    key: Zeroizing<String>,
    iterations: u32,
}

impl<'a> FieldCipher<'a> {
    pub fn new(cipher: &'a dyn CipherService, shared_key: &str, second_password: &str, iterations: u32) -> Self {
        Self {
            cipher,
            key: Zeroizing::new(format!("{shared_key}{second_password}")),
            iterations,
        }
    }

    /// Encrypt a clear value.
    pub fn seal(&self, value: &str) -> Result<Secret, WalletError> {
        let encrypted = self.cipher.encrypt_field(value, &self.key, self.iterations)?;
        Ok(Secret::Encrypted { encrypted })
    }

    /// Reveal a secret. Clear values are returned as is.
    pub fn open(&self, secret: &Secret) -> Result<Zeroizing<String>, WalletError> {
        match secret {
            Secret::Plain(value) => Ok(Zeroizing::new(value.clone())),
            Secret::Encrypted { encrypted } => self
                .cipher
                .decrypt_field(encrypted, &self.key, self.iterations)
                .map(Zeroizing::new)
                .map_err(map_second_password_error),
        }
    }

    /// Encrypt a secret unless it already is.
    pub fn lock(&self, secret: &Secret) -> Result<Secret, WalletError> {
        match secret {
            Secret::Plain(value) => self.seal(value),
            Secret::Encrypted { .. } => Ok(secret.clone()),
        }
    }

    /// Decrypt a secret into its clear form.
    pub fn unlock(&self, secret: &Secret) -> Result<Secret, WalletError> {
        Ok(Secret::Plain(self.open(secret)?.to_string()))
    }
}

fn map_second_password_error(err: CipherError) -> WalletError {
    match err {
        CipherError::Decryption => CredentialError::InvalidSecondPassword.into(),
        other => other.into(),
    }
}

/// Reveal `secret` with an optional field cipher. An encrypted secret
/// without a cipher means the caller did not supply the second password.
pub fn reveal(secret: &Secret, fields: Option<&FieldCipher<'_>>) -> Result<Zeroizing<String>, WalletError> {
    match (secret, fields) {
        (Secret::Plain(value), _) => Ok(Zeroizing::new(value.clone())),
        (Secret::Encrypted { .. }, Some(fields)) => fields.open(secret),
        (Secret::Encrypted { .. }, None) => Err(CredentialError::InvalidSecondPassword.into()),
    }
}

/// Store a new clear value, encrypting it when a field cipher is active.
pub fn protect(value: &str, fields: Option<&FieldCipher<'_>>) -> Result<Secret, WalletError> {
    match fields {
        Some(fields) => fields.seal(value),
        None => Ok(Secret::plain(value)),
    }
}

/// Iterated SHA-256 of `shared_key || second_password`, hex-encoded. Kept as
/// a fallback reference for wallets without any encrypted field.
pub fn second_password_hash(shared_key: &str, second_password: &str, iterations: u32) -> String {
    let mut digest = Sha256::digest(format!("{shared_key}{second_password}").as_bytes());
    for _ in 1..iterations.max(1) {
        digest = Sha256::digest(digest);
    }
    hex::encode(digest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encryption::AesGcmCipher;

    #[test]
    fn serde_shapes() {
        let plain = serde_json::to_string(&Secret::plain("abc")).unwrap();
        assert_eq!(plain, "\"abc\"");
        let enc = serde_json::to_string(&Secret::Encrypted { encrypted: "ff".into() }).unwrap();
        assert_eq!(enc, "{\"encrypted\":\"ff\"}");

        let back: Secret = serde_json::from_str(&enc).unwrap();
        assert!(back.is_encrypted());
        let back: Secret = serde_json::from_str(&plain).unwrap();
        assert!(!back.is_encrypted());
    }

    #[test]
    fn debug_redacts() {
        let debug = format!("{:?}", Secret::plain("xprv-secret"));
        assert!(!debug.contains("xprv"));
        assert!(debug.contains("REDACTED"));
    }

    #[test]
    fn seal_open_roundtrip() {
        let fc = FieldCipher::new(&AesGcmCipher, "shared", "second", 1);
        let sealed = fc.seal("seed-hex").unwrap();
        assert!(sealed.is_encrypted());
        assert_eq!(fc.open(&sealed).unwrap().as_str(), "seed-hex");
    }

    #[test]
    fn wrong_second_password_is_credential_error() {
        let fc = FieldCipher::new(&AesGcmCipher, "shared", "second", 1);
        let sealed = fc.seal("seed-hex").unwrap();
        let wrong = FieldCipher::new(&AesGcmCipher, "shared", "other", 1);
        assert_eq!(
            wrong.open(&sealed).unwrap_err(),
            WalletError::Credential(CredentialError::InvalidSecondPassword)
        );
    }

    #[test]
    fn lock_unlock_idempotent() {
        let fc = FieldCipher::new(&AesGcmCipher, "shared", "pw", 1);
        let locked = fc.lock(&Secret::plain("k")).unwrap();
        let relocked = fc.lock(&locked).unwrap();
        assert_eq!(locked, relocked);
        assert_eq!(fc.unlock(&locked).unwrap(), Secret::plain("k"));
        assert_eq!(fc.unlock(&Secret::plain("k")).unwrap(), Secret::plain("k"));
    }

    #[test]
    fn reveal_requires_cipher_for_encrypted() {
        let fc = FieldCipher::new(&AesGcmCipher, "shared", "pw", 1);
        let locked = fc.seal("k").unwrap();
        assert_eq!(
            reveal(&locked, None).unwrap_err(),
            WalletError::Credential(CredentialError::InvalidSecondPassword)
        );
        assert_eq!(reveal(&locked, Some(&fc)).unwrap().as_str(), "k");
        assert_eq!(reveal(&Secret::plain("k"), None).unwrap().as_str(), "k");
    }

    #[test]
    fn protect_follows_cipher_presence() {
        let fc = FieldCipher::new(&AesGcmCipher, "shared", "pw", 1);
        assert!(protect("k", Some(&fc)).unwrap().is_encrypted());
        assert!(!protect("k", None).unwrap().is_encrypted());
    }

    #[test]
    fn password_hash_deterministic_and_keyed() {
        let a = second_password_hash("shared", "pw", 10);
        assert_eq!(a, second_password_hash("shared", "pw", 10));
        assert_ne!(a, second_password_hash("shared", "pw2", 10));
        assert_ne!(a, second_password_hash("shared", "pw", 11));
        assert_eq!(a.len(), 64);
    }
}
