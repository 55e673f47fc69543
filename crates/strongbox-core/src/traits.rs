//! Trait interfaces for the collaborators of the payload core.
//!
//! - [`CipherService`]: password-based encryption of opaque bytes
//! - [`KeyDerivation`]: extended keys, addresses and signing keys
//! - [`RemoteStore`]: authoritative storage of the wrapped payload
//! - [`ChainIndexer`]: batched balance and address-usage queries

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;

use crate::error::{CipherError, DerivationError, TransportError};
use crate::types::{BalanceEntry, Chain, ChainUsage, Checksum, DerivationScheme};

/// Password-based symmetric encryption with a configurable stretching cost.
pub trait CipherService: Send + Sync {
    /// Encrypt `plaintext` under `password`, stretching the password
    /// `iterations` times.
    fn encrypt(&self, plaintext: &[u8], password: &str, iterations: u32) -> Result<Vec<u8>, CipherError>;

    /// Reverse [`encrypt`](Self::encrypt). A wrong password or tampered
    /// input yields [`CipherError::Decryption`].
    fn decrypt(&self, ciphertext: &[u8], password: &str, iterations: u32) -> Result<Vec<u8>, CipherError>;

    /// Encrypt a UTF-8 field and hex-encode the result.
    ///
    /// Default implementation delegates to [`encrypt`](Self::encrypt).
    fn encrypt_field(&self, plaintext: &str, password: &str, iterations: u32) -> Result<String, CipherError> {
        Ok(hex::encode(self.encrypt(plaintext.as_bytes(), password, iterations)?))
    }

    /// Decrypt a field produced by [`encrypt_field`](Self::encrypt_field).
    fn decrypt_field(&self, ciphertext: &str, password: &str, iterations: u32) -> Result<String, CipherError> {
        let bytes = hex::decode(ciphertext).map_err(|e| CipherError::Malformed(e.to_string()))?;
        let plain = self.decrypt(&bytes, password, iterations)?;
        String::from_utf8(plain).map_err(|e| CipherError::Malformed(e.to_string()))
    }
}

/// Account-level key pair in serialized extended-key form.
#[derive(Clone, PartialEq, Eq)]
pub struct AccountKeys {
    pub xpriv: String,
    pub xpub: String,
}

impl fmt::Debug for AccountKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccountKeys")
            .field("xpriv", &"[REDACTED]")
            .field("xpub", &self.xpub)
            .finish()
    }
}

/// Hierarchical key derivation. Implemented by the BIP-32 adapter in
/// strongbox-wallet; tests substitute failing implementations.
pub trait KeyDerivation: Send + Sync {
    /// Derive the account-level keys for `account_index` under `scheme`
    /// from a BIP-39 seed.
    fn account_keys(
        &self,
        seed: &[u8],
        scheme: DerivationScheme,
        account_index: u32,
    ) -> Result<AccountKeys, DerivationError>;

    /// Address at `index` on `chain` of an account xpub.
    fn address_at(
        &self,
        xpub: &str,
        scheme: DerivationScheme,
        chain: Chain,
        index: u32,
    ) -> Result<String, DerivationError>;

    /// Signing key (WIF) at `index` on `chain` of an account xpriv.
    fn signing_key(&self, xpriv: &str, chain: Chain, index: u32) -> Result<String, DerivationError>;

    /// Address controlled by a WIF private key.
    fn address_for_key(&self, wif: &str, scheme: DerivationScheme) -> Result<String, DerivationError>;

    /// Receive addresses in `[start, start + count)`.
    ///
    /// Default implementation calls [`address_at`](Self::address_at) per index.
    fn receive_addresses(
        &self,
        xpub: &str,
        scheme: DerivationScheme,
        start: u32,
        count: u32,
    ) -> Result<Vec<String>, DerivationError> {
        (start..start.saturating_add(count))
            .map(|i| self.address_at(xpub, scheme, Chain::Receive, i))
            .collect()
    }
}

/// Failure reported by a [`RemoteStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The stored checksum differs from the `old_checksum` of an update.
    ChecksumMismatch,
    /// Any other rejection, carrying the server-provided message text.
    Rejected(String),
    Timeout,
    Cancelled,
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ChecksumMismatch => write!(f, "checksum mismatch"),
            Self::Rejected(msg) => write!(f, "rejected: {msg}"),
            Self::Timeout => write!(f, "timeout"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// First write of a wallet. The server treats the missing old checksum as
/// "create".
#[derive(Debug, Clone)]
pub struct InsertRequest {
    pub guid: String,
    pub shared_key: String,
    pub payload: String,
    pub checksum: Checksum,
    pub email: String,
    pub device: String,
}

/// Checksum-guarded replacement of a stored wallet.
#[derive(Debug, Clone)]
pub struct UpdateRequest {
    pub guid: String,
    pub shared_key: String,
    pub sync_addresses: Vec<String>,
    pub payload: String,
    pub new_checksum: Checksum,
    pub old_checksum: Checksum,
    pub device: String,
}

/// Authoritative storage of the wrapped payload, keyed by guid + shared key.
///
/// Retry and backoff are the implementation's concern; every call here is a
/// single attempt from the caller's point of view.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Fetch the wrapped payload JSON.
    async fn fetch(&self, guid: &str, shared_key: &str) -> Result<String, StoreError>;

    /// Create a new wallet record.
    async fn insert(&self, request: InsertRequest) -> Result<(), StoreError>;

    /// Replace the stored payload. Must fail with
    /// [`StoreError::ChecksumMismatch`] when the stored checksum is not
    /// `request.old_checksum`.
    async fn update(&self, request: UpdateRequest) -> Result<(), StoreError>;
}

/// Read-only chain queries keyed by xpub or address.
#[async_trait]
pub trait ChainIndexer: Send + Sync {
    /// Balances for every key in one batched request. Keys unknown to the
    /// indexer may be absent from the result.
    async fn balances(&self, keys: &[String]) -> Result<HashMap<String, BalanceEntry>, TransportError>;

    /// Next unused receive/change index for each xpub.
    async fn usage(&self, xpubs: &[String]) -> Result<HashMap<String, ChainUsage>, TransportError>;
}
