//! Error taxonomy. One enum per failure category; every category is local
//! or remote in a fixed way, which callers use to decide whether to retry.
use thiserror::Error;

/// Local precondition failures. Always raised before any network call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("wallet payload not initialized")] Uninitialized,
    #[error("payload corrupted: {0}")] CorruptedPayload(String),
    #[error("device context not specified")] MissingDevice,
    #[error("unsupported wrapper version: {0}")] UnsupportedVersion(u8),
    #[error("wrapper version downgrade from {from} to {to}")] VersionDowngrade { from: u8, to: u8 },
    #[error("payload is at version {actual}, operation requires {required}")] WrongVersion { actual: u8, required: u8 },
    #[error("account not found: {0}")] AccountNotFound(usize),
    #[error("address index {index} already reserved as {existing:?}")] IndexAlreadyReserved { index: u32, existing: String },
    #[error("imported address already present: {0}")] DuplicateAddress(String),
    #[error("imported address not found: {0}")] AddressNotFound(String),
    #[error("default account cannot be archived")] ArchiveDefaultAccount,
    #[error("account {0} is archived")] AccountArchived(usize),
    #[error("second password already set")] SecondPasswordAlreadySet,
    #[error("second password required")] SecondPasswordRequired,
    #[error("invalid input: {0}")] InvalidInput(String),
}

/// Identity and password failures. Surfaced verbatim, never retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CredentialError {
    #[error("invalid wallet identifier or shared key")] InvalidCredentials,
    #[error("account locked: {0}")] AccountLocked(String),
    #[error("invalid password")] InvalidPassword,
    #[error("invalid second password")] InvalidSecondPassword,
}

/// Optimistic-concurrency failure on update.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConflictError {
    #[error("remote checksum does not match {expected}")] ChecksumMismatch { expected: String },
    #[error("local payload changed since candidate was built from {base}")] StaleCandidate { base: String },
}

/// Network or server failure. The whole read-modify-write cycle may be retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("server error: {0}")] Server(String),
    #[error("request timed out")] Timeout,
    #[error("request cancelled")] Cancelled,
    #[error("batch request failed: {0}")] BatchFailed(String),
}

/// Key-derivation library failure. Fatal for the operation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DerivationError {
    #[error("invalid seed: {0}")] InvalidSeed(String),
    #[error("invalid extended key: {0}")] InvalidExtendedKey(String),
    #[error("invalid private key: {0}")] InvalidPrivateKey(String),
    #[error("invalid mnemonic: {0}")] InvalidMnemonic(String),
    #[error("derivation failed: {0}")] Derivation(String),
    #[error("upgrade failed: {0}")] Upgrade(String),
}

/// Symmetric cipher failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CipherError {
    #[error("encryption: {0}")] Encryption(String),
    #[error("decryption failed")] Decryption,
    #[error("malformed ciphertext: {0}")] Malformed(String),
}
