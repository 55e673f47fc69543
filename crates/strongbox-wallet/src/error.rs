//! Wallet error types.

use strongbox_core::error::{
    CipherError, ConflictError, CredentialError, DerivationError, TransportError, ValidationError,
};
use thiserror::Error;

/// Coarse classification of a [`WalletError`], used by callers to decide
/// whether a failure is local, retryable, or fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Validation,
    Credential,
    Conflict,
    Transport,
    Derivation,
    Cipher,
}

/// Errors that can occur in payload operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WalletError {
    /// Local precondition failure; nothing was sent.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Bad identity, locked account, or wrong (second) password.
    #[error(transparent)]
    Credential(#[from] CredentialError),

    /// Another writer updated the payload first.
    #[error(transparent)]
    Conflict(#[from] ConflictError),

    /// Network or server failure.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Key-derivation failure.
    #[error(transparent)]
    Derivation(#[from] DerivationError),

    /// Cipher service failure outside of password checks.
    #[error(transparent)]
    Cipher(#[from] CipherError),
}

impl WalletError {
    /// Category tag of this error.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Validation(_) => ErrorCategory::Validation,
            Self::Credential(_) => ErrorCategory::Credential,
            Self::Conflict(_) => ErrorCategory::Conflict,
            Self::Transport(_) => ErrorCategory::Transport,
            Self::Derivation(_) => ErrorCategory::Derivation,
            Self::Cipher(_) => ErrorCategory::Cipher,
        }
    }

    /// Whether repeating the full read-modify-write cycle may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self.category(), ErrorCategory::Conflict | ErrorCategory::Transport)
    }

    pub(crate) fn corrupted(detail: impl Into<String>) -> Self {
        Self::Validation(ValidationError::CorruptedPayload(detail.into()))
    }
}
