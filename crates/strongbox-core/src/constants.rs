//! Payload format constants. All monetary values in satoshis.

pub const COIN: u64 = 100_000_000;

/// Stretching iterations used by new wallets for the outer payload wrap
/// and for second-password encryption of secret fields.
pub const DEFAULT_PBKDF2_ITERATIONS: u32 = 5_000;

/// Iteration count implied by V1 wrappers, which carry no options block.
pub const V1_PBKDF2_ITERATIONS: u32 = 10;

/// Number of receive addresses past the next unused index that are sent to
/// the remote store when a public-key sync is requested.
pub const SYNC_LOOKAHEAD: u32 = 20;

/// Consecutive unused accounts checked before mnemonic recovery stops.
pub const RECOVERY_ACCOUNT_GAP: u32 = 5;

/// Bytes of BIP-39 entropy for a new wallet (12-word mnemonic).
pub const SEED_ENTROPY_LEN: usize = 16;

/// BIP-44 purpose for legacy P2PKH accounts.
pub const LEGACY_PURPOSE: u32 = 44;

/// BIP-84 purpose for native segwit P2WPKH accounts.
pub const SEGWIT_BECH32_PURPOSE: u32 = 84;

/// Server error text signalling an unknown guid / shared key pair.
pub const UNKNOWN_WALLET_MARKER: &str = "Unknown Wallet Identifier";

/// Server error text signalling a locked account.
pub const ACCOUNT_LOCKED_MARKER: &str = "locked";
