//! # strongbox-wallet: versioned wallet payload with checksum-guarded sync.
//!
//! Owns the single authoritative in-memory wallet payload and every
//! mutation to it: the V1–V4 version and double-encryption state machine,
//! optimistic-concurrency saves against a remote store, per-scheme address
//! index allocation and cross-scheme balance aggregation.
//!
//! # Modules
//!
//! - [`error`]: `WalletError` aggregate and its category tags
//! - [`payload`]: payload value, bodies, accounts, imported addresses, upgrades
//! - [`wrapper`]: outer encryption and checksum of the stored form
//! - [`sync`]: single-writer, commit-on-success synchronizer
//! - [`allocator`]: next-unused receive/change indexes per (xpub, scheme)
//! - [`balance`]: batched balance fetch and aggregation
//! - [`manager`]: `PayloadManager` facade
//! - [`encryption`]: AES-256-GCM + Argon2id `CipherService`
//! - [`keys`]: BIP-32 `KeyDerivation` (BIP-44 legacy, BIP-84 segwit)
//! - [`mnemonic`]: BIP-39 entropy and phrases
//! - [`remote`]: store failure classification, in-memory store
//! - [`config`]: layered `WalletConfig`
//! - [`logging`]: tracing subscriber setup

pub mod allocator;
pub mod balance;
pub mod config;
pub mod encryption;
pub mod error;
pub mod keys;
pub mod logging;
pub mod manager;
pub mod mnemonic;
pub mod payload;
pub mod remote;
pub mod sync;
pub mod wrapper;

// Re-exports for convenient access
pub use allocator::{AddressIndexAllocator, AddressIndexState};
pub use balance::BalanceAggregator;
pub use config::WalletConfig;
pub use encryption::AesGcmCipher;
pub use error::{ErrorCategory, WalletError};
pub use keys::Bip32Derivation;
pub use logging::init_logging;
pub use manager::PayloadManager;
pub use payload::{Account, ImportedAddress, Secret, WalletBody, WalletPayload};
pub use remote::{MemoryStore, classify_fetch_failure};
pub use sync::{Committed, PayloadSynchronizer, SyncContext};
