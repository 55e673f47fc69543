//! Core value types shared by the payload, synchronizer and caches.
//!
//! All monetary values are in satoshis (1 BTC = 10^8 satoshis).

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::constants::{LEGACY_PURPOSE, SEGWIT_BECH32_PURPOSE};
use crate::error::ValidationError;

/// Address format family. Each scheme has its own derivation path and
/// its own, independent index space.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DerivationScheme {
    /// BIP-44 P2PKH.
    #[serde(rename = "legacy")]
    Legacy,
    /// BIP-84 native segwit P2WPKH.
    #[serde(rename = "bech32")]
    SegwitBech32,
}

impl DerivationScheme {
    /// Every scheme, in upgrade order.
    pub const ALL: [DerivationScheme; 2] = [DerivationScheme::Legacy, DerivationScheme::SegwitBech32];

    /// BIP-43 purpose field of the account path.
    pub fn purpose(&self) -> u32 {
        match self {
            Self::Legacy => LEGACY_PURPOSE,
            Self::SegwitBech32 => SEGWIT_BECH32_PURPOSE,
        }
    }

    /// Default scheme for new receive addresses at a given wrapper version.
    pub fn default_for(version: WrapperVersion) -> Self {
        if version >= WrapperVersion::V4 {
            Self::SegwitBech32
        } else {
            Self::Legacy
        }
    }
}

impl fmt::Display for DerivationScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Legacy => write!(f, "legacy"),
            Self::SegwitBech32 => write!(f, "bech32"),
        }
    }
}

/// Which branch of an account's derivation tree an address lives on.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Chain {
    Receive,
    Change,
}

impl Chain {
    /// BIP-32 child index of the branch.
    pub fn index(&self) -> u32 {
        match self {
            Self::Receive => 0,
            Self::Change => 1,
        }
    }
}

/// Wire format version of the wrapped payload.
///
/// Versions only ever move forward; `Ord` follows the numeric value.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(try_from = "u8", into = "u8")]
pub enum WrapperVersion {
    /// Flat key list, wrapper without options.
    V1 = 1,
    /// Flat key list, wrapper carries stretching iterations.
    V2 = 2,
    /// HD wallet with legacy accounts.
    V3 = 3,
    /// HD wallet with legacy and segwit accounts.
    V4 = 4,
}

impl WrapperVersion {
    /// Newest version this crate can read and write.
    pub const LATEST: WrapperVersion = WrapperVersion::V4;

    /// Whether the version carries HD wallet bodies.
    pub fn is_hd(&self) -> bool {
        *self >= Self::V3
    }
}

impl TryFrom<u8> for WrapperVersion {
    type Error = ValidationError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::V1),
            2 => Ok(Self::V2),
            3 => Ok(Self::V3),
            4 => Ok(Self::V4),
            other => Err(ValidationError::UnsupportedVersion(other)),
        }
    }
}

impl From<WrapperVersion> for u8 {
    fn from(version: WrapperVersion) -> u8 {
        version as u8
    }
}

impl fmt::Display for WrapperVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", *self as u8)
    }
}

/// Balance summary for one xpub or one imported address.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct BalanceEntry {
    /// Current spendable balance.
    pub final_balance: u64,
    /// Sum of every output ever received.
    pub total_received: u64,
    /// Number of transactions touching the key.
    pub tx_count: u64,
}

impl BalanceEntry {
    pub const ZERO: Self = Self {
        final_balance: 0,
        total_received: 0,
        tx_count: 0,
    };

    /// Field-wise saturating sum of two entries.
    pub fn merge(&self, other: &BalanceEntry) -> BalanceEntry {
        BalanceEntry {
            final_balance: self.final_balance.saturating_add(other.final_balance),
            total_received: self.total_received.saturating_add(other.total_received),
            tx_count: self.tx_count.saturating_add(other.tx_count),
        }
    }

    /// Adjust the entry for a locally observed spend (negative) or receive
    /// (positive). Received value also counts towards `total_received`.
    pub fn with_delta(&self, amount: i64) -> BalanceEntry {
        let magnitude = amount.unsigned_abs();
        if amount >= 0 {
            BalanceEntry {
                final_balance: self.final_balance.saturating_add(magnitude),
                total_received: self.total_received.saturating_add(magnitude),
                tx_count: self.tx_count,
            }
        } else {
            BalanceEntry {
                final_balance: self.final_balance.saturating_sub(magnitude),
                ..*self
            }
        }
    }
}

/// Fingerprint of a wrapped payload, used as the optimistic-concurrency
/// token against the remote store. Hex-encoded SHA-256.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Checksum(String);

impl Checksum {
    /// Fingerprint arbitrary wrapped bytes.
    pub fn of(bytes: &[u8]) -> Self {
        Self(hex::encode(Sha256::digest(bytes)))
    }

    /// Wrap an already computed fingerprint (e.g. one reported by a server).
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of the device performing writes.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Device {
    /// Operating system tag sent with every write (e.g. "android").
    pub os_type: String,
    /// Application version recorded on imported addresses.
    pub app_version: String,
}

/// Next unused indexes of an xpub as reported by chain observation.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct ChainUsage {
    pub next_receive: u32,
    pub next_change: u32,
}
