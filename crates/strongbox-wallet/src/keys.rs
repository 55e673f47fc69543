//! BIP-32 key derivation backed by the `bitcoin` crate.
//!
//! Account keys live at `m/purpose'/0'/account'` where purpose is 44 for
//! legacy P2PKH and 84 for native segwit. Addresses are derived publicly
//! from the account xpub at `chain/index`.

use bitcoin::bip32::{ChildNumber, Xpriv, Xpub};
use bitcoin::secp256k1::{All, Secp256k1};
use bitcoin::{Address, CompressedPublicKey, Network, PrivateKey, PublicKey};
use std::fmt;
use std::str::FromStr;

use strongbox_core::error::DerivationError;
use strongbox_core::traits::{AccountKeys, KeyDerivation};
use strongbox_core::types::{Chain, DerivationScheme};

/// BIP-32 seed length bounds in bytes.
const MIN_SEED_LEN: usize = 16;
const MAX_SEED_LEN: usize = 64;

/// [`KeyDerivation`] implementation for bitcoin mainnet or a test network.
pub struct Bip32Derivation {
    network: Network,
    secp: Secp256k1<All>,
}

impl Bip32Derivation {
    pub fn new(network: Network) -> Self {
        Self {
            network,
            secp: Secp256k1::new(),
        }
    }

    /// The network addresses are encoded for.
    pub fn network(&self) -> Network {
        self.network
    }

    fn encode(&self, public: PublicKey, scheme: DerivationScheme) -> Result<String, DerivationError> {
        let address = match scheme {
            DerivationScheme::Legacy => Address::p2pkh(public.pubkey_hash(), self.network),
            DerivationScheme::SegwitBech32 => {
                let compressed = CompressedPublicKey::try_from(public)
                    .map_err(|e| DerivationError::Derivation(e.to_string()))?;
                Address::p2wpkh(&compressed, self.network)
            }
        };
        Ok(address.to_string())
    }
}

impl Default for Bip32Derivation {
    fn default() -> Self {
        Self::new(Network::Bitcoin)
    }
}

impl fmt::Debug for Bip32Derivation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bip32Derivation")
            .field("network", &self.network)
            .finish()
    }
}

fn hardened(index: u32) -> Result<ChildNumber, DerivationError> {
    ChildNumber::from_hardened_idx(index).map_err(|e| DerivationError::Derivation(e.to_string()))
}

fn normal(index: u32) -> Result<ChildNumber, DerivationError> {
    ChildNumber::from_normal_idx(index).map_err(|e| DerivationError::Derivation(e.to_string()))
}

impl KeyDerivation for Bip32Derivation {
    fn account_keys(
        &self,
        seed: &[u8],
        scheme: DerivationScheme,
        account_index: u32,
    ) -> Result<AccountKeys, DerivationError> {
        if !(MIN_SEED_LEN..=MAX_SEED_LEN).contains(&seed.len()) {
            return Err(DerivationError::InvalidSeed(format!(
                "seed must be {MIN_SEED_LEN}..={MAX_SEED_LEN} bytes, got {}",
                seed.len()
            )));
        }
        let master = Xpriv::new_master(self.network, seed)
            .map_err(|e| DerivationError::InvalidSeed(e.to_string()))?;
        let path = [hardened(scheme.purpose())?, hardened(0)?, hardened(account_index)?];
        let account = master
            .derive_priv(&self.secp, &path)
            .map_err(|e| DerivationError::Derivation(e.to_string()))?;
        let xpub = Xpub::from_priv(&self.secp, &account);
        Ok(AccountKeys {
            xpriv: account.to_string(),
            xpub: xpub.to_string(),
        })
    }

    fn address_at(
        &self,
        xpub: &str,
        scheme: DerivationScheme,
        chain: Chain,
        index: u32,
    ) -> Result<String, DerivationError> {
        let xpub = Xpub::from_str(xpub).map_err(|e| DerivationError::InvalidExtendedKey(e.to_string()))?;
        let child = xpub
            .derive_pub(&self.secp, &[normal(chain.index())?, normal(index)?])
            .map_err(|e| DerivationError::Derivation(e.to_string()))?;
        self.encode(PublicKey::new(child.public_key), scheme)
    }

    fn signing_key(&self, xpriv: &str, chain: Chain, index: u32) -> Result<String, DerivationError> {
        let xpriv = Xpriv::from_str(xpriv).map_err(|e| DerivationError::InvalidExtendedKey(e.to_string()))?;
        let child = xpriv
            .derive_priv(&self.secp, &[normal(chain.index())?, normal(index)?])
            .map_err(|e| DerivationError::Derivation(e.to_string()))?;
        Ok(PrivateKey::new(child.private_key, self.network).to_wif())
    }

    fn address_for_key(&self, wif: &str, scheme: DerivationScheme) -> Result<String, DerivationError> {
        let key = PrivateKey::from_wif(wif).map_err(|e| DerivationError::InvalidPrivateKey(e.to_string()))?;
        self.encode(key.public_key(&self.secp), scheme)
    }
}
