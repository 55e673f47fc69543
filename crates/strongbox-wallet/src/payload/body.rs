//! HD wallet body: master seed material and the ordered account list.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use zeroize::Zeroizing;

use strongbox_core::error::ValidationError;
use strongbox_core::traits::{AccountKeys, KeyDerivation};
use strongbox_core::types::DerivationScheme;

use super::secret::{FieldCipher, Secret, protect, reveal};
use crate::error::WalletError;
use crate::mnemonic;

/// Extended key pair of one account under one derivation scheme.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Derivation {
    #[serde(rename = "type")]
    pub scheme: DerivationScheme,
    pub xpriv: Secret,
    pub xpub: String,
}

/// One HD account. Its derivation index is its position in
/// [`WalletBody::accounts`].
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Account {
    label: String,
    #[serde(default)]
    archived: bool,
    default_derivation: DerivationScheme,
    derivations: Vec<Derivation>,
    #[serde(default)]
    address_labels: BTreeMap<u32, String>,
}

impl Account {
    /// New account holding a single derivation, which becomes its default.
    pub fn new(label: impl Into<String>, scheme: DerivationScheme, keys: AccountKeys, fields: Option<&FieldCipher<'_>>) -> Result<Self, WalletError> {
        Ok(Self {
            label: label.into(),
            archived: false,
            default_derivation: scheme,
            derivations: vec![Derivation {
                scheme,
                xpriv: protect(&keys.xpriv, fields)?,
                xpub: keys.xpub,
            }],
            address_labels: BTreeMap::new(),
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn is_archived(&self) -> bool {
        self.archived
    }

    pub fn default_scheme(&self) -> DerivationScheme {
        self.default_derivation
    }

    pub fn derivations(&self) -> &[Derivation] {
        &self.derivations
    }

    pub fn derivation(&self, scheme: DerivationScheme) -> Option<&Derivation> {
        self.derivations.iter().find(|d| d.scheme == scheme)
    }

    /// Xpub for `scheme`, if the account supports it.
    pub fn xpub(&self, scheme: DerivationScheme) -> Option<&str> {
        self.derivation(scheme).map(|d| d.xpub.as_str())
    }

    /// Xpub of the default derivation.
    pub fn default_xpub(&self) -> Option<&str> {
        self.xpub(self.default_derivation)
    }

    /// Xpub used for new receive addresses at the given scheme preference,
    /// falling back to the account default when the scheme is not present.
    pub fn receive_xpub(&self, preferred: DerivationScheme) -> Option<(DerivationScheme, &str)> {
        self.xpub(preferred)
            .map(|x| (preferred, x))
            .or_else(|| self.default_xpub().map(|x| (self.default_derivation, x)))
    }

    /// Every scheme → xpub pair of the account.
    pub fn xpubs(&self) -> BTreeMap<DerivationScheme, &str> {
        self.derivations.iter().map(|d| (d.scheme, d.xpub.as_str())).collect()
    }

    pub fn address_labels(&self) -> &BTreeMap<u32, String> {
        &self.address_labels
    }

    pub fn address_label(&self, index: u32) -> Option<&str> {
        self.address_labels.get(&index).map(String::as_str)
    }

    pub fn with_label(&self, label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            ..self.clone()
        }
    }

    pub fn with_archived(&self, archived: bool) -> Self {
        Self {
            archived,
            ..self.clone()
        }
    }

    /// Reserve `index` under `label`. Re-reserving with the same label is
    /// accepted; a different label already at `index` is rejected.
    pub fn with_address_label(&self, index: u32, label: &str) -> Result<Self, ValidationError> {
        if label.trim().is_empty() {
            return Err(ValidationError::InvalidInput("address label must not be empty".into()));
        }
        if let Some(existing) = self.address_labels.get(&index) {
            if existing != label {
                return Err(ValidationError::IndexAlreadyReserved {
                    index,
                    existing: existing.clone(),
                });
            }
        }
        let mut address_labels = self.address_labels.clone();
        address_labels.insert(index, label.to_string());
        Ok(Self {
            address_labels,
            ..self.clone()
        })
    }

    /// Attach (or replace) a derivation and make it the default.
    pub fn with_derivation(&self, derivation: Derivation) -> Self {
        let mut derivations: Vec<Derivation> = self
            .derivations
            .iter()
            .filter(|d| d.scheme != derivation.scheme)
            .cloned()
            .collect();
        let scheme = derivation.scheme;
        derivations.push(derivation);
        Self {
            default_derivation: scheme,
            derivations,
            ..self.clone()
        }
    }

    /// Apply `f` to every xpriv.
    pub(crate) fn map_secrets(&self, f: &dyn Fn(&Secret) -> Result<Secret, WalletError>) -> Result<Self, WalletError> {
        let derivations = self
            .derivations
            .iter()
            .map(|d| {
                Ok(Derivation {
                    xpriv: f(&d.xpriv)?,
                    ..d.clone()
                })
            })
            .collect::<Result<Vec<_>, WalletError>>()?;
        Ok(Self {
            derivations,
            ..self.clone()
        })
    }

    pub(crate) fn check_structure(&self, position: usize) -> Result<(), ValidationError> {
        if self.derivations.is_empty() {
            return Err(ValidationError::CorruptedPayload(format!("account {position} has no derivations")));
        }
        if self.default_xpub().is_none() {
            return Err(ValidationError::CorruptedPayload(format!(
                "account {position} default derivation {} missing",
                self.default_derivation
            )));
        }
        Ok(())
    }
}

/// The single active HD body of a V3+ payload.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct WalletBody {
    /// Hex BIP-39 entropy.
    seed_hex: Secret,
    #[serde(default)]
    mnemonic_verified: bool,
    #[serde(default)]
    default_account_idx: usize,
    accounts: Vec<Account>,
}

impl WalletBody {
    /// First body of a wallet: seed material and account 0.
    pub fn new(
        entropy: &[u8],
        label: &str,
        scheme: DerivationScheme,
        fields: Option<&FieldCipher<'_>>,
        derivation: &dyn KeyDerivation,
    ) -> Result<Self, WalletError> {
        let seed = mnemonic::seed_from_entropy(entropy)?;
        let keys = derivation.account_keys(&seed, scheme, 0)?;
        Ok(Self {
            seed_hex: protect(&hex::encode(entropy), fields)?,
            mnemonic_verified: false,
            default_account_idx: 0,
            accounts: vec![Account::new(label, scheme, keys, fields)?],
        })
    }

    pub fn accounts(&self) -> &[Account] {
        &self.accounts
    }

    pub fn account(&self, index: usize) -> Option<&Account> {
        self.accounts.get(index)
    }

    pub fn default_account_index(&self) -> usize {
        self.default_account_idx
    }

    pub fn is_mnemonic_verified(&self) -> bool {
        self.mnemonic_verified
    }

    pub(crate) fn seed_secret(&self) -> &Secret {
        &self.seed_hex
    }

    /// BIP-39 entropy in the clear.
    pub fn reveal_entropy(&self, fields: Option<&FieldCipher<'_>>) -> Result<Zeroizing<Vec<u8>>, WalletError> {
        let seed_hex = reveal(&self.seed_hex, fields)?;
        hex::decode(seed_hex.as_str())
            .map(Zeroizing::new)
            .map_err(|e| WalletError::corrupted(format!("seed material: {e}")))
    }

    /// 64-byte BIP-39 seed for key derivation.
    pub fn reveal_seed(&self, fields: Option<&FieldCipher<'_>>) -> Result<Zeroizing<Vec<u8>>, WalletError> {
        let entropy = self.reveal_entropy(fields)?;
        Ok(mnemonic::seed_from_entropy(&entropy)?)
    }

    /// Position of the account owning `xpub` under any scheme.
    pub fn account_index_of(&self, xpub: &str) -> Option<usize> {
        self.accounts
            .iter()
            .position(|a| a.derivations.iter().any(|d| d.xpub == xpub))
    }

    pub fn with_accounts(&self, accounts: Vec<Account>) -> Self {
        Self {
            accounts,
            ..self.clone()
        }
    }

    pub fn with_account(&self, index: usize, account: Account) -> Result<Self, ValidationError> {
        if index >= self.accounts.len() {
            return Err(ValidationError::AccountNotFound(index));
        }
        let mut accounts = self.accounts.clone();
        accounts[index] = account;
        Ok(self.with_accounts(accounts))
    }

    pub fn with_default_account(&self, index: usize) -> Self {
        Self {
            default_account_idx: index,
            ..self.clone()
        }
    }

    pub fn with_mnemonic_verified(&self, verified: bool) -> Self {
        Self {
            mnemonic_verified: verified,
            ..self.clone()
        }
    }

    pub(crate) fn map_secrets(&self, f: &dyn Fn(&Secret) -> Result<Secret, WalletError>) -> Result<Self, WalletError> {
        let accounts = self
            .accounts
            .iter()
            .map(|a| a.map_secrets(f))
            .collect::<Result<Vec<_>, WalletError>>()?;
        Ok(Self {
            seed_hex: f(&self.seed_hex)?,
            accounts,
            ..self.clone()
        })
    }

    /// Every secret-bearing field, seed first.
    pub(crate) fn secrets(&self) -> impl Iterator<Item = &Secret> {
        std::iter::once(&self.seed_hex).chain(
            self.accounts
                .iter()
                .flat_map(|a| a.derivations.iter().map(|d| &d.xpriv)),
        )
    }

    pub(crate) fn check_structure(&self) -> Result<(), ValidationError> {
        if self.accounts.is_empty() {
            return Err(ValidationError::CorruptedPayload("wallet body has no accounts".into()));
        }
        for (position, account) in self.accounts.iter().enumerate() {
            account.check_structure(position)?;
        }
        match self.accounts.get(self.default_account_idx) {
            None => Err(ValidationError::CorruptedPayload(format!(
                "default account {} out of range",
                self.default_account_idx
            ))),
            Some(a) if a.archived => Err(ValidationError::CorruptedPayload(format!(
                "default account {} is archived",
                self.default_account_idx
            ))),
            Some(_) => Ok(()),
        }
    }
}
