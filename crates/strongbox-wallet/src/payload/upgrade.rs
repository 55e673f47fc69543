//! Forward-only wrapper version upgrades.
//!
//! Each upgrade builds a complete new payload from the receiver. Nothing is
//! applied account by account, so a failure part way through leaves no
//! trace: the caller still holds the unchanged original.

use tracing::debug;

use strongbox_core::error::{DerivationError, ValidationError};
use strongbox_core::traits::{CipherService, KeyDerivation};
use strongbox_core::types::{DerivationScheme, WrapperVersion};

use super::body::{Derivation, WalletBody};
use super::secret::protect;
use super::WalletPayload;
use crate::error::WalletError;
use crate::mnemonic;

fn upgrade_error(err: impl std::fmt::Display) -> WalletError {
    DerivationError::Upgrade(err.to_string()).into()
}

impl WalletPayload {
    /// Whether the wallet predates HD bodies.
    pub fn is_v3_upgrade_required(&self) -> bool {
        self.wrapper_version < WrapperVersion::V3
    }

    /// Whether the wallet's accounts still lack segwit xpubs.
    pub fn is_v4_upgrade_required(&self) -> bool {
        self.wrapper_version == WrapperVersion::V3
    }

    /// Create the first HD body from fresh entropy.
    pub fn upgrade_v2_to_v3(
        &self,
        label: &str,
        second_password: Option<&str>,
        cipher: &dyn CipherService,
        derivation: &dyn KeyDerivation,
    ) -> Result<WalletPayload, WalletError> {
        let entropy = mnemonic::generate_entropy().map_err(upgrade_error)?;
        self.upgrade_v2_to_v3_with_entropy(&entropy, label, second_password, cipher, derivation)
    }

    /// [`upgrade_v2_to_v3`](Self::upgrade_v2_to_v3) with caller-supplied entropy.
    pub fn upgrade_v2_to_v3_with_entropy(
        &self,
        entropy: &[u8],
        label: &str,
        second_password: Option<&str>,
        cipher: &dyn CipherService,
        derivation: &dyn KeyDerivation,
    ) -> Result<WalletPayload, WalletError> {
        if !self.is_v3_upgrade_required() {
            return Err(ValidationError::WrongVersion {
                actual: self.wrapper_version.into(),
                required: WrapperVersion::V2.into(),
            }
            .into());
        }
        super::non_empty(label, "account label")?;
        let fields = self.field_cipher(second_password, cipher)?;
        let body = WalletBody::new(entropy, label, DerivationScheme::Legacy, fields.as_ref(), derivation)
            .map_err(|e| match e {
                WalletError::Derivation(inner) => upgrade_error(inner),
                other => other,
            })?;

        debug!(guid = %self.guid, "upgraded payload to v3");
        Ok(WalletPayload {
            bodies: vec![body],
            wrapper_version: WrapperVersion::V3,
            ..self.clone()
        })
    }

    /// Attach a segwit xpub to every account and move to V4.
    ///
    /// Accounts that already carry a segwit derivation keep it. The new
    /// derivation becomes each account's default.
    pub fn upgrade_v3_to_v4(
        &self,
        second_password: Option<&str>,
        cipher: &dyn CipherService,
        derivation: &dyn KeyDerivation,
    ) -> Result<WalletPayload, WalletError> {
        if !self.is_v4_upgrade_required() {
            return Err(ValidationError::WrongVersion {
                actual: self.wrapper_version.into(),
                required: WrapperVersion::V3.into(),
            }
            .into());
        }
        let fields = self.field_cipher(second_password, cipher)?;
        let scheme = DerivationScheme::SegwitBech32;

        let mut bodies = Vec::with_capacity(self.bodies.len());
        for body in &self.bodies {
            let seed = body.reveal_seed(fields.as_ref())?;
            let mut accounts = Vec::with_capacity(body.accounts().len());
            for (index, account) in body.accounts().iter().enumerate() {
                if account.xpub(scheme).is_some() {
                    accounts.push(account.clone());
                    continue;
                }
                let account_index = u32::try_from(index).map_err(upgrade_error)?;
                let keys = derivation
                    .account_keys(&seed, scheme, account_index)
                    .map_err(|e| upgrade_error(format!("account {index}: {e}")))?;
                accounts.push(account.with_derivation(Derivation {
                    scheme,
                    xpriv: protect(&keys.xpriv, fields.as_ref())?,
                    xpub: keys.xpub,
                }));
            }
            bodies.push(body.with_accounts(accounts));
        }

        debug!(guid = %self.guid, accounts = self.accounts().len(), "upgraded payload to v4");
        Ok(WalletPayload {
            bodies,
            wrapper_version: WrapperVersion::V4,
            ..self.clone()
        })
    }
}
