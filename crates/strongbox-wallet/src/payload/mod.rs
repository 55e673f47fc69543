//! The wallet payload: a versioned, optionally double-encrypted value.
//!
//! Every mutation returns a new [`WalletPayload`]; the receiver is never
//! changed. A candidate only becomes the wallet's state once the
//! synchronizer has committed it.

pub mod body;
pub mod imported;
pub mod secret;
mod upgrade;

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use zeroize::Zeroizing;

use strongbox_core::error::{CredentialError, ValidationError};
use strongbox_core::traits::{CipherService, KeyDerivation};
use strongbox_core::types::{DerivationScheme, Device, WrapperVersion};

pub use body::{Account, Derivation, WalletBody};
pub use imported::ImportedAddress;
pub use secret::{FieldCipher, Secret};

use crate::error::WalletError;
use crate::mnemonic;
use secret::{protect, reveal, second_password_hash};

/// Wallet-level options carried inside the payload.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct WalletOptions {
    pub pbkdf2_iterations: u32,
}

/// Authoritative wallet state.
#[derive(Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct WalletPayload {
    guid: String,
    #[serde(rename = "sharedKey")]
    shared_key: String,
    wrapper_version: WrapperVersion,
    #[serde(default)]
    double_encryption: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    dpasswordhash: Option<String>,
    options: WalletOptions,
    #[serde(default, rename = "hd_wallets", skip_serializing_if = "Vec::is_empty")]
    bodies: Vec<WalletBody>,
    #[serde(default, rename = "keys")]
    imported: Vec<ImportedAddress>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    tx_notes: BTreeMap<String, String>,
}

impl fmt::Debug for WalletPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WalletPayload")
            .field("guid", &self.guid)
            .field("wrapper_version", &self.wrapper_version)
            .field("double_encryption", &self.double_encryption)
            .field("options", &self.options)
            .field("bodies", &self.bodies)
            .field("imported", &self.imported)
            .field("tx_notes", &self.tx_notes.len())
            .finish_non_exhaustive()
    }
}

/// Schemes an account carries at a given version, default last.
fn schemes_for(version: WrapperVersion) -> &'static [DerivationScheme] {
    if version >= WrapperVersion::V4 {
        &[DerivationScheme::Legacy, DerivationScheme::SegwitBech32]
    } else {
        &[DerivationScheme::Legacy]
    }
}

fn non_empty(value: &str, what: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::InvalidInput(format!("{what} must not be empty")));
    }
    Ok(())
}

impl WalletPayload {
    /// New HD wallet (V3) with a single account derived from `entropy`.
    pub fn new_hd(
        label: &str,
        entropy: &[u8],
        pbkdf2_iterations: u32,
        derivation: &dyn KeyDerivation,
    ) -> Result<Self, WalletError> {
        non_empty(label, "account label")?;
        let body = WalletBody::new(entropy, label, DerivationScheme::Legacy, None, derivation)?;
        Ok(Self {
            bodies: vec![body],
            wrapper_version: WrapperVersion::V3,
            ..Self::new_legacy(pbkdf2_iterations)
        })
    }

    /// New flat-key (V2) wallet without an HD body.
    pub fn new_legacy(pbkdf2_iterations: u32) -> Self {
        Self {
            guid: uuid::Uuid::new_v4().to_string(),
            shared_key: uuid::Uuid::new_v4().to_string(),
            wrapper_version: WrapperVersion::V2,
            double_encryption: false,
            dpasswordhash: None,
            options: WalletOptions { pbkdf2_iterations },
            bodies: Vec::new(),
            imported: Vec::new(),
            tx_notes: BTreeMap::new(),
        }
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub fn guid(&self) -> &str {
        &self.guid
    }

    pub fn shared_key(&self) -> &str {
        &self.shared_key
    }

    pub fn wrapper_version(&self) -> WrapperVersion {
        self.wrapper_version
    }

    pub fn options(&self) -> WalletOptions {
        self.options
    }

    pub fn pbkdf2_iterations(&self) -> u32 {
        self.options.pbkdf2_iterations
    }

    pub fn is_double_encrypted(&self) -> bool {
        self.double_encryption
    }

    /// The active HD body, if the payload has one.
    pub fn body(&self) -> Option<&WalletBody> {
        self.bodies.first()
    }

    /// Accounts of the active body; empty for flat-key wallets.
    pub fn accounts(&self) -> &[Account] {
        self.body().map(WalletBody::accounts).unwrap_or(&[])
    }

    pub fn account(&self, index: usize) -> Result<&Account, ValidationError> {
        self.require_body()?
            .account(index)
            .ok_or(ValidationError::AccountNotFound(index))
    }

    pub fn default_account_index(&self) -> usize {
        self.body().map(WalletBody::default_account_index).unwrap_or(0)
    }

    /// Non-archived accounts with their derivation index.
    pub fn active_accounts(&self) -> impl Iterator<Item = (usize, &Account)> {
        self.accounts().iter().enumerate().filter(|(_, a)| !a.is_archived())
    }

    pub fn is_mnemonic_verified(&self) -> bool {
        self.body().is_some_and(WalletBody::is_mnemonic_verified)
    }

    pub fn imported(&self) -> &[ImportedAddress] {
        &self.imported
    }

    pub fn imported_address(&self, address: &str) -> Option<&ImportedAddress> {
        self.imported.iter().find(|i| i.address() == address)
    }

    pub fn active_imported(&self) -> impl Iterator<Item = &ImportedAddress> {
        self.imported.iter().filter(|i| !i.is_archived())
    }

    /// Label of the account owning `xpub`.
    pub fn label_for_xpub(&self, xpub: &str) -> Option<&str> {
        let body = self.body()?;
        body.account_index_of(xpub)
            .and_then(|i| body.account(i))
            .map(Account::label)
    }

    pub fn tx_note(&self, tx_hash: &str) -> Option<&str> {
        self.tx_notes.get(tx_hash).map(String::as_str)
    }

    pub fn tx_notes(&self) -> &BTreeMap<String, String> {
        &self.tx_notes
    }

    fn require_body(&self) -> Result<&WalletBody, ValidationError> {
        self.body().ok_or(ValidationError::WrongVersion {
            actual: self.wrapper_version.into(),
            required: WrapperVersion::V3.into(),
        })
    }

    fn secrets(&self) -> impl Iterator<Item = &Secret> {
        self.bodies
            .iter()
            .flat_map(|b| b.secrets())
            .chain(self.imported.iter().filter_map(ImportedAddress::private_key))
    }

    // ------------------------------------------------------------------
    // Validation
    // ------------------------------------------------------------------

    /// Either every secret field is encrypted (double encryption on) or none is.
    pub fn check_encryption_consistency(&self) -> Result<(), ValidationError> {
        let expected = self.double_encryption;
        if self.secrets().any(|s| s.is_encrypted() != expected) {
            let detail = if expected {
                "plaintext secret in double-encrypted payload"
            } else {
                "encrypted secret in plaintext payload"
            };
            return Err(ValidationError::CorruptedPayload(detail.into()));
        }
        if expected && self.dpasswordhash.is_none() && self.secrets().next().is_none() {
            return Err(ValidationError::CorruptedPayload(
                "double encryption enabled without a reference field".into(),
            ));
        }
        Ok(())
    }

    pub fn is_encryption_consistent(&self) -> bool {
        self.check_encryption_consistency().is_ok()
    }

    /// Full structural check run before every write and after every load.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.guid.is_empty() || self.shared_key.is_empty() {
            return Err(ValidationError::Uninitialized);
        }
        if self.options.pbkdf2_iterations == 0 {
            return Err(ValidationError::CorruptedPayload("pbkdf2 iterations must be positive".into()));
        }
        match (self.wrapper_version.is_hd(), self.bodies.len()) {
            (true, 1) => self.bodies[0].check_structure()?,
            (false, 0) => {}
            (hd, n) => {
                return Err(ValidationError::CorruptedPayload(format!(
                    "{} payload with {n} wallet bodies",
                    if hd { "HD" } else { "flat-key" }
                )));
            }
        }
        let mut seen = HashSet::new();
        for imported in &self.imported {
            if !seen.insert(imported.address()) {
                return Err(ValidationError::DuplicateAddress(imported.address().to_string()));
            }
        }
        self.check_encryption_consistency()
    }

    /// Reject a candidate that would replace `previous` illegally.
    pub fn check_transition_from(&self, previous: &WalletPayload) -> Result<(), ValidationError> {
        if self.wrapper_version < previous.wrapper_version {
            return Err(ValidationError::VersionDowngrade {
                from: previous.wrapper_version.into(),
                to: self.wrapper_version.into(),
            });
        }
        if self.guid != previous.guid {
            return Err(ValidationError::CorruptedPayload("wallet identifier changed".into()));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Second password
    // ------------------------------------------------------------------

    /// Field cipher for secret access. `None` when double encryption is off.
    /// Fails with an invalid-second-password error unless `second_password`
    /// opens the reference field.
    pub fn field_cipher<'a>(
        &self,
        second_password: Option<&str>,
        cipher: &'a dyn CipherService,
    ) -> Result<Option<FieldCipher<'a>>, WalletError> {
        if !self.double_encryption {
            return Ok(None);
        }
        let password = second_password.ok_or(CredentialError::InvalidSecondPassword)?;
        let fields = FieldCipher::new(cipher, &self.shared_key, password, self.options.pbkdf2_iterations);
        match self.secrets().find(|s| s.is_encrypted()) {
            Some(reference) => {
                fields.open(reference)?;
            }
            None => {
                let expected = second_password_hash(&self.shared_key, password, self.options.pbkdf2_iterations);
                if self.dpasswordhash.as_deref() != Some(expected.as_str()) {
                    return Err(CredentialError::InvalidSecondPassword.into());
                }
            }
        }
        Ok(Some(fields))
    }

    /// Succeeds when secret fields are accessible with `second_password`.
    pub fn validate_second_password(
        &self,
        second_password: Option<&str>,
        cipher: &dyn CipherService,
    ) -> Result<(), WalletError> {
        self.field_cipher(second_password, cipher).map(|_| ())
    }

    /// Encrypt every secret field under a new second password.
    pub fn with_second_password(&self, second_password: &str, cipher: &dyn CipherService) -> Result<Self, WalletError> {
        if self.double_encryption {
            return Err(ValidationError::SecondPasswordAlreadySet.into());
        }
        non_empty(second_password, "second password")?;
        self.check_encryption_consistency()?;
        let fields = FieldCipher::new(cipher, &self.shared_key, second_password, self.options.pbkdf2_iterations);
        let mut next = self.map_secrets(&|s| fields.lock(s))?;
        next.double_encryption = true;
        next.dpasswordhash = Some(second_password_hash(
            &self.shared_key,
            second_password,
            self.options.pbkdf2_iterations,
        ));
        Ok(next)
    }

    /// Decrypt every secret field and turn double encryption off.
    pub fn without_second_password(&self, second_password: &str, cipher: &dyn CipherService) -> Result<Self, WalletError> {
        let Some(fields) = self.field_cipher(Some(second_password), cipher)? else {
            return Err(ValidationError::InvalidInput("second password is not enabled".into()).into());
        };
        let mut next = self.map_secrets(&|s| fields.unlock(s))?;
        next.double_encryption = false;
        next.dpasswordhash = None;
        Ok(next)
    }

    fn map_secrets(&self, f: &dyn Fn(&Secret) -> Result<Secret, WalletError>) -> Result<Self, WalletError> {
        let bodies = self
            .bodies
            .iter()
            .map(|b| b.map_secrets(f))
            .collect::<Result<Vec<_>, WalletError>>()?;
        let imported = self
            .imported
            .iter()
            .map(|i| i.map_secret(f))
            .collect::<Result<Vec<_>, WalletError>>()?;
        Ok(Self {
            bodies,
            imported,
            ..self.clone()
        })
    }

    /// The backup phrase of the HD body.
    pub fn reveal_mnemonic(
        &self,
        second_password: Option<&str>,
        cipher: &dyn CipherService,
    ) -> Result<Zeroizing<String>, WalletError> {
        let body = self.require_body()?;
        let fields = self.field_cipher(second_password, cipher)?;
        let entropy = body.reveal_entropy(fields.as_ref())?;
        Ok(mnemonic::entropy_to_mnemonic(&entropy)?)
    }

    /// Extended private key of an account under `scheme`.
    pub fn reveal_account_xpriv(
        &self,
        account_index: usize,
        scheme: DerivationScheme,
        second_password: Option<&str>,
        cipher: &dyn CipherService,
    ) -> Result<Zeroizing<String>, WalletError> {
        let derivation = self
            .account(account_index)?
            .derivation(scheme)
            .ok_or_else(|| ValidationError::InvalidInput(format!("account has no {scheme} derivation")))?;
        let fields = self.field_cipher(second_password, cipher)?;
        reveal(&derivation.xpriv, fields.as_ref())
    }

    /// WIF key of an imported address.
    pub fn reveal_imported_key(
        &self,
        address: &str,
        second_password: Option<&str>,
        cipher: &dyn CipherService,
    ) -> Result<Zeroizing<String>, WalletError> {
        let imported = self
            .imported_address(address)
            .ok_or_else(|| ValidationError::AddressNotFound(address.to_string()))?;
        let key = imported
            .private_key()
            .ok_or_else(|| ValidationError::InvalidInput(format!("{address} is watch-only")))?;
        let fields = self.field_cipher(second_password, cipher)?;
        reveal(key, fields.as_ref())
    }

    // ------------------------------------------------------------------
    // Account transitions
    // ------------------------------------------------------------------

    fn with_body(&self, body: WalletBody) -> Self {
        Self {
            bodies: vec![body],
            ..self.clone()
        }
    }

    fn with_account(&self, index: usize, account: Account) -> Result<Self, WalletError> {
        let body = self.require_body()?.with_account(index, account)?;
        Ok(self.with_body(body))
    }

    /// Append an account at the next derivation index, carrying one xpub per
    /// scheme supported at the current version.
    pub fn with_new_account(
        &self,
        label: &str,
        second_password: Option<&str>,
        cipher: &dyn CipherService,
        derivation: &dyn KeyDerivation,
    ) -> Result<Self, WalletError> {
        non_empty(label, "account label")?;
        let body = self.require_body()?;
        let fields = self.field_cipher(second_password, cipher)?;
        let seed = body.reveal_seed(fields.as_ref())?;
        let index = body.accounts().len();
        let account_index = u32::try_from(index)
            .map_err(|_| ValidationError::InvalidInput("too many accounts".into()))?;

        let mut account: Option<Account> = None;
        for &scheme in schemes_for(self.wrapper_version) {
            let keys = derivation.account_keys(&seed, scheme, account_index)?;
            account = Some(match account {
                None => Account::new(label, scheme, keys, fields.as_ref())?,
                Some(a) => a.with_derivation(Derivation {
                    scheme,
                    xpriv: protect(&keys.xpriv, fields.as_ref())?,
                    xpub: keys.xpub,
                }),
            });
        }
        let account = account.ok_or_else(|| ValidationError::InvalidInput("no derivation scheme".into()))?;

        let mut accounts = body.accounts().to_vec();
        accounts.push(account);
        Ok(self.with_body(body.with_accounts(accounts)))
    }

    pub fn with_account_label(&self, index: usize, label: &str) -> Result<Self, WalletError> {
        non_empty(label, "account label")?;
        let account = self.account(index)?.with_label(label);
        self.with_account(index, account)
    }

    /// Archive or restore an account. The default account cannot be archived.
    pub fn with_account_archived(&self, index: usize, archived: bool) -> Result<Self, WalletError> {
        let account = self.account(index)?;
        if archived && index == self.default_account_index() {
            return Err(ValidationError::ArchiveDefaultAccount.into());
        }
        self.with_account(index, account.with_archived(archived))
    }

    pub fn with_default_account(&self, index: usize) -> Result<Self, WalletError> {
        if self.account(index)?.is_archived() {
            return Err(ValidationError::AccountArchived(index).into());
        }
        let body = self.require_body()?.with_default_account(index);
        Ok(self.with_body(body))
    }

    pub fn with_mnemonic_verified(&self, verified: bool) -> Result<Self, WalletError> {
        let body = self.require_body()?.with_mnemonic_verified(verified);
        Ok(self.with_body(body))
    }

    /// Reserve receive index `index` of an account under `label`.
    pub fn with_address_label(&self, account_index: usize, index: u32, label: &str) -> Result<Self, WalletError> {
        let account = self.account(account_index)?.with_address_label(index, label)?;
        self.with_account(account_index, account)
    }

    // ------------------------------------------------------------------
    // Imported addresses
    // ------------------------------------------------------------------

    fn with_imported_entry(&self, entry: ImportedAddress) -> Self {
        let mut imported = self.imported.clone();
        match imported.iter_mut().find(|i| i.address() == entry.address()) {
            Some(slot) => *slot = entry,
            None => imported.push(entry),
        }
        Self {
            imported,
            ..self.clone()
        }
    }

    fn require_imported(&self, address: &str) -> Result<&ImportedAddress, ValidationError> {
        self.imported_address(address)
            .ok_or_else(|| ValidationError::AddressNotFound(address.to_string()))
    }

    /// Add a watch-only address.
    pub fn with_imported_address(&self, address: ImportedAddress) -> Result<Self, WalletError> {
        non_empty(address.address(), "address")?;
        if self.imported_address(address.address()).is_some() {
            return Err(ValidationError::DuplicateAddress(address.address().to_string()).into());
        }
        Ok(self.with_imported_entry(address))
    }

    /// Attach a WIF key. A watch-only entry for the key's address receives
    /// the key; otherwise a new imported address is created. Returns the
    /// resulting entry alongside the new payload.
    pub fn with_imported_key(
        &self,
        wif: &str,
        label: Option<&str>,
        device: &Device,
        second_password: Option<&str>,
        cipher: &dyn CipherService,
        derivation: &dyn KeyDerivation,
    ) -> Result<(Self, ImportedAddress), WalletError> {
        let address = derivation.address_for_key(wif, DerivationScheme::Legacy)?;
        let fields = self.field_cipher(second_password, cipher)?;
        let key = protect(wif, fields.as_ref())?;

        let mut entry = match self.imported_address(&address) {
            Some(existing) if !existing.is_watch_only() => {
                return Err(ValidationError::DuplicateAddress(address).into());
            }
            Some(existing) => existing.with_private_key(key, device),
            None => ImportedAddress::with_key(address, key, device),
        };
        if let Some(label) = label {
            entry = entry.with_label(label);
        }
        Ok((self.with_imported_entry(entry.clone()), entry))
    }

    pub fn with_imported_archived(&self, address: &str, archived: bool) -> Result<Self, WalletError> {
        let entry = self.require_imported(address)?.with_archived(archived);
        Ok(self.with_imported_entry(entry))
    }

    pub fn with_imported_label(&self, address: &str, label: &str) -> Result<Self, WalletError> {
        let entry = self.require_imported(address)?.with_label(label);
        Ok(self.with_imported_entry(entry))
    }

    // ------------------------------------------------------------------
    // Notes
    // ------------------------------------------------------------------

    /// Set the note of a transaction. An empty note removes it.
    pub fn with_tx_note(&self, tx_hash: &str, note: &str) -> Result<Self, WalletError> {
        non_empty(tx_hash, "transaction hash")?;
        let mut tx_notes = self.tx_notes.clone();
        if note.is_empty() {
            tx_notes.remove(tx_hash);
        } else {
            tx_notes.insert(tx_hash.to_string(), note.to_string());
        }
        Ok(Self {
            tx_notes,
            ..self.clone()
        })
    }
}
