//! Payload manager: the public face of the wallet core.
//!
//! Every mutating call builds a candidate from the committed payload and
//! hands it to the [`PayloadSynchronizer`]; nothing changes locally unless
//! the remote store accepts the write. Read-only helpers work on a
//! snapshot and never see a candidate.

use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};
use zeroize::Zeroizing;

use strongbox_core::error::{TransportError, ValidationError};
use strongbox_core::traits::{ChainIndexer, CipherService, KeyDerivation, RemoteStore};
use strongbox_core::types::{BalanceEntry, Chain, DerivationScheme};

use crate::allocator::AddressIndexAllocator;
use crate::balance::BalanceAggregator;
use crate::config::WalletConfig;
use crate::encryption::AesGcmCipher;
use crate::error::WalletError;
use crate::keys::Bip32Derivation;
use crate::mnemonic;
use crate::payload::{Account, ImportedAddress, WalletPayload};
use crate::sync::{Committed, PayloadSynchronizer, SyncContext};

pub struct PayloadManager {
    config: WalletConfig,
    sync: PayloadSynchronizer,
    allocator: Arc<AddressIndexAllocator>,
    balances: BalanceAggregator,
    indexer: Arc<dyn ChainIndexer>,
    cipher: Arc<dyn CipherService>,
    derivation: Arc<dyn KeyDerivation>,
}

impl PayloadManager {
    /// Manager using the AES-GCM cipher and mainnet BIP-32 derivation.
    pub fn new(config: WalletConfig, store: Arc<dyn RemoteStore>, indexer: Arc<dyn ChainIndexer>) -> Self {
        Self::with_collaborators(
            config,
            store,
            indexer,
            Arc::new(AesGcmCipher),
            Arc::new(Bip32Derivation::default()),
        )
    }

    pub fn with_collaborators(
        config: WalletConfig,
        store: Arc<dyn RemoteStore>,
        indexer: Arc<dyn ChainIndexer>,
        cipher: Arc<dyn CipherService>,
        derivation: Arc<dyn KeyDerivation>,
    ) -> Self {
        let allocator = Arc::new(AddressIndexAllocator::new());
        let sync = PayloadSynchronizer::new(SyncContext {
            store,
            cipher: cipher.clone(),
            derivation: derivation.clone(),
            allocator: allocator.clone(),
            device: config.device.clone(),
            sync_lookahead: config.sync_lookahead,
        });
        Self {
            balances: BalanceAggregator::new(indexer.clone()),
            config,
            sync,
            allocator,
            indexer,
            cipher,
            derivation,
        }
    }

    pub fn config(&self) -> &WalletConfig {
        &self.config
    }

    pub fn allocator(&self) -> &AddressIndexAllocator {
        &self.allocator
    }

    pub fn balances(&self) -> &BalanceAggregator {
        &self.balances
    }

    /// Committed payload and checksum.
    pub fn current(&self) -> Result<Arc<Committed>, WalletError> {
        Ok(self.sync.current()?)
    }

    async fn mutate<F>(&self, sync_pub_keys: bool, build: F) -> Result<Arc<Committed>, WalletError>
    where
        F: FnOnce(&WalletPayload) -> Result<WalletPayload, WalletError>,
    {
        self.sync.mutate(sync_pub_keys, build).await
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Create and store a new HD wallet with one account.
    pub async fn create(&self, label: &str, email: &str, password: &str) -> Result<Arc<Committed>, WalletError> {
        let entropy = mnemonic::generate_entropy()?;
        let payload = WalletPayload::new_hd(label, &entropy, self.config.pbkdf2_iterations, self.derivation.as_ref())?;
        let committed = self.sync.save_new_wallet(payload, password, email).await?;
        info!(guid = committed.payload.guid(), "wallet created");
        Ok(committed)
    }

    /// Restore a wallet from its backup phrase and store it.
    ///
    /// Account 0 is always restored. Further accounts are checked in order
    /// and kept up to the last one with chain activity; scanning stops after
    /// `recovery_gap` consecutive unused accounts.
    pub async fn recover_from_mnemonic(
        &self,
        phrase: &str,
        label: &str,
        email: &str,
        password: &str,
    ) -> Result<Arc<Committed>, WalletError> {
        let entropy = mnemonic::mnemonic_to_entropy(phrase)?;
        let mut kept =
            WalletPayload::new_hd(label, &entropy, self.config.pbkdf2_iterations, self.derivation.as_ref())?;
        let mut scanned = kept.clone();
        let mut gap = 0;
        while gap < self.config.recovery_gap {
            let account_label = format!("{label} {}", scanned.accounts().len() + 1);
            scanned = scanned.with_new_account(&account_label, None, self.cipher.as_ref(), self.derivation.as_ref())?;
            let xpubs: Vec<String> = scanned
                .accounts()
                .last()
                .map(|a| a.xpubs().values().map(|x| x.to_string()).collect())
                .unwrap_or_default();
            let balances = self
                .indexer
                .balances(&xpubs)
                .await
                .map_err(|e| TransportError::BatchFailed(e.to_string()))?;
            if balances.values().any(|b| b.tx_count > 0) {
                kept = scanned.clone();
                gap = 0;
            } else {
                gap += 1;
            }
        }

        let committed = self.sync.save_new_wallet(kept, password, email).await?;
        info!(
            guid = committed.payload.guid(),
            accounts = committed.payload.accounts().len(),
            "wallet recovered from mnemonic"
        );
        Ok(committed)
    }

    /// Load a stored wallet.
    pub async fn initialize(&self, guid: &str, shared_key: &str, password: &str) -> Result<Arc<Committed>, WalletError> {
        let committed = self.sync.load(guid, shared_key, password).await?;
        self.balances.clear();
        Ok(committed)
    }

    /// Load a wrapper obtained out of band.
    pub async fn initialize_from_payload(&self, json: &str, password: &str) -> Result<Arc<Committed>, WalletError> {
        let committed = self.sync.load_from_json(json, password).await?;
        self.balances.clear();
        Ok(committed)
    }

    /// Drop the payload, password and caches.
    pub async fn wipe(&self) {
        self.sync.clear().await;
        self.balances.clear();
    }

    /// Store the current payload unchanged.
    pub async fn save(&self) -> Result<Arc<Committed>, WalletError> {
        self.mutate(false, |p| Ok(p.clone())).await
    }

    /// Store the current payload and announce its addresses.
    pub async fn sync_pub_keys(&self) -> Result<Arc<Committed>, WalletError> {
        self.mutate(true, |p| Ok(p.clone())).await
    }

    /// Re-wrap under a new main password. The old password stays in use
    /// unless the write succeeds; saves queued behind this one wrap under
    /// whichever password it leaves committed.
    pub async fn update_password(&self, new_password: &str) -> Result<Arc<Committed>, WalletError> {
        if new_password.is_empty() {
            return Err(ValidationError::InvalidInput("password must not be empty".into()).into());
        }
        let committed = self.sync.rewrap(new_password).await?;
        info!(guid = committed.payload.guid(), "main password updated");
        Ok(committed)
    }

    // ------------------------------------------------------------------
    // Versions
    // ------------------------------------------------------------------

    pub fn is_v3_upgrade_required(&self) -> Result<bool, WalletError> {
        Ok(self.current()?.payload.is_v3_upgrade_required())
    }

    pub fn is_v4_upgrade_required(&self) -> Result<bool, WalletError> {
        Ok(self.current()?.payload.is_v4_upgrade_required())
    }

    pub async fn upgrade_v2_to_v3(&self, label: &str, second_password: Option<&str>) -> Result<Arc<Committed>, WalletError> {
        let (cipher, derivation) = (self.cipher.as_ref(), self.derivation.as_ref());
        self.mutate(true, |p| p.upgrade_v2_to_v3(label, second_password, cipher, derivation))
            .await
    }

    pub async fn upgrade_v3_to_v4(&self, second_password: Option<&str>) -> Result<Arc<Committed>, WalletError> {
        let (cipher, derivation) = (self.cipher.as_ref(), self.derivation.as_ref());
        self.mutate(true, |p| p.upgrade_v3_to_v4(second_password, cipher, derivation))
            .await
    }

    // ------------------------------------------------------------------
    // Second password
    // ------------------------------------------------------------------

    pub fn validate_second_password(&self, second_password: Option<&str>) -> Result<(), WalletError> {
        self.current()?
            .payload
            .validate_second_password(second_password, self.cipher.as_ref())
    }

    pub async fn enable_second_password(&self, second_password: &str) -> Result<Arc<Committed>, WalletError> {
        let cipher = self.cipher.as_ref();
        self.sync
            .mutate_with_password(false, |p, main| {
                if main == second_password {
                    return Err(
                        ValidationError::InvalidInput("second password must differ from main password".into()).into(),
                    );
                }
                p.with_second_password(second_password, cipher)
            })
            .await
    }

    pub async fn disable_second_password(&self, second_password: &str) -> Result<Arc<Committed>, WalletError> {
        let cipher = self.cipher.as_ref();
        self.mutate(false, |p| p.without_second_password(second_password, cipher)).await
    }

    /// The backup phrase.
    pub fn mnemonic(&self, second_password: Option<&str>) -> Result<Zeroizing<String>, WalletError> {
        self.current()?
            .payload
            .reveal_mnemonic(second_password, self.cipher.as_ref())
    }

    // ------------------------------------------------------------------
    // Accounts
    // ------------------------------------------------------------------

    pub async fn add_account(&self, label: &str, second_password: Option<&str>) -> Result<Arc<Committed>, WalletError> {
        let (cipher, derivation) = (self.cipher.as_ref(), self.derivation.as_ref());
        let committed = self
            .mutate(true, |p| p.with_new_account(label, second_password, cipher, derivation))
            .await?;
        info!(guid = committed.payload.guid(), account = committed.payload.accounts().len().saturating_sub(1), "account added");
        Ok(committed)
    }

    pub async fn update_account_label(&self, index: usize, label: &str) -> Result<Arc<Committed>, WalletError> {
        self.mutate(false, |p| p.with_account_label(index, label)).await
    }

    pub async fn archive_account(&self, index: usize, archived: bool) -> Result<Arc<Committed>, WalletError> {
        self.mutate(false, |p| p.with_account_archived(index, archived)).await
    }

    pub async fn set_default_account(&self, index: usize) -> Result<Arc<Committed>, WalletError> {
        self.mutate(false, |p| p.with_default_account(index)).await
    }

    pub async fn mark_mnemonic_verified(&self) -> Result<Arc<Committed>, WalletError> {
        self.mutate(false, |p| p.with_mnemonic_verified(true)).await
    }

    pub fn is_wallet_backed_up(&self) -> bool {
        self.sync
            .snapshot()
            .is_some_and(|c| c.payload.is_mnemonic_verified())
    }

    // ------------------------------------------------------------------
    // Imported addresses
    // ------------------------------------------------------------------

    pub async fn add_watch_only_address(&self, address: &str, label: &str) -> Result<Arc<Committed>, WalletError> {
        let entry = ImportedAddress::watch_only(address, label);
        self.mutate(true, move |p| p.with_imported_address(entry)).await
    }

    async fn attach_key(
        &self,
        wif: &str,
        label: Option<&str>,
        second_password: Option<&str>,
    ) -> Result<ImportedAddress, WalletError> {
        let device = self.config.device.clone().ok_or(ValidationError::MissingDevice)?;
        let (cipher, derivation) = (self.cipher.as_ref(), self.derivation.as_ref());
        let mut entry = None;
        self.mutate(true, |p| {
            let (next, imported) = p.with_imported_key(wif, label, &device, second_password, cipher, derivation)?;
            entry = Some(imported);
            Ok(next)
        })
        .await?;
        entry.ok_or_else(|| WalletError::corrupted("imported entry missing after commit"))
    }

    /// Import a WIF key as a new address, or fill in the key of the
    /// matching watch-only address.
    pub async fn import_private_key(
        &self,
        wif: &str,
        label: &str,
        second_password: Option<&str>,
    ) -> Result<ImportedAddress, WalletError> {
        let label = (!label.is_empty()).then_some(label);
        self.attach_key(wif, label, second_password).await
    }

    /// Attach a key to the watch-only address it controls; imports it as a
    /// new address when no watch-only entry matches.
    pub async fn set_key_for_imported_address(
        &self,
        wif: &str,
        second_password: Option<&str>,
    ) -> Result<ImportedAddress, WalletError> {
        self.attach_key(wif, None, second_password).await
    }

    pub async fn archive_imported_address(&self, address: &str, archived: bool) -> Result<Arc<Committed>, WalletError> {
        self.mutate(true, |p| p.with_imported_archived(address, archived)).await
    }

    pub async fn update_imported_label(&self, address: &str, label: &str) -> Result<Arc<Committed>, WalletError> {
        self.mutate(false, |p| p.with_imported_label(address, label)).await
    }

    /// WIF key of an imported address.
    pub fn imported_private_key(&self, address: &str, second_password: Option<&str>) -> Result<Zeroizing<String>, WalletError> {
        self.current()?
            .payload
            .reveal_imported_key(address, second_password, self.cipher.as_ref())
    }

    // ------------------------------------------------------------------
    // Notes
    // ------------------------------------------------------------------

    pub async fn update_tx_note(&self, tx_hash: &str, note: &str) -> Result<Arc<Committed>, WalletError> {
        self.mutate(false, |p| p.with_tx_note(tx_hash, note)).await
    }

    pub fn tx_note(&self, tx_hash: &str) -> Option<String> {
        self.sync
            .snapshot()
            .and_then(|c| c.payload.tx_note(tx_hash).map(str::to_string))
    }

    // ------------------------------------------------------------------
    // Addresses
    // ------------------------------------------------------------------

    fn default_chain(account: &Account) -> Result<(DerivationScheme, String), WalletError> {
        let scheme = account.default_scheme();
        let xpub = account
            .default_xpub()
            .ok_or_else(|| WalletError::corrupted("account without default xpub"))?;
        Ok((scheme, xpub.to_string()))
    }

    fn account_chain(&self, account_index: usize) -> Result<(DerivationScheme, String), WalletError> {
        let current = self.current()?;
        Self::default_chain(current.payload.account(account_index)?)
    }

    /// Position of the next receive address on the account's default chain.
    pub fn position_of_next_receive_address(&self, account_index: usize) -> Result<u32, WalletError> {
        let (scheme, xpub) = self.account_chain(account_index)?;
        Ok(self.allocator.next_receive(&xpub, scheme))
    }

    pub fn next_receive_address(&self, account_index: usize) -> Result<String, WalletError> {
        let (scheme, xpub) = self.account_chain(account_index)?;
        let index = self.allocator.next_receive(&xpub, scheme);
        Ok(self.derivation.address_at(&xpub, scheme, Chain::Receive, index)?)
    }

    pub fn next_change_address(&self, account_index: usize) -> Result<String, WalletError> {
        let (scheme, xpub) = self.account_chain(account_index)?;
        let index = self.allocator.next_change(&xpub, scheme);
        Ok(self.derivation.address_at(&xpub, scheme, Chain::Change, index)?)
    }

    /// Receive address `position` steps past the next unused one. `None`
    /// when it cannot be derived.
    pub fn receive_address_at_position(&self, account_index: usize, position: u32) -> Option<String> {
        let (scheme, xpub) = self.account_chain(account_index).ok()?;
        let index = self.allocator.next_receive(&xpub, scheme).checked_add(position)?;
        match self.derivation.address_at(&xpub, scheme, Chain::Receive, index) {
            Ok(address) => Some(address),
            Err(e) => {
                warn!(account = account_index, index, error = %e, "receive address derivation failed");
                None
            }
        }
    }

    /// Label receive index `index` of an account. Reserving an index again
    /// under the same label succeeds without a write.
    pub async fn reserve_address(&self, account_index: usize, index: u32, label: &str) -> Result<Arc<Committed>, WalletError> {
        let current = self.current()?;
        if current.payload.account(account_index)?.address_label(index) == Some(label) {
            return Ok(current);
        }
        let committed = self
            .mutate(false, |p| p.with_address_label(account_index, index, label))
            .await?;
        info!(guid = committed.payload.guid(), account = account_index, index, "address reserved");
        Ok(committed)
    }

    /// Reserve the next receive index under `label` and return its address.
    pub async fn next_receive_address_and_reserve(&self, account_index: usize, label: &str) -> Result<String, WalletError> {
        let allocator = self.allocator.as_ref();
        let mut chosen = None;
        self.mutate(false, |p| {
            let (scheme, xpub) = Self::default_chain(p.account(account_index)?)?;
            let index = allocator.next_receive(&xpub, scheme);
            chosen = Some((scheme, xpub, index));
            p.with_address_label(account_index, index, label)
        })
        .await?;
        let (scheme, xpub, index) = chosen.ok_or_else(|| WalletError::corrupted("reserved index missing after commit"))?;
        Ok(self.derivation.address_at(&xpub, scheme, Chain::Receive, index)?)
    }

    /// Next receive index of an account under `scheme`.
    pub fn next_receive_index(&self, account_index: usize, scheme: DerivationScheme) -> Result<u32, WalletError> {
        let current = self.current()?;
        let xpub = Self::scheme_xpub(current.payload.account(account_index)?, scheme)?;
        Ok(self.allocator.next_receive(&xpub, scheme))
    }

    /// Next change index of an account under `scheme`.
    pub fn next_change_index(&self, account_index: usize, scheme: DerivationScheme) -> Result<u32, WalletError> {
        let current = self.current()?;
        let xpub = Self::scheme_xpub(current.payload.account(account_index)?, scheme)?;
        Ok(self.allocator.next_change(&xpub, scheme))
    }

    fn scheme_xpub(account: &Account, scheme: DerivationScheme) -> Result<String, WalletError> {
        account
            .xpub(scheme)
            .map(str::to_string)
            .ok_or_else(|| ValidationError::InvalidInput(format!("account has no {scheme} derivation")).into())
    }

    /// Record observed usage of `index` on an account's chain.
    pub fn advance(&self, account_index: usize, scheme: DerivationScheme, chain: Chain, observed: u32) -> Result<u32, WalletError> {
        let current = self.current()?;
        let xpub = Self::scheme_xpub(current.payload.account(account_index)?, scheme)?;
        Ok(self.allocator.advance(&xpub, scheme, chain, observed))
    }

    /// Move the default receive chain one past its current position.
    pub fn increment_next_receive_address(&self, account_index: usize) -> Result<u32, WalletError> {
        let (scheme, xpub) = self.account_chain(account_index)?;
        let observed = self.allocator.next_receive(&xpub, scheme);
        Ok(self.allocator.advance_receive(&xpub, scheme, observed))
    }

    /// Move the default change chain one past its current position.
    pub fn increment_next_change_address(&self, account_index: usize) -> Result<u32, WalletError> {
        let (scheme, xpub) = self.account_chain(account_index)?;
        let observed = self.allocator.next_change(&xpub, scheme);
        Ok(self.allocator.advance_change(&xpub, scheme, observed))
    }

    /// Seed the allocator from chain usage and the committed labels.
    pub async fn refresh_indexes(&self) -> Result<(), WalletError> {
        let current = self.current()?;
        let xpubs: Vec<String> = current
            .payload
            .accounts()
            .iter()
            .flat_map(|a| a.derivations().iter().map(|d| d.xpub.clone()))
            .collect();
        let usage = if xpubs.is_empty() {
            HashMap::new()
        } else {
            self.indexer.usage(&xpubs).await?
        };
        self.allocator.rebuild(&current.payload, &usage);
        Ok(())
    }

    /// Account, scheme and xpub of the HD chain that derives `address`.
    /// Each chain is scanned up to the lookahead past its next index.
    fn hd_owner(&self, payload: &WalletPayload, address: &str) -> Option<(usize, DerivationScheme, String)> {
        for (account_index, account) in payload.accounts().iter().enumerate() {
            for derivation in account.derivations() {
                for chain in [Chain::Receive, Chain::Change] {
                    let used = match chain {
                        Chain::Receive => self.allocator.next_receive(&derivation.xpub, derivation.scheme),
                        Chain::Change => self.allocator.next_change(&derivation.xpub, derivation.scheme),
                    };
                    let upper = used.saturating_add(self.config.sync_lookahead);
                    let owned = (0..upper).any(|i| {
                        self.derivation
                            .address_at(&derivation.xpub, derivation.scheme, chain, i)
                            .is_ok_and(|a| a == address)
                    });
                    if owned {
                        return Some((account_index, derivation.scheme, derivation.xpub.clone()));
                    }
                }
            }
        }
        None
    }

    /// Xpub of the account chain that derives `address`.
    pub fn xpub_for_address(&self, address: &str) -> Option<String> {
        let current = self.sync.snapshot()?;
        self.hd_owner(&current.payload, address).map(|(_, _, xpub)| xpub)
    }

    /// Whether one of the wallet's HD accounts derives `address`.
    pub fn is_own_hd_address(&self, address: &str) -> bool {
        self.xpub_for_address(address).is_some()
    }

    /// WIF key of an HD address, derived from the account's extended
    /// private key.
    pub fn signing_key_for(
        &self,
        account_index: usize,
        scheme: DerivationScheme,
        chain: Chain,
        index: u32,
        second_password: Option<&str>,
    ) -> Result<Zeroizing<String>, WalletError> {
        let current = self.current()?;
        let xpriv = current
            .payload
            .reveal_account_xpriv(account_index, scheme, second_password, self.cipher.as_ref())?;
        Ok(Zeroizing::new(self.derivation.signing_key(&xpriv, chain, index)?))
    }

    /// Human-readable label of an address: the imported label, the label of
    /// the owning account, or else the address itself.
    pub fn label_for_address(&self, address: &str) -> String {
        let Some(current) = self.sync.snapshot() else {
            return address.to_string();
        };
        let payload = &current.payload;
        if let Some(imported) = payload.imported_address(address) {
            return imported.display_label().to_string();
        }
        self.hd_owner(payload, address)
            .and_then(|(account_index, _, _)| payload.accounts().get(account_index))
            .map_or_else(|| address.to_string(), |account| account.label().to_string())
    }

    // ------------------------------------------------------------------
    // Balances
    // ------------------------------------------------------------------

    /// Fetch balances of every active xpub and active imported address in
    /// one batch. Returns the wallet total.
    pub async fn refresh_balances(&self) -> Result<u64, WalletError> {
        let current = self.current()?;
        let payload = &current.payload;
        let mut keys: Vec<String> = payload
            .active_accounts()
            .flat_map(|(_, a)| a.xpubs().into_values().map(str::to_string))
            .collect();
        keys.extend(payload.active_imported().map(|i| i.address().to_string()));
        self.balances.fetch(&keys).await?;
        Ok(self.balances.wallet_total(payload))
    }

    pub fn account_balance(&self, account_index: usize) -> Result<BalanceEntry, WalletError> {
        let current = self.current()?;
        Ok(self.balances.account_total(current.payload.account(account_index)?))
    }

    pub fn wallet_balance(&self) -> u64 {
        self.sync
            .snapshot()
            .map_or(0, |c| self.balances.wallet_total(&c.payload))
    }

    pub fn imported_balance(&self) -> u64 {
        self.sync
            .snapshot()
            .map_or(0, |c| self.balances.imported_total(&c.payload))
    }

    /// Cached balance of one xpub or address.
    pub fn address_balance(&self, key: &str) -> BalanceEntry {
        self.balances.balance(key)
    }

    pub fn apply_delta(&self, key: &str, amount: i64) -> BalanceEntry {
        self.balances.apply_delta(key, amount)
    }
}
