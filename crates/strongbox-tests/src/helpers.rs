//! Shared fakes and fixtures.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::Notify;

use strongbox_core::error::{DerivationError, TransportError};
use strongbox_core::traits::{
    AccountKeys, ChainIndexer, InsertRequest, KeyDerivation, RemoteStore, StoreError, UpdateRequest,
};
use strongbox_core::types::{BalanceEntry, Chain, ChainUsage, DerivationScheme};
use strongbox_wallet::mnemonic;
use strongbox_wallet::{Bip32Derivation, MemoryStore, PayloadManager, WalletConfig};

/// Main password used by fixtures.
pub const PASSWORD: &str = "correct horse battery staple";

/// Fixture email.
pub const EMAIL: &str = "user@example.com";

/// Configuration with a cheap stretching cost and a device identity.
pub fn test_config() -> WalletConfig {
    WalletConfig {
        pbkdf2_iterations: 1,
        ..WalletConfig::default()
    }
    .with_device("android", "6.1.0")
}

/// Balance entry shorthand.
pub fn entry(final_balance: u64, total_received: u64, tx_count: u64) -> BalanceEntry {
    BalanceEntry {
        final_balance,
        total_received,
        tx_count,
    }
}

/// Chain indexer answering from in-memory tables.
#[derive(Default)]
pub struct ScriptedIndexer {
    balances: RwLock<HashMap<String, BalanceEntry>>,
    usage: RwLock<HashMap<String, ChainUsage>>,
    fail: RwLock<Option<TransportError>>,
    calls: AtomicUsize,
}

impl ScriptedIndexer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_balance(&self, key: impl Into<String>, balance: BalanceEntry) {
        self.balances.write().insert(key.into(), balance);
    }

    pub fn set_usage(&self, xpub: impl Into<String>, usage: ChainUsage) {
        self.usage.write().insert(xpub.into(), usage);
    }

    /// Fail every request with `err` until cleared with `None`.
    pub fn set_failure(&self, err: Option<TransportError>) {
        *self.fail.write() = err;
    }

    /// Number of batched requests served or refused.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<(), TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.fail.read().clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ChainIndexer for ScriptedIndexer {
    async fn balances(&self, keys: &[String]) -> Result<HashMap<String, BalanceEntry>, TransportError> {
        self.check()?;
        let table = self.balances.read();
        Ok(keys
            .iter()
            .filter_map(|k| table.get(k).map(|b| (k.clone(), *b)))
            .collect())
    }

    async fn usage(&self, xpubs: &[String]) -> Result<HashMap<String, ChainUsage>, TransportError> {
        self.check()?;
        let table = self.usage.read();
        Ok(xpubs
            .iter()
            .filter_map(|x| table.get(x).map(|u| (x.clone(), *u)))
            .collect())
    }
}

/// BIP-32 derivation that refuses one (scheme, account) pair.
pub struct FailingDerivation {
    inner: Bip32Derivation,
    scheme: DerivationScheme,
    account: u32,
}

impl FailingDerivation {
    pub fn new(scheme: DerivationScheme, account: u32) -> Self {
        Self {
            inner: Bip32Derivation::default(),
            scheme,
            account,
        }
    }
}

impl KeyDerivation for FailingDerivation {
    fn account_keys(&self, seed: &[u8], scheme: DerivationScheme, account_index: u32) -> Result<AccountKeys, DerivationError> {
        if scheme == self.scheme && account_index == self.account {
            return Err(DerivationError::Derivation(format!("refusing {scheme} account {account_index}")));
        }
        self.inner.account_keys(seed, scheme, account_index)
    }

    fn address_at(&self, xpub: &str, scheme: DerivationScheme, chain: Chain, index: u32) -> Result<String, DerivationError> {
        self.inner.address_at(xpub, scheme, chain, index)
    }

    fn signing_key(&self, xpriv: &str, chain: Chain, index: u32) -> Result<String, DerivationError> {
        self.inner.signing_key(xpriv, chain, index)
    }

    fn address_for_key(&self, wif: &str, scheme: DerivationScheme) -> Result<String, DerivationError> {
        self.inner.address_for_key(wif, scheme)
    }
}

/// Store whose next update waits until [`GatedStore::open`] is called.
pub struct GatedStore {
    inner: Arc<MemoryStore>,
    armed: AtomicBool,
    gate: Notify,
}

impl GatedStore {
    pub fn new(inner: Arc<MemoryStore>) -> Self {
        Self {
            inner,
            armed: AtomicBool::new(false),
            gate: Notify::new(),
        }
    }

    /// Hold the next update until the gate opens.
    pub fn hold_next_update(&self) {
        self.armed.store(true, Ordering::SeqCst);
    }

    pub fn open(&self) {
        self.gate.notify_one();
    }
}

#[async_trait]
impl RemoteStore for GatedStore {
    async fn fetch(&self, guid: &str, shared_key: &str) -> Result<String, StoreError> {
        self.inner.fetch(guid, shared_key).await
    }

    async fn insert(&self, request: InsertRequest) -> Result<(), StoreError> {
        self.inner.insert(request).await
    }

    async fn update(&self, request: UpdateRequest) -> Result<(), StoreError> {
        if self.armed.swap(false, Ordering::SeqCst) {
            self.gate.notified().await;
        }
        self.inner.update(request).await
    }
}

/// A manager, its store and its indexer.
pub struct Harness {
    pub manager: PayloadManager,
    pub store: Arc<MemoryStore>,
    pub indexer: Arc<ScriptedIndexer>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: WalletConfig) -> Self {
        let store = Arc::new(MemoryStore::new());
        let indexer = Arc::new(ScriptedIndexer::new());
        let manager = PayloadManager::new(config, store.clone(), indexer.clone());
        Self { manager, store, indexer }
    }

    pub fn with_derivation(derivation: Arc<dyn KeyDerivation>) -> Self {
        let store = Arc::new(MemoryStore::new());
        let indexer = Arc::new(ScriptedIndexer::new());
        let manager = PayloadManager::with_collaborators(
            test_config(),
            store.clone(),
            indexer.clone(),
            Arc::new(strongbox_wallet::AesGcmCipher),
            derivation,
        );
        Self { manager, store, indexer }
    }

    /// Harness whose manager writes through a [`GatedStore`].
    pub fn with_gate() -> (Self, Arc<GatedStore>) {
        let store = Arc::new(MemoryStore::new());
        let gated = Arc::new(GatedStore::new(store.clone()));
        let indexer = Arc::new(ScriptedIndexer::new());
        let manager = PayloadManager::new(test_config(), gated.clone(), indexer.clone());
        (Self { manager, store, indexer }, gated)
    }

    /// Second manager over the same store, as another device would be.
    pub fn second_device(&self) -> PayloadManager {
        PayloadManager::new(test_config(), self.store.clone(), self.indexer.clone())
    }
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}

/// BIP-32 derivation shared by tests that need addresses or keys directly.
pub fn derivation() -> Bip32Derivation {
    Bip32Derivation::default()
}

/// Account-level keys of an arbitrary backup phrase.
pub fn account_keys(phrase: &str, scheme: DerivationScheme, account: u32) -> AccountKeys {
    let entropy = mnemonic::mnemonic_to_entropy(phrase).expect("valid phrase");
    let seed = mnemonic::seed_from_entropy(&entropy).expect("seed");
    derivation().account_keys(&seed, scheme, account).expect("account keys")
}

/// A WIF key unrelated to any test wallet, and its legacy address.
pub fn foreign_key(index: u32) -> (String, String) {
    let d = derivation();
    let seed = mnemonic::seed_from_entropy(&[0x5a; 16]).expect("seed");
    let keys = d.account_keys(&seed, DerivationScheme::Legacy, 0).expect("account keys");
    let wif = d.signing_key(&keys.xpriv, Chain::Receive, index).expect("wif");
    let address = d.address_for_key(&wif, DerivationScheme::Legacy).expect("address");
    (wif, address)
}
