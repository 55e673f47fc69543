//! Balance fetching and cross-scheme aggregation.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use strongbox_core::error::TransportError;
use strongbox_core::traits::ChainIndexer;
use strongbox_core::types::BalanceEntry;

use crate::error::WalletError;
use crate::payload::{Account, WalletPayload};

/// Caches one [`BalanceEntry`] per xpub or imported address.
///
/// Entries adjusted through [`apply_delta`](Self::apply_delta) are advisory
/// until the next [`fetch`](Self::fetch) replaces them.
pub struct BalanceAggregator {
    indexer: Arc<dyn ChainIndexer>,
    cache: RwLock<HashMap<String, BalanceEntry>>,
}

impl BalanceAggregator {
    pub fn new(indexer: Arc<dyn ChainIndexer>) -> Self {
        Self {
            indexer,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Query every key in one batch. Any failure of the batch is reported
    /// once for the whole request and leaves the cache untouched. Requested
    /// keys missing from the response are cached as zero.
    pub async fn fetch(&self, keys: &[String]) -> Result<HashMap<String, BalanceEntry>, WalletError> {
        if keys.is_empty() {
            return Ok(HashMap::new());
        }
        let response = self.indexer.balances(keys).await.map_err(|e| {
            warn!(keys = keys.len(), error = %e, "balance batch failed");
            WalletError::from(TransportError::BatchFailed(e.to_string()))
        })?;

        let resolved: HashMap<String, BalanceEntry> = keys
            .iter()
            .map(|k| (k.clone(), response.get(k).copied().unwrap_or(BalanceEntry::ZERO)))
            .collect();
        self.cache
            .write()
            .extend(resolved.iter().map(|(k, v)| (k.clone(), *v)));
        debug!(keys = keys.len(), "balances refreshed");
        Ok(resolved)
    }

    /// Cached entry of one key; zero when never fetched.
    pub fn balance(&self, key: &str) -> BalanceEntry {
        self.cache.read().get(key).copied().unwrap_or(BalanceEntry::ZERO)
    }

    /// Sum of the account's entries across every scheme it carries.
    pub fn account_total(&self, account: &Account) -> BalanceEntry {
        let cache = self.cache.read();
        account
            .xpubs()
            .values()
            .map(|xpub| cache.get(*xpub).copied().unwrap_or(BalanceEntry::ZERO))
            .fold(BalanceEntry::ZERO, |acc, e| acc.merge(&e))
    }

    /// Final balance of every non-archived imported address.
    pub fn imported_total(&self, payload: &WalletPayload) -> u64 {
        let cache = self.cache.read();
        payload
            .active_imported()
            .map(|i| cache.get(i.address()).map_or(0, |e| e.final_balance))
            .fold(0u64, u64::saturating_add)
    }

    /// Final balance of every active account plus [`imported_total`](Self::imported_total).
    pub fn wallet_total(&self, payload: &WalletPayload) -> u64 {
        payload
            .active_accounts()
            .map(|(_, a)| self.account_total(a).final_balance)
            .fold(self.imported_total(payload), u64::saturating_add)
    }

    /// Adjust a cached entry after a locally originated spend or receive.
    pub fn apply_delta(&self, key: &str, amount: i64) -> BalanceEntry {
        let mut cache = self.cache.write();
        let entry = cache.entry(key.to_string()).or_insert(BalanceEntry::ZERO);
        *entry = entry.with_delta(amount);
        *entry
    }

    pub fn clear(&self) {
        self.cache.write().clear();
    }
}
