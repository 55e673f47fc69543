//! Next-unused address index bookkeeping.
//!
//! Derived state, rebuilt at any time from the committed payload's address
//! labels and from chain observation. Each (xpub, scheme) pair owns an
//! independent receive counter and change counter.

use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

use strongbox_core::types::{Chain, ChainUsage, DerivationScheme};

use crate::payload::WalletPayload;

/// Allocator state of one xpub under one scheme.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddressIndexState {
    pub next_receive: u32,
    pub next_change: u32,
    /// Receive indexes reserved under a label.
    pub reserved: BTreeMap<u32, String>,
}

impl AddressIndexState {
    /// First receive index at or after `next_receive` that is not reserved.
    pub fn first_free_receive(&self) -> u32 {
        let mut index = self.next_receive;
        while self.reserved.contains_key(&index) {
            index = index.saturating_add(1);
        }
        index
    }

    fn counter(&mut self, chain: Chain) -> &mut u32 {
        match chain {
            Chain::Receive => &mut self.next_receive,
            Chain::Change => &mut self.next_change,
        }
    }
}

type Key = (String, DerivationScheme);

/// Cache of [`AddressIndexState`] keyed by (xpub, scheme).
#[derive(Default)]
pub struct AddressIndexAllocator {
    states: RwLock<HashMap<Key, AddressIndexState>>,
}

impl AddressIndexAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of one chain pair. Unknown pairs start at zero.
    pub fn state(&self, xpub: &str, scheme: DerivationScheme) -> AddressIndexState {
        self.states
            .read()
            .get(&(xpub.to_string(), scheme))
            .cloned()
            .unwrap_or_default()
    }

    /// Next receive index, skipping reserved indexes. Pure read.
    pub fn next_receive(&self, xpub: &str, scheme: DerivationScheme) -> u32 {
        self.state(xpub, scheme).first_free_receive()
    }

    /// Next change index. Pure read.
    pub fn next_change(&self, xpub: &str, scheme: DerivationScheme) -> u32 {
        self.state(xpub, scheme).next_change
    }

    /// Record that `observed` on `chain` has been used. The counter becomes
    /// `observed + 1` unless it is already past it, so repeating the same
    /// observation, or applying observations out of order, never moves it
    /// backwards. Returns the resulting counter.
    pub fn advance(&self, xpub: &str, scheme: DerivationScheme, chain: Chain, observed: u32) -> u32 {
        let mut states = self.states.write();
        let state = states.entry((xpub.to_string(), scheme)).or_default();
        let counter = state.counter(chain);
        let candidate = observed.saturating_add(1);
        if candidate > *counter {
            *counter = candidate;
        }
        *counter
    }

    pub fn advance_receive(&self, xpub: &str, scheme: DerivationScheme, observed: u32) -> u32 {
        self.advance(xpub, scheme, Chain::Receive, observed)
    }

    pub fn advance_change(&self, xpub: &str, scheme: DerivationScheme, observed: u32) -> u32 {
        self.advance(xpub, scheme, Chain::Change, observed)
    }

    /// Seed counters from a chain usage report. Counters only move forward.
    pub fn observe_usage(&self, xpub: &str, scheme: DerivationScheme, usage: ChainUsage) {
        let mut states = self.states.write();
        let state = states.entry((xpub.to_string(), scheme)).or_default();
        state.next_receive = state.next_receive.max(usage.next_receive);
        state.next_change = state.next_change.max(usage.next_change);
    }

    /// Replace the reserved labels of every account's default chain with
    /// those recorded in `payload`. Counters are kept.
    pub fn sync_labels(&self, payload: &WalletPayload) {
        let mut states = self.states.write();
        for account in payload.accounts() {
            let scheme = account.default_scheme();
            if let Some(xpub) = account.default_xpub() {
                let state = states.entry((xpub.to_string(), scheme)).or_default();
                state.reserved = account.address_labels().clone();
            }
            // Labels follow the default chain; other chains keep no reservations.
            for derivation in account.derivations().iter().filter(|d| d.scheme != scheme) {
                if let Some(state) = states.get_mut(&(derivation.xpub.clone(), derivation.scheme)) {
                    state.reserved.clear();
                }
            }
        }
    }

    /// Rebuild from the payload and a usage report keyed by xpub.
    pub fn rebuild(&self, payload: &WalletPayload, usage: &HashMap<String, ChainUsage>) {
        for account in payload.accounts() {
            for derivation in account.derivations() {
                if let Some(report) = usage.get(&derivation.xpub) {
                    self.observe_usage(&derivation.xpub, derivation.scheme, *report);
                }
            }
        }
        self.sync_labels(payload);
        debug!(accounts = payload.accounts().len(), xpubs = usage.len(), "address indexes rebuilt");
    }

    pub fn clear(&self) {
        self.states.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::tests::hd_payload;

    const LEGACY: DerivationScheme = DerivationScheme::Legacy;
    const SEGWIT: DerivationScheme = DerivationScheme::SegwitBech32;

    #[test]
    fn fresh_chain_starts_at_zero() {
        let a = AddressIndexAllocator::new();
        assert_eq!(a.next_receive("x", LEGACY), 0);
        assert_eq!(a.next_change("x", LEGACY), 0);
    }

    #[test]
    fn advance_is_compare_and_set() {
        let a = AddressIndexAllocator::new();
        assert_eq!(a.advance_receive("x", LEGACY, 4), 5);
        // Same observation twice: no double increment.
        assert_eq!(a.advance_receive("x", LEGACY, 4), 5);
        // Older observation: no decrement.
        assert_eq!(a.advance_receive("x", LEGACY, 1), 5);
        assert_eq!(a.next_receive("x", LEGACY), 5);
    }

    #[test]
    fn schemes_and_chains_are_independent() {
        let a = AddressIndexAllocator::new();
        a.advance_receive("x", LEGACY, 9);
        a.advance_change("x", SEGWIT, 2);
        assert_eq!(a.next_receive("x", LEGACY), 10);
        assert_eq!(a.next_change("x", LEGACY), 0);
        assert_eq!(a.next_receive("x", SEGWIT), 0);
        assert_eq!(a.next_change("x", SEGWIT), 3);
    }

    #[test]
    fn next_receive_skips_reserved() {
        let p = hd_payload()
            .with_address_label(0, 0, "a")
            .unwrap()
            .with_address_label(0, 1, "b")
            .unwrap()
            .with_address_label(0, 3, "c")
            .unwrap();
        let xpub = p.accounts()[0].default_xpub().unwrap().to_string();
        let a = AddressIndexAllocator::new();
        a.sync_labels(&p);
        assert_eq!(a.next_receive(&xpub, LEGACY), 2);
        a.advance_receive(&xpub, LEGACY, 2);
        assert_eq!(a.next_receive(&xpub, LEGACY), 4);
        // Change chain ignores receive reservations.
        assert_eq!(a.next_change(&xpub, LEGACY), 0);
    }

    #[test]
    fn reservations_move_with_default_chain() {
        let d = crate::keys::Bip32Derivation::default();
        let cipher = crate::encryption::AesGcmCipher;
        let v3 = hd_payload().with_address_label(0, 0, "a").unwrap();
        let legacy = v3.accounts()[0].default_xpub().unwrap().to_string();
        let a = AddressIndexAllocator::new();
        a.sync_labels(&v3);
        assert_eq!(a.next_receive(&legacy, LEGACY), 1);

        let v4 = v3.upgrade_v3_to_v4(None, &cipher, &d).unwrap();
        a.sync_labels(&v4);
        let segwit = v4.accounts()[0].xpub(SEGWIT).unwrap().to_string();
        assert_eq!(a.next_receive(&segwit, SEGWIT), 1);
        assert!(a.state(&legacy, LEGACY).reserved.is_empty());
        assert_eq!(a.next_receive(&legacy, LEGACY), 0);
    }

    #[test]
    fn rebuild_takes_max_of_usage() {
        let p = hd_payload();
        let xpub = p.accounts()[0].default_xpub().unwrap().to_string();
        let a = AddressIndexAllocator::new();
        a.advance_receive(&xpub, LEGACY, 10);

        let usage = HashMap::from([(
            xpub.clone(),
            ChainUsage {
                next_receive: 3,
                next_change: 7,
            },
        )]);
        a.rebuild(&p, &usage);
        assert_eq!(a.next_receive(&xpub, LEGACY), 11);
        assert_eq!(a.next_change(&xpub, LEGACY), 7);
    }

    #[test]
    fn clear_resets() {
        let a = AddressIndexAllocator::new();
        a.advance_receive("x", LEGACY, 3);
        a.clear();
        assert_eq!(a.state("x", LEGACY), AddressIndexState::default());
    }
}
