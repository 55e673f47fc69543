//! Checksum-guarded synchronization of the payload with the remote store.
//!
//! The synchronizer owns the committed payload. Readers take an
//! `Arc<Committed>` snapshot; writers are serialized by a single async lock
//! that is held across the whole validate → wrap → submit → commit cycle.
//! The same lock guards the main password, so a save always wraps under
//! the password of the state it builds on, and a password change commits
//! together with the payload it re-wrapped.
//! State is replaced only after the store acknowledges the write, so a
//! failed, timed out or dropped save leaves it exactly as it was.

use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use strongbox_core::error::{ConflictError, ValidationError};
use strongbox_core::traits::{CipherService, InsertRequest, KeyDerivation, RemoteStore, UpdateRequest};
use strongbox_core::types::{Checksum, DerivationScheme, Device};

use crate::allocator::AddressIndexAllocator;
use crate::error::WalletError;
use crate::payload::WalletPayload;
use crate::remote::{fetch_error, write_error};
use crate::wrapper;

/// A payload together with the checksum the remote store holds for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Committed {
    pub payload: WalletPayload,
    pub checksum: Checksum,
}

/// Collaborators shared by the synchronizer.
#[derive(Clone)]
pub struct SyncContext {
    pub store: Arc<dyn RemoteStore>,
    pub cipher: Arc<dyn CipherService>,
    pub derivation: Arc<dyn KeyDerivation>,
    pub allocator: Arc<AddressIndexAllocator>,
    pub device: Option<Device>,
    pub sync_lookahead: u32,
}

pub struct PayloadSynchronizer {
    ctx: SyncContext,
    state: RwLock<Option<Arc<Committed>>>,
    /// Writer lock; holds the main password of the committed state.
    writer: tokio::sync::Mutex<Option<Zeroizing<String>>>,
}

impl PayloadSynchronizer {
    pub fn new(ctx: SyncContext) -> Self {
        Self {
            ctx,
            state: RwLock::new(None),
            writer: tokio::sync::Mutex::new(None),
        }
    }

    pub fn context(&self) -> &SyncContext {
        &self.ctx
    }

    /// The committed state, if any.
    pub fn snapshot(&self) -> Option<Arc<Committed>> {
        self.state.read().clone()
    }

    /// The committed state, or an uninitialized error.
    pub fn current(&self) -> Result<Arc<Committed>, ValidationError> {
        self.snapshot().ok_or(ValidationError::Uninitialized)
    }

    /// Install a new state. `slot` is the writer lock's password, which is
    /// replaced in the same step as the payload and checksum.
    fn commit(
        &self,
        slot: &mut Option<Zeroizing<String>>,
        password: Zeroizing<String>,
        payload: WalletPayload,
        checksum: Checksum,
    ) -> Arc<Committed> {
        self.ctx.allocator.sync_labels(&payload);
        let committed = Arc::new(Committed { payload, checksum });
        *slot = Some(password);
        *self.state.write() = Some(committed.clone());
        committed
    }

    /// Forget the committed state and the password.
    pub async fn clear(&self) {
        let mut slot = self.writer.lock().await;
        *slot = None;
        *self.state.write() = None;
        self.ctx.allocator.clear();
    }

    /// Whether `candidate` is the main password of the committed state.
    pub async fn is_main_password(&self, candidate: &str) -> bool {
        self.writer
            .lock()
            .await
            .as_ref()
            .is_some_and(|p| p.as_str() == candidate)
    }

    // ------------------------------------------------------------------
    // Loading
    // ------------------------------------------------------------------

    /// Fetch, decrypt and install the stored payload.
    pub async fn load(&self, guid: &str, shared_key: &str, password: &str) -> Result<Arc<Committed>, WalletError> {
        let mut slot = self.writer.lock().await;
        let json = self.ctx.store.fetch(guid, shared_key).await.map_err(fetch_error)?;
        let (payload, checksum) = wrapper::unwrap(&json, password, self.ctx.cipher.as_ref())?;
        if payload.guid() != guid || payload.shared_key() != shared_key {
            return Err(ValidationError::CorruptedPayload("stored payload belongs to another wallet".into()).into());
        }
        info!(guid, version = %payload.wrapper_version(), checksum = %checksum, "payload loaded");
        Ok(self.commit(&mut slot, Zeroizing::new(password.to_string()), payload, checksum))
    }

    /// Install a wrapper obtained out of band (e.g. manual pairing).
    pub async fn load_from_json(&self, json: &str, password: &str) -> Result<Arc<Committed>, WalletError> {
        let mut slot = self.writer.lock().await;
        let (payload, checksum) = wrapper::unwrap(json, password, self.ctx.cipher.as_ref())?;
        info!(guid = payload.guid(), version = %payload.wrapper_version(), "payload installed from json");
        Ok(self.commit(&mut slot, Zeroizing::new(password.to_string()), payload, checksum))
    }

    // ------------------------------------------------------------------
    // Saving
    // ------------------------------------------------------------------

    fn device(&self) -> Result<&Device, ValidationError> {
        self.ctx.device.as_ref().ok_or(ValidationError::MissingDevice)
    }

    fn validate(&self, candidate: &WalletPayload, previous: Option<&WalletPayload>) -> Result<(), WalletError> {
        self.device()?;
        candidate.validate()?;
        if let Some(previous) = previous {
            candidate.check_transition_from(previous)?;
        }
        Ok(())
    }

    /// Addresses announced to the store on a public-key sync: the next
    /// receive addresses of every active account under the version's
    /// default scheme, then every active imported address.
    pub fn sync_addresses(&self, payload: &WalletPayload) -> Result<Vec<String>, WalletError> {
        let preferred = DerivationScheme::default_for(payload.wrapper_version());
        let mut addresses = Vec::new();
        for (_, account) in payload.active_accounts() {
            let Some((scheme, xpub)) = account.receive_xpub(preferred) else {
                continue;
            };
            let start = self.ctx.allocator.next_receive(xpub, scheme);
            addresses.extend(
                self.ctx
                    .derivation
                    .receive_addresses(xpub, scheme, start, self.ctx.sync_lookahead)?,
            );
        }
        addresses.extend(payload.active_imported().map(|i| i.address().to_string()));
        Ok(addresses)
    }

    /// Persist the first version of a wallet. No old checksum is sent.
    pub async fn save_new_wallet(
        &self,
        payload: WalletPayload,
        password: &str,
        email: &str,
    ) -> Result<Arc<Committed>, WalletError> {
        let mut slot = self.writer.lock().await;
        self.validate(&payload, None)?;
        let device = self.device()?;
        let wrapped = wrapper::wrap(&payload, password, self.ctx.cipher.as_ref())?;

        self.ctx
            .store
            .insert(InsertRequest {
                guid: payload.guid().to_string(),
                shared_key: payload.shared_key().to_string(),
                payload: wrapped.json,
                checksum: wrapped.checksum.clone(),
                email: email.to_string(),
                device: device.os_type.clone(),
            })
            .await
            .map_err(fetch_error)?;

        info!(guid = payload.guid(), checksum = %wrapped.checksum, "new wallet stored");
        Ok(self.commit(&mut slot, Zeroizing::new(password.to_string()), payload, wrapped.checksum))
    }

    /// Persist `candidate`, which the caller built from the state committed
    /// at `base`. Fails with a stale-candidate conflict when another local
    /// save has committed since.
    pub async fn try_save(
        &self,
        candidate: WalletPayload,
        base: &Checksum,
        sync_pub_keys: bool,
    ) -> Result<Arc<Committed>, WalletError> {
        let mut slot = self.writer.lock().await;
        let current = self.current()?;
        if current.checksum != *base {
            return Err(ConflictError::StaleCandidate { base: base.to_string() }.into());
        }
        let password = slot.clone().ok_or(ValidationError::Uninitialized)?;
        self.save_locked(&mut slot, &current, candidate, password, sync_pub_keys)
            .await
    }

    /// Build a candidate from the committed payload under the writer lock
    /// and persist it under the current main password.
    pub async fn mutate<F>(&self, sync_pub_keys: bool, build: F) -> Result<Arc<Committed>, WalletError>
    where
        F: FnOnce(&WalletPayload) -> Result<WalletPayload, WalletError>,
    {
        self.mutate_with_password(sync_pub_keys, |payload, _| build(payload))
            .await
    }

    /// Like [`mutate`](Self::mutate), with the main password in view of
    /// `build`.
    pub async fn mutate_with_password<F>(&self, sync_pub_keys: bool, build: F) -> Result<Arc<Committed>, WalletError>
    where
        F: FnOnce(&WalletPayload, &str) -> Result<WalletPayload, WalletError>,
    {
        let mut slot = self.writer.lock().await;
        let current = self.current()?;
        let password = slot.clone().ok_or(ValidationError::Uninitialized)?;
        let candidate = build(&current.payload, password.as_str())?;
        self.save_locked(&mut slot, &current, candidate, password, sync_pub_keys)
            .await
    }

    /// Re-wrap the committed payload under `new_password`. The new password
    /// replaces the old one only when the store accepts the write.
    pub async fn rewrap(&self, new_password: &str) -> Result<Arc<Committed>, WalletError> {
        let mut slot = self.writer.lock().await;
        let current = self.current()?;
        let candidate = current.payload.clone();
        self.save_locked(
            &mut slot,
            &current,
            candidate,
            Zeroizing::new(new_password.to_string()),
            false,
        )
        .await
    }

    async fn save_locked(
        &self,
        slot: &mut Option<Zeroizing<String>>,
        current: &Committed,
        candidate: WalletPayload,
        password: Zeroizing<String>,
        sync_pub_keys: bool,
    ) -> Result<Arc<Committed>, WalletError> {
        self.validate(&candidate, Some(&current.payload))?;
        let device = self.device()?;
        let wrapped = wrapper::wrap(&candidate, &password, self.ctx.cipher.as_ref())?;
        let sync_addresses = if sync_pub_keys {
            self.sync_addresses(&candidate)?
        } else {
            Vec::new()
        };
        debug!(
            guid = candidate.guid(),
            old = %current.checksum,
            new = %wrapped.checksum,
            sync = sync_addresses.len(),
            "submitting payload update"
        );

        let result = self
            .ctx
            .store
            .update(UpdateRequest {
                guid: candidate.guid().to_string(),
                shared_key: candidate.shared_key().to_string(),
                sync_addresses,
                payload: wrapped.json,
                new_checksum: wrapped.checksum.clone(),
                old_checksum: current.checksum.clone(),
                device: device.os_type.clone(),
            })
            .await;
        if let Err(err) = result {
            let err = write_error(err, &current.checksum);
            warn!(guid = candidate.guid(), error = %err, "payload update rejected");
            return Err(err);
        }

        info!(
            guid = candidate.guid(),
            version = %candidate.wrapper_version(),
            checksum = %wrapped.checksum,
            "payload committed"
        );
        Ok(self.commit(slot, password, candidate, wrapped.checksum))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encryption::AesGcmCipher;
    use crate::keys::Bip32Derivation;
    use crate::payload::tests::{device, hd_payload};
    use crate::payload::ImportedAddress;
    use crate::remote::MemoryStore;
    use strongbox_core::error::{CredentialError, TransportError};
    use strongbox_core::traits::StoreError;

    const PW: &str = "main-password";

    fn sync_with(store: Arc<MemoryStore>, device: Option<Device>) -> PayloadSynchronizer {
        PayloadSynchronizer::new(SyncContext {
            store,
            cipher: Arc::new(AesGcmCipher),
            derivation: Arc::new(Bip32Derivation::default()),
            allocator: Arc::new(AddressIndexAllocator::new()),
            device,
            sync_lookahead: 20,
        })
    }

    async fn created() -> (Arc<MemoryStore>, PayloadSynchronizer, Arc<Committed>) {
        let store = Arc::new(MemoryStore::new());
        let sync = sync_with(store.clone(), Some(device()));
        let committed = sync.save_new_wallet(hd_payload(), PW, "a@b.c").await.unwrap();
        (store, sync, committed)
    }

    #[tokio::test]
    async fn new_wallet_commits_store_checksum() {
        let (store, sync, committed) = created().await;
        assert_eq!(store.checksum(committed.payload.guid()), Some(committed.checksum.clone()));
        assert_eq!(sync.current().unwrap(), committed);
    }

    #[tokio::test]
    async fn missing_device_blocks_before_network() {
        let store = Arc::new(MemoryStore::new());
        let sync = sync_with(store.clone(), None);
        let p = hd_payload();
        let err = sync.save_new_wallet(p.clone(), PW, "").await.unwrap_err();
        assert_eq!(err, WalletError::Validation(ValidationError::MissingDevice));
        assert!(store.record(p.guid()).is_none());
        assert!(sync.snapshot().is_none());
    }

    #[tokio::test]
    async fn mutate_commits_and_advances_checksum() {
        let (store, sync, before) = created().await;
        let after = sync
            .mutate(false, |p| p.with_tx_note("ab", "lunch"))
            .await
            .unwrap();
        assert_ne!(after.checksum, before.checksum);
        assert_eq!(store.checksum(after.payload.guid()), Some(after.checksum.clone()));
        assert_eq!(sync.current().unwrap().payload.tx_note("ab"), Some("lunch"));
    }

    #[tokio::test]
    async fn remote_conflict_leaves_state_untouched() {
        let (store, sync, before) = created().await;
        assert!(store.overwrite(before.payload.guid(), "{\"foreign\":true}".into()));

        let err = sync
            .mutate(false, |p| p.with_tx_note("ab", "x"))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            WalletError::Conflict(ConflictError::ChecksumMismatch {
                expected: before.checksum.to_string()
            })
        );
        assert_eq!(sync.current().unwrap(), before);
    }

    #[tokio::test]
    async fn stale_candidate_rejected() {
        let (_store, sync, base) = created().await;
        let first = base.payload.with_tx_note("a", "1").unwrap();
        sync.try_save(first, &base.checksum, false).await.unwrap();

        let second = base.payload.with_tx_note("b", "2").unwrap();
        let err = sync.try_save(second, &base.checksum, false).await.unwrap_err();
        assert!(matches!(err, WalletError::Conflict(ConflictError::StaleCandidate { .. })));
        assert_eq!(sync.current().unwrap().payload.tx_note("b"), None);
    }

    #[tokio::test]
    async fn inconsistent_candidate_never_sent() {
        let (store, sync, base) = created().await;
        let updates_before = store.record(base.payload.guid()).unwrap().updates;
        // A payload from another wallet fails the identity transition check.
        let err = sync
            .try_save(hd_payload(), &base.checksum, false)
            .await
            .unwrap_err();
        assert!(matches!(err, WalletError::Validation(ValidationError::CorruptedPayload(_))));
        assert_eq!(store.record(base.payload.guid()).unwrap().updates, updates_before);
    }

    #[tokio::test]
    async fn transport_failure_is_retryable_and_keeps_state() {
        let (store, sync, before) = created().await;
        store.fail_next(StoreError::Timeout);
        let err = sync
            .mutate(false, |p| p.with_tx_note("ab", "x"))
            .await
            .unwrap_err();
        assert_eq!(err, WalletError::Transport(TransportError::Timeout));
        assert!(err.is_retryable());
        assert_eq!(sync.current().unwrap(), before);
    }

    #[tokio::test]
    async fn sync_list_covers_lookahead_and_imported() {
        let (store, sync, _) = created().await;
        let committed = sync
            .mutate(true, |p| {
                p.with_imported_address(ImportedAddress::watch_only("1Live", ""))?
                    .with_imported_address(ImportedAddress::watch_only("1Gone", ""))?
                    .with_imported_archived("1Gone", true)
            })
            .await
            .unwrap();
        let record = store.record(committed.payload.guid()).unwrap();
        assert_eq!(record.sync_addresses.len(), 21);
        assert_eq!(record.sync_addresses.last().map(String::as_str), Some("1Live"));
    }

    #[tokio::test]
    async fn load_roundtrip_and_bad_password() {
        let (store, _sync, committed) = created().await;
        let fresh = sync_with(store.clone(), Some(device()));
        let loaded = fresh
            .load(committed.payload.guid(), committed.payload.shared_key(), PW)
            .await
            .unwrap();
        assert_eq!(loaded, committed);

        let other = sync_with(store, Some(device()));
        let err = other
            .load(committed.payload.guid(), committed.payload.shared_key(), "wrong")
            .await
            .unwrap_err();
        assert_eq!(err, WalletError::Credential(CredentialError::InvalidPassword));
        assert!(other.snapshot().is_none());
    }

    #[tokio::test]
    async fn uninitialized_mutation_fails() {
        let sync = sync_with(Arc::new(MemoryStore::new()), Some(device()));
        let err = sync.mutate(false, |p| Ok(p.clone())).await.unwrap_err();
        assert_eq!(err, WalletError::Validation(ValidationError::Uninitialized));
    }

    #[tokio::test]
    async fn dropped_save_does_not_commit() {
        let (_store, sync, before) = created().await;
        let save = sync.mutate(false, |p| p.with_tx_note("ab", "x"));
        drop(save);
        assert_eq!(sync.current().unwrap(), before);
        // Lock was released: a later save goes through.
        assert!(sync.mutate(false, |p| p.with_tx_note("cd", "y")).await.is_ok());
    }

    #[tokio::test]
    async fn rewrap_switches_password_for_later_saves() {
        let (store, sync, _) = created().await;
        sync.rewrap("next-password").await.unwrap();
        assert!(sync.is_main_password("next-password").await);
        assert!(!sync.is_main_password(PW).await);

        // A later save keeps wrapping under the new password.
        let committed = sync.mutate(false, |p| p.with_tx_note("ab", "x")).await.unwrap();
        let (guid, key) = (committed.payload.guid(), committed.payload.shared_key());
        let fresh = sync_with(store.clone(), Some(device()));
        assert_eq!(fresh.load(guid, key, "next-password").await.unwrap(), committed);
        let err = sync_with(store, Some(device())).load(guid, key, PW).await.unwrap_err();
        assert_eq!(err, WalletError::Credential(CredentialError::InvalidPassword));
    }

    #[tokio::test]
    async fn failed_rewrap_keeps_old_password() {
        let (store, sync, before) = created().await;
        store.fail_next(StoreError::Timeout);
        assert!(sync.rewrap("next-password").await.is_err());
        assert!(sync.is_main_password(PW).await);
        assert_eq!(sync.current().unwrap(), before);
    }

    #[tokio::test]
    async fn clear_forgets_password() {
        let (_store, sync, _) = created().await;
        sync.clear().await;
        assert!(!sync.is_main_password(PW).await);
    }
}
