//! Remote store failure classification and an in-memory store.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use parking_lot::Mutex;

use strongbox_core::constants::{ACCOUNT_LOCKED_MARKER, UNKNOWN_WALLET_MARKER};
use strongbox_core::error::{ConflictError, CredentialError, TransportError};
use strongbox_core::traits::{InsertRequest, RemoteStore, StoreError, UpdateRequest};
use strongbox_core::types::Checksum;

use crate::error::WalletError;

/// Classify a server message by its known substrings.
pub fn classify_fetch_failure(message: &str) -> WalletError {
    if message.contains(UNKNOWN_WALLET_MARKER) {
        CredentialError::InvalidCredentials.into()
    } else if message.to_lowercase().contains(ACCOUNT_LOCKED_MARKER) {
        CredentialError::AccountLocked(message.to_string()).into()
    } else {
        TransportError::Server(message.to_string()).into()
    }
}

pub(crate) fn fetch_error(err: StoreError) -> WalletError {
    match err {
        StoreError::Rejected(message) => classify_fetch_failure(&message),
        StoreError::Timeout => TransportError::Timeout.into(),
        StoreError::Cancelled => TransportError::Cancelled.into(),
        StoreError::ChecksumMismatch => TransportError::Server("unexpected checksum mismatch on fetch".into()).into(),
    }
}

pub(crate) fn write_error(err: StoreError, expected: &Checksum) -> WalletError {
    match err {
        StoreError::ChecksumMismatch => ConflictError::ChecksumMismatch {
            expected: expected.to_string(),
        }
        .into(),
        other => fetch_error(other),
    }
}

/// A stored wallet record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRecord {
    pub shared_key: String,
    pub payload: String,
    pub checksum: Checksum,
    pub email: String,
    pub device: String,
    /// Addresses submitted with the last update.
    pub sync_addresses: Vec<String>,
    pub updates: u64,
}

#[derive(Default)]
struct State {
    records: HashMap<String, StoredRecord>,
    locked: HashSet<String>,
    fail_next: Option<StoreError>,
}

/// [`RemoteStore`] kept in process memory. Enforces the checksum
/// precondition on update and lets tests play a second writer.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, guid: &str) -> Option<StoredRecord> {
        self.state.lock().records.get(guid).cloned()
    }

    pub fn checksum(&self, guid: &str) -> Option<Checksum> {
        self.state.lock().records.get(guid).map(|r| r.checksum.clone())
    }

    /// Replace the stored payload as another device would.
    pub fn overwrite(&self, guid: &str, payload: String) -> bool {
        let mut state = self.state.lock();
        match state.records.get_mut(guid) {
            Some(record) => {
                record.checksum = Checksum::of(payload.as_bytes());
                record.payload = payload;
                record.updates += 1;
                true
            }
            None => false,
        }
    }

    /// Make the next call fail with `err`.
    pub fn fail_next(&self, err: StoreError) {
        self.state.lock().fail_next = Some(err);
    }

    pub fn set_locked(&self, guid: &str, locked: bool) {
        let mut state = self.state.lock();
        if locked {
            state.locked.insert(guid.to_string());
        } else {
            state.locked.remove(guid);
        }
    }

    fn take_failure(state: &mut State) -> Result<(), StoreError> {
        match state.fail_next.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn unknown() -> StoreError {
        StoreError::Rejected(format!("{UNKNOWN_WALLET_MARKER}. Please check your credentials."))
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    async fn fetch(&self, guid: &str, shared_key: &str) -> Result<String, StoreError> {
        let mut state = self.state.lock();
        Self::take_failure(&mut state)?;
        if state.locked.contains(guid) {
            return Err(StoreError::Rejected("Wallet access locked after failed attempts".into()));
        }
        match state.records.get(guid) {
            Some(record) if record.shared_key == shared_key => Ok(record.payload.clone()),
            _ => Err(Self::unknown()),
        }
    }

    async fn insert(&self, request: InsertRequest) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        Self::take_failure(&mut state)?;
        if state.records.contains_key(&request.guid) {
            return Err(StoreError::Rejected("Wallet identifier already exists".into()));
        }
        state.records.insert(
            request.guid,
            StoredRecord {
                shared_key: request.shared_key,
                payload: request.payload,
                checksum: request.checksum,
                email: request.email,
                device: request.device,
                sync_addresses: Vec::new(),
                updates: 0,
            },
        );
        Ok(())
    }

    async fn update(&self, request: UpdateRequest) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        Self::take_failure(&mut state)?;
        let record = match state.records.get_mut(&request.guid) {
            Some(record) if record.shared_key == request.shared_key => record,
            _ => return Err(Self::unknown()),
        };
        if record.checksum != request.old_checksum {
            return Err(StoreError::ChecksumMismatch);
        }
        record.payload = request.payload;
        record.checksum = request.new_checksum;
        record.device = request.device;
        record.sync_addresses = request.sync_addresses;
        record.updates += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strongbox_core::error::ValidationError;

    fn insert_request(guid: &str) -> InsertRequest {
        InsertRequest {
            guid: guid.into(),
            shared_key: "sk".into(),
            payload: "p0".into(),
            checksum: Checksum::of(b"p0"),
            email: "a@b.c".into(),
            device: "android".into(),
        }
    }

    fn update_request(guid: &str, old: &[u8], new: &[u8]) -> UpdateRequest {
        UpdateRequest {
            guid: guid.into(),
            shared_key: "sk".into(),
            sync_addresses: vec!["1A".into()],
            payload: String::from_utf8_lossy(new).into_owned(),
            new_checksum: Checksum::of(new),
            old_checksum: Checksum::of(old),
            device: "android".into(),
        }
    }

    #[test]
    fn classify_known_messages() {
        assert_eq!(
            classify_fetch_failure("Unknown Wallet Identifier. Please check"),
            WalletError::Credential(CredentialError::InvalidCredentials)
        );
        assert!(matches!(
            classify_fetch_failure("Wallet access Locked"),
            WalletError::Credential(CredentialError::AccountLocked(_))
        ));
        assert_eq!(
            classify_fetch_failure("Internal error"),
            WalletError::Transport(TransportError::Server("Internal error".into()))
        );
    }

    #[test]
    fn write_error_mapping() {
        let expected = Checksum::of(b"x");
        assert_eq!(
            write_error(StoreError::ChecksumMismatch, &expected),
            WalletError::Conflict(ConflictError::ChecksumMismatch {
                expected: expected.to_string()
            })
        );
        assert_eq!(
            write_error(StoreError::Timeout, &expected),
            WalletError::Transport(TransportError::Timeout)
        );
        assert_ne!(
            write_error(StoreError::Cancelled, &expected),
            WalletError::Validation(ValidationError::Uninitialized)
        );
    }

    #[tokio::test]
    async fn insert_fetch_update() {
        let store = MemoryStore::new();
        store.insert(insert_request("g")).await.unwrap();
        assert_eq!(store.fetch("g", "sk").await.unwrap(), "p0");

        store.update(update_request("g", b"p0", b"p1")).await.unwrap();
        let record = store.record("g").unwrap();
        assert_eq!(record.payload, "p1");
        assert_eq!(record.sync_addresses, vec!["1A".to_string()]);
        assert_eq!(record.updates, 1);
    }

    #[tokio::test]
    async fn stale_update_rejected() {
        let store = MemoryStore::new();
        store.insert(insert_request("g")).await.unwrap();
        store.update(update_request("g", b"p0", b"p1")).await.unwrap();
        let err = store.update(update_request("g", b"p0", b"p2")).await.unwrap_err();
        assert_eq!(err, StoreError::ChecksumMismatch);
        assert_eq!(store.record("g").unwrap().payload, "p1");
    }

    #[tokio::test]
    async fn unknown_and_locked() {
        let store = MemoryStore::new();
        store.insert(insert_request("g")).await.unwrap();
        let err = store.fetch("g", "wrong").await.unwrap_err();
        assert!(matches!(fetch_error(err), WalletError::Credential(CredentialError::InvalidCredentials)));

        store.set_locked("g", true);
        let err = store.fetch("g", "sk").await.unwrap_err();
        assert!(matches!(fetch_error(err), WalletError::Credential(CredentialError::AccountLocked(_))));
    }

    #[tokio::test]
    async fn duplicate_insert_rejected() {
        let store = MemoryStore::new();
        store.insert(insert_request("g")).await.unwrap();
        assert!(store.insert(insert_request("g")).await.is_err());
    }

    #[tokio::test]
    async fn injected_failure_is_one_shot() {
        let store = MemoryStore::new();
        store.insert(insert_request("g")).await.unwrap();
        store.fail_next(StoreError::Timeout);
        assert_eq!(store.fetch("g", "sk").await.unwrap_err(), StoreError::Timeout);
        assert!(store.fetch("g", "sk").await.is_ok());
    }

    #[tokio::test]
    async fn overwrite_changes_checksum() {
        let store = MemoryStore::new();
        store.insert(insert_request("g")).await.unwrap();
        let before = store.checksum("g").unwrap();
        assert!(store.overwrite("g", "other".into()));
        assert_ne!(store.checksum("g").unwrap(), before);
        assert!(!store.overwrite("missing", "x".into()));
    }
}
