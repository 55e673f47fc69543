//! Outer wrapper: the encrypted, serialized form of a payload as stored
//! remotely, and the checksum that fingerprints it.
//!
//! ```text
//! { "version": 4, "pbkdf2_iterations": 5000, "payload": "<hex ciphertext>" }
//! ```
//! V1 wrappers carry no iteration count; readers assume the V1 default.

use serde::{Deserialize, Serialize};

use strongbox_core::constants::V1_PBKDF2_ITERATIONS;
use strongbox_core::error::{CipherError, CredentialError, ValidationError};
use strongbox_core::traits::CipherService;
use strongbox_core::types::{Checksum, WrapperVersion};

use crate::error::WalletError;
use crate::payload::WalletPayload;

#[derive(Serialize, Deserialize, Debug)]
struct WireWrapper {
    version: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pbkdf2_iterations: Option<u32>,
    payload: String,
}

/// A wrapped payload ready for the remote store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Wrapped {
    pub json: String,
    pub checksum: Checksum,
}

fn wrapper_iterations(version: WrapperVersion, payload_iterations: u32) -> Option<u32> {
    match version {
        WrapperVersion::V1 => None,
        _ => Some(payload_iterations),
    }
}

/// Serialize and encrypt `payload` under the main password.
pub fn wrap(payload: &WalletPayload, password: &str, cipher: &dyn CipherService) -> Result<Wrapped, WalletError> {
    let version = payload.wrapper_version();
    let declared = wrapper_iterations(version, payload.pbkdf2_iterations());
    let iterations = declared.unwrap_or(V1_PBKDF2_ITERATIONS);

    let plain = zeroize::Zeroizing::new(
        serde_json::to_vec(payload).map_err(|e| WalletError::corrupted(format!("serialize: {e}")))?,
    );
    let encrypted = cipher.encrypt(&plain, password, iterations)?;
    let wire = WireWrapper {
        version: version.into(),
        pbkdf2_iterations: declared,
        payload: hex::encode(encrypted),
    };
    let json = serde_json::to_string(&wire).map_err(|e| WalletError::corrupted(format!("serialize: {e}")))?;
    let checksum = Checksum::of(json.as_bytes());
    Ok(Wrapped { json, checksum })
}

/// Decrypt and parse a stored wrapper. The returned checksum fingerprints
/// `json` exactly as received.
pub fn unwrap(json: &str, password: &str, cipher: &dyn CipherService) -> Result<(WalletPayload, Checksum), WalletError> {
    let wire: WireWrapper =
        serde_json::from_str(json).map_err(|e| WalletError::corrupted(format!("wrapper: {e}")))?;
    let version = WrapperVersion::try_from(wire.version)?;
    let iterations = wire.pbkdf2_iterations.unwrap_or(V1_PBKDF2_ITERATIONS);
    let encrypted = hex::decode(&wire.payload).map_err(|e| WalletError::corrupted(format!("payload hex: {e}")))?;

    let plain = zeroize::Zeroizing::new(cipher.decrypt(&encrypted, password, iterations).map_err(|e| match e {
        CipherError::Decryption => WalletError::from(CredentialError::InvalidPassword),
        other => other.into(),
    })?);
    let payload: WalletPayload =
        serde_json::from_slice(&plain).map_err(|e| WalletError::corrupted(format!("payload: {e}")))?;

    if payload.wrapper_version() != version {
        return Err(ValidationError::CorruptedPayload(format!(
            "wrapper declares {version}, payload is {}",
            payload.wrapper_version()
        ))
        .into());
    }
    payload.validate()?;
    Ok((payload, Checksum::of(json.as_bytes())))
}
