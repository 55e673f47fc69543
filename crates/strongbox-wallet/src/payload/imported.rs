//! Imported (non-HD) addresses.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use strongbox_core::types::Device;

use super::secret::Secret;
use crate::error::WalletError;

/// An address whose key was imported rather than derived from the seed.
/// A watch-only address carries no key until one is attached.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ImportedAddress {
    address: String,
    #[serde(default, rename = "priv", skip_serializing_if = "Option::is_none")]
    private_key: Option<Secret>,
    #[serde(default)]
    label: String,
    #[serde(default)]
    archived: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    created_time: Option<DateTime<Utc>>,
    #[serde(default)]
    created_device_name: String,
    #[serde(default)]
    created_device_version: String,
}

impl ImportedAddress {
    /// Watch-only address without a key.
    pub fn watch_only(address: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            private_key: None,
            label: label.into(),
            archived: false,
            created_time: None,
            created_device_name: String::new(),
            created_device_version: String::new(),
        }
    }

    /// Address controlled by an imported key, stamped with the creating device.
    pub fn with_key(address: impl Into<String>, private_key: Secret, device: &Device) -> Self {
        Self {
            private_key: Some(private_key),
            created_time: Some(Utc::now()),
            created_device_name: device.os_type.clone(),
            created_device_version: device.app_version.clone(),
            ..Self::watch_only(address, "")
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// The label, or the address itself when no label was set.
    pub fn display_label(&self) -> &str {
        if self.label.is_empty() { &self.address } else { &self.label }
    }

    pub fn is_archived(&self) -> bool {
        self.archived
    }

    pub fn is_watch_only(&self) -> bool {
        self.private_key.is_none()
    }

    pub fn private_key(&self) -> Option<&Secret> {
        self.private_key.as_ref()
    }

    pub fn created_device(&self) -> &str {
        &self.created_device_name
    }

    pub fn created_app_version(&self) -> &str {
        &self.created_device_version
    }

    pub fn created_time(&self) -> Option<DateTime<Utc>> {
        self.created_time
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

    /// Attach a key to a watch-only entry, keeping its label and archive flag.
    pub fn with_private_key(&self, private_key: Secret, device: &Device) -> Self {
        Self {
            private_key: Some(private_key),
            created_time: self.created_time.or_else(|| Some(Utc::now())),
            created_device_name: device.os_type.clone(),
            created_device_version: device.app_version.clone(),
            ..self.clone()
        }
    }

    pub(crate) fn map_secret(&self, f: &dyn Fn(&Secret) -> Result<Secret, WalletError>) -> Result<Self, WalletError> {
        let private_key = self.private_key.as_ref().map(f).transpose()?;
        Ok(Self {
            private_key,
            ..self.clone()
        })
    }
}
