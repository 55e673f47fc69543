//! Wallet configuration.
//!
//! Values are layered: built-in defaults, then an optional file (TOML,
//! JSON or YAML by extension), then `STRONGBOX_*` environment variables.
//! Nested keys use a double underscore, e.g. `STRONGBOX_DEVICE__OS_TYPE`.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

use strongbox_core::constants::{DEFAULT_PBKDF2_ITERATIONS, RECOVERY_ACCOUNT_GAP, SYNC_LOOKAHEAD};
use strongbox_core::types::Device;

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "STRONGBOX";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Settings of a payload manager instance.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct WalletConfig {
    /// Stretching iterations for new wallets.
    pub pbkdf2_iterations: u32,
    /// Receive addresses announced per account on a public-key sync.
    pub sync_lookahead: u32,
    /// Consecutive unused accounts checked during mnemonic recovery.
    pub recovery_gap: u32,
    /// Identity of this device. Writes are refused without it.
    pub device: Option<Device>,
    /// Log level filter string (e.g. "info", "strongbox_wallet=debug").
    pub log_level: String,
    /// "text" or "json".
    pub log_format: String,
}

impl Default for WalletConfig {
    fn default() -> Self {
        Self {
            pbkdf2_iterations: DEFAULT_PBKDF2_ITERATIONS,
            sync_lookahead: SYNC_LOOKAHEAD,
            recovery_gap: RECOVERY_ACCOUNT_GAP,
            device: None,
            log_level: "info".to_string(),
            log_format: "text".to_string(),
        }
    }
}

impl WalletConfig {
    /// Load from defaults, an optional file and the environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(::config::File::from(path).required(false));
        }
        let settings = builder
            .add_source(::config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?;
        let cfg: WalletConfig = settings.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pbkdf2_iterations == 0 {
            return Err(ConfigError::Invalid("pbkdf2_iterations must be positive".into()));
        }
        if !matches!(self.log_format.as_str(), "text" | "json") {
            return Err(ConfigError::Invalid(format!("unknown log format {:?}", self.log_format)));
        }
        Ok(())
    }

    /// Builder-style device override.
    pub fn with_device(mut self, os_type: impl Into<String>, app_version: impl Into<String>) -> Self {
        self.device = Some(Device {
            os_type: os_type.into(),
            app_version: app_version.into(),
        });
        self
    }
}
