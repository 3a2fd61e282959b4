//! YAML configuration for a key-system attachment.
//!
//! ```yaml
//! key_system: org.w3.clearkey
//! storage_directory: /var/lib/rscdm
//! configuration:
//!   label: default
//!   initDataTypes: [cenc, keyids]
//!   videoCapabilities:
//!     - contentType: 'video/mp4; codecs="avc1.42E01E"'
//!   sessionTypes: [temporary]
//! restrictions:
//!   persistentStateDenied: false
//! allow_distinctive_identifier: false
//! allow_persistent_state: true
//! music_player: false
//! completion_timeout_ms: 5000
//! ```
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::cdm::Cdm;
use crate::error::{Error, Result};
use crate::types::{
    AllowDistinctiveIdentifiers, AllowPersistentState, KeySystemConfiguration, Restrictions,
};

fn default_allow_persistent_state() -> bool {
    true
}

fn default_completion_timeout_ms() -> u64 {
    5000
}

/// Key-system attachment settings loaded from YAML.
#[derive(Debug, Clone, Deserialize)]
pub struct CdmConfig {
    /// Key system to attach to.
    pub key_system: String,
    /// Directory for persistent session data.
    #[serde(default)]
    pub storage_directory: Option<PathBuf>,
    /// Configuration to initialize the session manager with.
    #[serde(default)]
    pub configuration: KeySystemConfiguration,
    #[serde(default)]
    pub restrictions: Restrictions,
    #[serde(default)]
    pub allow_distinctive_identifier: bool,
    #[serde(default = "default_allow_persistent_state")]
    pub allow_persistent_state: bool,
    /// Initialize the engine in music player mode.
    #[serde(default)]
    pub music_player: bool,
    /// File holding a server certificate to install after initialization.
    #[serde(default)]
    pub server_certificate: Option<PathBuf>,
    /// How long to wait for each engine completion.
    #[serde(default = "default_completion_timeout_ms")]
    pub completion_timeout_ms: u64,
}

impl CdmConfig {
    /// Load and validate a configuration file.
    pub fn from_path(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        let mut config = Self::from_yaml_str(&data)?;
        // Relative paths are relative to the configuration file.
        if let Some(base) = path.parent() {
            config.storage_directory = config.storage_directory.map(|dir| base.join(dir));
            config.server_certificate = config.server_certificate.map(|file| base.join(file));
        }
        Ok(config)
    }

    /// Parse and validate YAML text.
    pub fn from_yaml_str(data: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(data)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.key_system.trim().is_empty() {
            return Err(Error::Config("key_system must not be empty".to_string()));
        }
        if !Cdm::is_supported_key_system(&self.key_system) {
            return Err(Error::UnsupportedKeySystem(self.key_system.clone()));
        }
        if self.completion_timeout_ms == 0 {
            return Err(Error::Config(
                "completion_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.restrictions.persistent_state_denied && self.allow_persistent_state {
            warn!("persistent state is denied by restrictions but allowed at initialization");
        }
        Ok(())
    }

    pub fn completion_timeout(&self) -> Duration {
        Duration::from_millis(self.completion_timeout_ms)
    }

    pub fn distinctive_identifiers(&self) -> AllowDistinctiveIdentifiers {
        self.allow_distinctive_identifier.into()
    }

    pub fn persistent_state(&self) -> AllowPersistentState {
        self.allow_persistent_state.into()
    }

    /// Contents of the configured server certificate, if any.
    pub fn read_server_certificate(&self) -> Result<Option<Vec<u8>>> {
        self.server_certificate
            .as_deref()
            .map(std::fs::read)
            .transpose()
            .map_err(Error::from)
    }
}
