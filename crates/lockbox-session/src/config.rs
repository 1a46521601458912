//! Session configuration

use crate::{Error, Result};
use directories::ProjectDirs;
use lockbox_storage_sqlite::{EncryptionAlgorithm, KdfParams};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variable overriding [`SessionConfig::data_dir`]
pub const DATA_DIR_ENV: &str = "LOCKBOX_DATA_DIR";

/// Session configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Root directory holding `instances/<id>/`
    pub data_dir: PathBuf,
    /// Argon2id parameters for new credentials
    pub kdf: KdfParams,
    /// AEAD wrapping the data key of new credentials
    pub cipher: EncryptionAlgorithm,
    /// Minimum password length in characters
    pub min_password_length: usize,
    /// Attach a biometric gate when persisting a session
    pub require_biometric: bool,
    /// Text shown in the biometric prompt
    pub biometric_reason: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            kdf: KdfParams::STRONG,
            cipher: EncryptionAlgorithm::ChaCha20Poly1305,
            min_password_length: 8,
            require_biometric: true,
            biometric_reason: "Unlock Lockbox".to_string(),
        }
    }
}

impl SessionConfig {
    /// Default configuration rooted at `data_dir`
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    /// Replace the KDF parameters
    pub fn with_kdf(mut self, kdf: KdfParams) -> Self {
        self.kdf = kdf;
        self
    }

    /// Load a JSON config file, then apply environment overrides
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read(path).map_err(|e| {
            Error::Config(format!("Cannot read config {}: {}", path.display(), e))
        })?;
        let config: Self = serde_json::from_slice(&data)
            .map_err(|e| Error::Config(format!("Invalid config {}: {}", path.display(), e)))?;

        let config = config.with_env_override(std::env::var_os(DATA_DIR_ENV).map(PathBuf::from));
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus environment overrides
    pub fn from_env() -> Result<Self> {
        let config =
            Self::default().with_env_override(std::env::var_os(DATA_DIR_ENV).map(PathBuf::from));
        config.validate()?;
        Ok(config)
    }

    fn with_env_override(mut self, data_dir: Option<PathBuf>) -> Self {
        if let Some(dir) = data_dir.filter(|d| !d.as_os_str().is_empty()) {
            tracing::debug!("Using data dir from {}: {}", DATA_DIR_ENV, dir.display());
            self.data_dir = dir;
        }
        self
    }

    /// Reject configurations the lifecycle cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.data_dir.as_os_str().is_empty() {
            return Err(Error::Config("data_dir must not be empty".to_string()));
        }
        if self.min_password_length == 0 {
            return Err(Error::Config(
                "min_password_length must be at least 1".to_string(),
            ));
        }
        self.kdf
            .validate()
            .map_err(|e| Error::Config(e.to_string()))?;
        Ok(())
    }
}

fn default_data_dir() -> PathBuf {
    ProjectDirs::from("com", "Lockbox", "Lockbox")
        .map(|dirs| dirs.data_local_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."))
}
