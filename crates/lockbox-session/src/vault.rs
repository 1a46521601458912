//! Persisted session vault ("remember me")
//!
//! Seals the unlocked data key through the injected [`PlatformKeystore`] and
//! stores the sealed blob in `session.sealed`. A record is bound to the
//! instance and to the credential id it was created under; records that no
//! longer match are stale and get removed on the next unwrap.

use crate::credential::{Credential, UnlockedKey};
use crate::instance::{InstanceId, InstanceLayout};
use crate::{serde_hex, Error, Result};
use lockbox_storage_sqlite::{
    files, BiometricManager, KeystoreResult, PlatformKeystore, SealPolicy, SealedKey,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

const RECORD_VERSION: u32 = 1;

/// On-disk persisted session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedSessionRecord {
    /// File format version
    pub version: u32,
    /// Owning instance
    pub instance_id: InstanceId,
    /// Credential the record was created under
    pub credential_id: Uuid,
    /// Unwrapping prompts for biometrics
    pub requires_biometric_gate: bool,
    /// Keystore-sealed data key
    #[serde(with = "serde_hex")]
    pub sealed_key: Vec<u8>,
    /// Unix timestamp of creation
    pub created_at: i64,
}

/// Result of [`PersistedSessionVault::unwrap`]
#[derive(Debug)]
pub enum UnwrapOutcome {
    /// Key recovered
    Unwrapped(UnlockedKey),
    /// No usable record
    NotFound,
    /// Biometric prompt cancelled, failed, or locked out
    GateDenied,
}

/// Keystore-backed persisted session for one instance
pub struct PersistedSessionVault {
    instance_id: InstanceId,
    path: PathBuf,
    keystore: Arc<dyn PlatformKeystore>,
    biometric_reason: String,
    biometrics: Mutex<BiometricManager>,
}

impl PersistedSessionVault {
    /// Create a vault for `instance_id`
    pub fn new(
        instance_id: InstanceId,
        layout: &InstanceLayout,
        keystore: Arc<dyn PlatformKeystore>,
        biometric_reason: impl Into<String>,
    ) -> Self {
        Self {
            instance_id,
            path: layout.session_path(),
            keystore,
            biometric_reason: biometric_reason.into(),
            biometrics: Mutex::new(BiometricManager::new()),
        }
    }

    /// Whether a record file exists
    pub fn has_record(&self) -> bool {
        self.path.is_file()
    }

    /// Read the record without validating its binding
    pub fn load(&self) -> Result<Option<PersistedSessionRecord>> {
        let Some(data) = files::read_optional(&self.path)? else {
            return Ok(None);
        };

        let record: PersistedSessionRecord = serde_json::from_slice(&data)
            .map_err(|e| Error::Vault(format!("Malformed session record: {}", e)))?;
        if record.version != RECORD_VERSION {
            return Err(Error::Vault(format!(
                "Unsupported session record version {}",
                record.version
            )));
        }
        Ok(Some(record))
    }

    /// Seal `key` for `credential_id`, replacing any existing record.
    ///
    /// Returns `false` when the keystore cannot seal right now.
    pub async fn wrap(
        &self,
        key: &UnlockedKey,
        credential_id: Uuid,
        require_biometric: bool,
    ) -> Result<bool> {
        let previous = self.load().ok().flatten();

        if !self.seal_record(key, credential_id, require_biometric).await? {
            return Ok(false);
        }

        if let Some(previous) = previous.filter(|r| r.credential_id != credential_id) {
            self.forget(previous.credential_id).await;
        }
        info!("Persisted session stored for {}", self.instance_id);
        Ok(true)
    }

    /// Recover the key sealed for `credential_id`
    pub async fn unwrap(&self, credential_id: Uuid) -> Result<UnwrapOutcome> {
        let Some(record) = self.load()? else {
            return Ok(UnwrapOutcome::NotFound);
        };

        if record.instance_id != self.instance_id || record.credential_id != credential_id {
            warn!("Removing stale persisted session for {}", self.instance_id);
            self.clear().await?;
            return Ok(UnwrapOutcome::NotFound);
        }

        let sealed = SealedKey::deserialize(&record.sealed_key)
            .map_err(|e| Error::Vault(format!("Malformed sealed key: {}", e)))?;

        let gated = record.requires_biometric_gate;
        let result = if gated {
            let locked_out = self.biometrics.lock().is_locked_out();
            if locked_out {
                debug!("Biometric gate locked out for {}", self.instance_id);
                return Ok(UnwrapOutcome::GateDenied);
            }
            self.keystore
                .unseal_key_biometric(&sealed, &self.biometric_reason)
                .await
        } else {
            self.keystore.unseal_key(&sealed).await
        };

        match result {
            KeystoreResult::Success(key) => {
                if gated {
                    self.biometrics.lock().record_success();
                }
                Ok(UnwrapOutcome::Unwrapped(UnlockedKey::new(key)))
            }
            KeystoreResult::Cancelled => {
                debug!("Biometric prompt cancelled for {}", self.instance_id);
                Ok(UnwrapOutcome::GateDenied)
            }
            KeystoreResult::AuthFailed => {
                if gated {
                    self.biometrics.lock().record_failure();
                }
                debug!("Biometric authentication failed for {}", self.instance_id);
                Ok(UnwrapOutcome::GateDenied)
            }
            KeystoreResult::NotAvailable => {
                warn!(
                    "Sealed key for {} is no longer available; removing record",
                    self.instance_id
                );
                self.clear().await?;
                Ok(UnwrapOutcome::NotFound)
            }
            KeystoreResult::Error(e) => Err(e.into()),
        }
    }

    /// Delete the record and its keystore entry; no-op if none
    pub async fn clear(&self) -> Result<()> {
        // A corrupted record is still removed
        let record = self.load().ok().flatten();

        if files::remove_if_exists(&self.path)? {
            info!("Persisted session cleared for {}", self.instance_id);
        }
        if let Some(record) = record {
            self.keystore
                .delete_key(&key_id(&record.instance_id, record.credential_id))
                .await?;
        }
        Ok(())
    }

    /// Whether repeated biometric failures currently block prompting
    pub fn is_locked_out(&self) -> bool {
        self.biometrics.lock().is_locked_out()
    }

    /// Clear the biometric failure count after a password unlock
    pub fn reset_lockout(&self) {
        self.biometrics.lock().reset_lockout();
    }

    pub(crate) fn snapshot(&self) -> Result<Option<Vec<u8>>> {
        Ok(files::read_optional(&self.path)?)
    }

    pub(crate) fn restore(&self, snapshot: Option<Vec<u8>>) -> Result<()> {
        match snapshot {
            Some(data) => {
                if files::read_optional(&self.path)?.as_deref() != Some(&data[..]) {
                    files::write_atomic(&self.path, &data)?;
                }
            }
            None => {
                files::remove_if_exists(&self.path)?;
            }
        }
        Ok(())
    }

    /// Re-seal the record of `current` under `next_id`. The old keystore
    /// entry is kept so the caller can roll back.
    pub(crate) async fn rebind(
        &self,
        key: &UnlockedKey,
        current: &Credential,
        next_id: Uuid,
    ) -> Result<bool> {
        let Some(record) = self.load()? else {
            return Ok(false);
        };
        if record.credential_id != current.credential_id {
            return Ok(false);
        }

        if !self
            .seal_record(key, next_id, record.requires_biometric_gate)
            .await?
        {
            return Err(Error::Vault(
                "Keystore unavailable; persisted session cannot be re-bound".to_string(),
            ));
        }
        Ok(true)
    }

    /// Drop the keystore entry for `credential_id`, logging failures
    pub(crate) async fn forget(&self, credential_id: Uuid) {
        let id = key_id(&self.instance_id, credential_id);
        if let Err(e) = self.keystore.delete_key(&id).await {
            warn!("Failed to delete keystore entry {}: {}", id, e);
        }
    }

    async fn seal_record(
        &self,
        key: &UnlockedKey,
        credential_id: Uuid,
        require_biometric: bool,
    ) -> Result<bool> {
        let requires_biometric_gate = require_biometric && self.keystore.has_biometrics();
        let policy = SealPolicy {
            require_biometric: requires_biometric_gate,
        };

        let sealed = match self
            .keystore
            .seal_key(
                key.master_key(),
                &key_id(&self.instance_id, credential_id),
                policy,
            )
            .await
        {
            KeystoreResult::Success(sealed) => sealed,
            KeystoreResult::Error(e) => return Err(e.into()),
            KeystoreResult::NotAvailable
            | KeystoreResult::Cancelled
            | KeystoreResult::AuthFailed => {
                warn!("Keystore cannot seal a session for {}", self.instance_id);
                return Ok(false);
            }
        };

        let record = PersistedSessionRecord {
            version: RECORD_VERSION,
            instance_id: self.instance_id.clone(),
            credential_id,
            requires_biometric_gate,
            sealed_key: sealed.serialize(),
            created_at: chrono::Utc::now().timestamp(),
        };
        let data = serde_json::to_vec_pretty(&record)?;
        if let Err(e) = files::write_atomic(&self.path, &data) {
            // The entry is only still needed if the record on disk uses it
            let in_use = self
                .load()
                .ok()
                .flatten()
                .is_some_and(|r| r.credential_id == credential_id);
            if !in_use {
                self.forget(credential_id).await;
            }
            return Err(e.into());
        }
        Ok(true)
    }
}

fn key_id(instance_id: &InstanceId, credential_id: Uuid) -> String {
    format!("lockbox.session.{}.{}", instance_id, credential_id)
}
