//! Password credential: verifier material and the wrapped data key
//!
//! The password derives a key-encryption key (KEK) with Argon2id. The
//! credential stores `SHA-256(domain ‖ KEK)` as verifier and the random data
//! key encrypted under the KEK. Rotating the password re-encrypts the same
//! data key, so the datastore never needs a rekey.

use crate::instance::InstanceLayout;
use crate::vault::PersistedSessionVault;
use crate::{serde_hex, Error, Result};
use lockbox_storage_sqlite::{
    constant_time_eq, derive_master_key, files, generate_salt, hash_sha256, EncryptionAlgorithm,
    EncryptionKey, KdfParams, MasterKey,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;
use zeroize::Zeroizing;

const CREDENTIAL_VERSION: u32 = 1;
const VERIFIER_DOMAIN: &[u8] = b"lockbox/credential-verifier/v1";

/// Persisted verifier material for one instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    /// File format version
    pub version: u32,
    /// Fresh id per password; persisted sessions are bound to it
    pub credential_id: Uuid,
    /// Argon2id salt
    #[serde(with = "serde_hex")]
    pub salt: Vec<u8>,
    /// Argon2id parameters used for this credential
    pub kdf: KdfParams,
    /// AEAD wrapping the data key under the KEK
    pub cipher: EncryptionAlgorithm,
    /// `SHA-256(domain ‖ KEK)`
    #[serde(with = "serde_hex")]
    pub verifier: Vec<u8>,
    /// Data key encrypted under the KEK
    #[serde(with = "serde_hex")]
    pub wrapped_data_key: Vec<u8>,
    /// Unix timestamp of creation
    pub created_at: i64,
}

impl Credential {
    fn seal(
        password: &str,
        data_key: &MasterKey,
        kdf: KdfParams,
        cipher: EncryptionAlgorithm,
    ) -> Result<Self> {
        let salt = generate_salt().to_vec();
        let kek = derive_master_key(password, &salt, &kdf, cipher)?;

        Ok(Self {
            version: CREDENTIAL_VERSION,
            credential_id: Uuid::new_v4(),
            verifier: verifier_for(&kek).to_vec(),
            wrapped_data_key: kek.encrypt(data_key.as_bytes())?,
            salt,
            kdf,
            cipher,
            created_at: chrono::Utc::now().timestamp(),
        })
    }
}

fn verifier_for(kek: &MasterKey) -> [u8; 32] {
    let mut input = Zeroizing::new(Vec::with_capacity(VERIFIER_DOMAIN.len() + 32));
    input.extend_from_slice(VERIFIER_DOMAIN);
    input.extend_from_slice(kek.as_bytes());
    hash_sha256(&input)
}

/// The instance data key while unlocked
///
/// Zeroed on drop; cannot be cloned or printed.
pub struct UnlockedKey(MasterKey);

impl UnlockedKey {
    pub(crate) fn new(key: MasterKey) -> Self {
        Self(key)
    }

    /// Underlying key, for sealing into the keystore
    pub fn master_key(&self) -> &MasterKey {
        &self.0
    }

    /// SQLCipher key for the instance datastore
    pub fn datastore_key(&self) -> EncryptionKey {
        EncryptionKey::from_master_key(&self.0)
    }
}

impl std::fmt::Debug for UnlockedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("UnlockedKey(..)")
    }
}

/// Result of [`CredentialStore::setup`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupOutcome {
    /// A new credential was written
    Created,
    /// A credential already exists; nothing changed
    AlreadySetUp,
}

/// Result of [`CredentialStore::verify`]
#[derive(Debug)]
pub enum VerifyOutcome {
    /// Password matched
    Verified(UnlockedKey),
    /// Password did not match
    WrongPassword,
    /// No credential exists
    NotSetUp,
}

/// Derives and verifies password keys for one instance
#[derive(Debug, Clone)]
pub struct CredentialStore {
    path: PathBuf,
    kdf: KdfParams,
    cipher: EncryptionAlgorithm,
    min_password_length: usize,
}

impl CredentialStore {
    /// Credential store for an instance; `kdf` applies to new credentials only
    pub fn new(layout: &InstanceLayout, kdf: KdfParams, min_password_length: usize) -> Self {
        Self {
            path: layout.credential_path(),
            kdf,
            cipher: EncryptionAlgorithm::default(),
            min_password_length,
        }
    }

    /// Wrap data keys of new credentials with `cipher`
    pub fn with_cipher(mut self, cipher: EncryptionAlgorithm) -> Self {
        self.cipher = cipher;
        self
    }

    /// Whether a credential file exists
    pub fn is_set_up(&self) -> bool {
        self.path.is_file()
    }

    /// Read the current credential
    pub fn load(&self) -> Result<Option<Credential>> {
        let Some(data) = files::read_optional(&self.path)? else {
            return Ok(None);
        };

        let credential: Credential = serde_json::from_slice(&data)
            .map_err(|e| Error::Credential(format!("Malformed credential file: {}", e)))?;
        if credential.version != CREDENTIAL_VERSION {
            return Err(Error::Credential(format!(
                "Unsupported credential version {}",
                credential.version
            )));
        }
        Ok(Some(credential))
    }

    /// Create the credential for a new instance
    pub async fn setup(&self, password: &str) -> Result<SetupOutcome> {
        if self.is_set_up() {
            return Ok(SetupOutcome::AlreadySetUp);
        }
        self.check_password_policy(password)?;

        let data_key = MasterKey::generate(self.cipher);
        let credential = seal_blocking(password, data_key, self.kdf, self.cipher)
            .await?
            .0;
        self.store(&credential)?;

        tracing::info!("Credential created ({})", credential.credential_id);
        Ok(SetupOutcome::Created)
    }

    /// Check a password and recover the data key
    pub async fn verify(&self, password: &str) -> Result<VerifyOutcome> {
        let Some(credential) = self.load()? else {
            return Ok(VerifyOutcome::NotSetUp);
        };

        Ok(match open(&credential, password).await? {
            Some(key) => VerifyOutcome::Verified(key),
            None => VerifyOutcome::WrongPassword,
        })
    }

    /// Rotate the password, re-binding any persisted session to the new
    /// credential. Returns `false` without changes when `old` is wrong.
    ///
    /// Either the credential and record both move to the new password or
    /// neither does.
    pub async fn change_password(
        &self,
        old: &str,
        new: &str,
        vault: &PersistedSessionVault,
    ) -> Result<bool> {
        let Some(current) = self.load()? else {
            return Ok(false);
        };
        let Some(data_key) = open(&current, old).await? else {
            tracing::debug!("Password change rejected: wrong current password");
            return Ok(false);
        };
        self.check_password_policy(new)?;

        let (next, data_key) = seal_blocking(new, data_key.0, self.kdf, self.cipher).await?;
        let data_key = UnlockedKey::new(data_key);

        let snapshot = vault.snapshot()?;
        let rebound = match vault.rebind(&data_key, &current, next.credential_id).await {
            Ok(rebound) => rebound,
            Err(e) => {
                tracing::warn!("Rolling back password change: {}", e);
                vault.restore(snapshot)?;
                return Err(e);
            }
        };

        if let Err(e) = self.store(&next) {
            tracing::warn!("Rolling back password change: {}", e);
            vault.restore(snapshot)?;
            if rebound {
                vault.forget(next.credential_id).await;
            }
            return Err(e);
        }

        if rebound {
            vault.forget(current.credential_id).await;
        }
        tracing::info!(
            "Password changed ({} -> {})",
            current.credential_id,
            next.credential_id
        );
        Ok(true)
    }

    /// Delete the credential; succeeds when none exists
    pub fn reset(&self) -> Result<()> {
        if files::remove_if_exists(&self.path)? {
            tracing::info!("Credential removed");
        }
        Ok(())
    }

    fn check_password_policy(&self, password: &str) -> Result<()> {
        if password.chars().count() < self.min_password_length {
            return Err(Error::Validation(format!(
                "Password must be at least {} characters",
                self.min_password_length
            )));
        }
        Ok(())
    }

    fn store(&self, credential: &Credential) -> Result<()> {
        let data = serde_json::to_vec_pretty(credential)?;
        files::write_atomic(&self.path, &data)?;
        Ok(())
    }
}

/// Derive the KEK for `credential` and unwrap the data key if `password`
/// matches.
async fn open(credential: &Credential, password: &str) -> Result<Option<UnlockedKey>> {
    let password = Zeroizing::new(password.to_owned());
    let credential = credential.clone();

    let key = tokio::task::spawn_blocking(move || -> Result<Option<MasterKey>> {
        let kek = derive_master_key(
            &password,
            &credential.salt,
            &credential.kdf,
            credential.cipher,
        )?;
        if !constant_time_eq(&verifier_for(&kek), &credential.verifier) {
            return Ok(None);
        }

        // Verifier matched, so a failure here means the file was tampered with
        let bytes = kek.decrypt(&credential.wrapped_data_key).map_err(|_| {
            Error::Credential("Data key cannot be unwrapped with a matching verifier".to_string())
        })?;
        Ok(Some(MasterKey::from_bytes(&bytes, credential.cipher)?))
    })
    .await
    .map_err(|e| Error::Task(e.to_string()))??;

    Ok(key.map(UnlockedKey::new))
}

async fn seal_blocking(
    password: &str,
    data_key: MasterKey,
    kdf: KdfParams,
    cipher: EncryptionAlgorithm,
) -> Result<(Credential, MasterKey)> {
    let password = Zeroizing::new(password.to_owned());

    tokio::task::spawn_blocking(move || -> Result<(Credential, MasterKey)> {
        let credential = Credential::seal(&password, &data_key, kdf, cipher)?;
        Ok((credential, data_key))
    })
    .await
    .map_err(|e| Error::Task(e.to_string()))?
}
