//! Per-instance session state machine
//!
//! `not set up → locked → unlocked`. Every lifecycle call takes the
//! manager's async mutex, so calls on one instance run one at a time in
//! arrival order while calls on different instances are independent.
//!
//! Each manager carries an activation epoch. An unlock captures the epoch
//! when it is called and only commits the key if the instance was not
//! deactivated in the meantime.
//!
//! `is_loading` is raised as soon as a call is queued and stays up until the
//! last queued call has published its result.

use crate::config::SessionConfig;
use crate::credential::{CredentialStore, SetupOutcome, UnlockedKey, VerifyOutcome};
use crate::instance::{InstanceId, InstanceLayout};
use crate::vault::{PersistedSessionVault, UnwrapOutcome};
use crate::{Error, Result};
use lockbox_storage_sqlite::{
    files, BiometricType, Database, PlatformKeystore, QueryResult, SqlValue,
};
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// Observable session state of one instance
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionState {
    /// A lifecycle operation is running
    pub is_loading: bool,
    /// A credential exists
    pub is_set_up: bool,
    /// The data key is held in memory
    pub is_unlocked: bool,
    /// A persisted session record exists
    pub has_persisted_session: bool,
    /// Instance this state belongs to
    pub current_instance_id: Option<InstanceId>,
}

/// Biometric support as seen by the session layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BiometricCapability {
    /// Platform reports a usable biometric sensor
    pub available: bool,
    /// Sensor kind
    pub kind: BiometricType,
    /// Prompts are blocked after repeated failures
    pub locked_out: bool,
}

#[derive(Default)]
struct Unlocked {
    key: Option<UnlockedKey>,
    datastore: Option<Database>,
}

impl Unlocked {
    fn drop_key(&mut self) {
        // Close the datastore before zeroing the key it was opened with
        self.datastore = None;
        self.key = None;
    }
}

/// Lifecycle manager for one instance
pub struct SessionManager {
    instance_id: InstanceId,
    layout: InstanceLayout,
    require_biometric: bool,
    credentials: CredentialStore,
    vault: PersistedSessionVault,
    keystore: Arc<dyn PlatformKeystore>,
    inner: Mutex<Unlocked>,
    epoch: AtomicU64,
    pending: AtomicUsize,
    state: watch::Sender<SessionState>,
}

impl SessionManager {
    /// Create a locked manager for `instance_id`
    pub fn new(
        instance_id: InstanceId,
        config: &SessionConfig,
        keystore: Arc<dyn PlatformKeystore>,
    ) -> Self {
        let layout = InstanceLayout::new(&config.data_dir, &instance_id);
        let credentials = CredentialStore::new(&layout, config.kdf, config.min_password_length)
            .with_cipher(config.cipher);
        let vault = PersistedSessionVault::new(
            instance_id.clone(),
            &layout,
            keystore.clone(),
            config.biometric_reason.clone(),
        );

        let (state, _) = watch::channel(SessionState {
            is_loading: false,
            is_set_up: credentials.is_set_up(),
            is_unlocked: false,
            has_persisted_session: vault.has_record(),
            current_instance_id: Some(instance_id.clone()),
        });

        Self {
            instance_id,
            layout,
            require_biometric: config.require_biometric,
            credentials,
            vault,
            keystore,
            inner: Mutex::new(Unlocked::default()),
            epoch: AtomicU64::new(0),
            pending: AtomicUsize::new(0),
            state,
        }
    }

    /// Instance this manager owns
    pub fn instance_id(&self) -> &InstanceId {
        &self.instance_id
    }

    /// Paths of this instance
    pub fn layout(&self) -> &InstanceLayout {
        &self.layout
    }

    /// Snapshot of the current state
    pub fn state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    /// Follow state changes
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Whether the data key is held
    pub fn is_unlocked(&self) -> bool {
        self.state.borrow().is_unlocked
    }

    /// Biometric availability for "remember me" prompts
    pub fn biometric_capability(&self) -> BiometricCapability {
        BiometricCapability {
            available: self.keystore.has_biometrics(),
            kind: self.keystore.biometric_type(),
            locked_out: self.vault.is_locked_out(),
        }
    }

    /// Create the credential. Leaves the instance locked.
    pub async fn setup(&self, password: &str) -> Result<SetupOutcome> {
        let _op = self.begin().await;
        let result = self.credentials.setup(password).await;
        if let Ok(SetupOutcome::Created) = result {
            info!("Instance {} set up", self.instance_id);
        }
        result
    }

    /// Unlock with `password`, then persist the session if `persist`.
    ///
    /// Returns `false` for a wrong password, an instance that is not set up,
    /// or an unlock overtaken by deactivation.
    pub async fn unlock(&self, password: &str, persist: bool) -> Result<bool> {
        let epoch = self.epoch.load(Ordering::Acquire);
        let mut op = self.begin().await;
        self.unlock_locked(&mut op, password, persist, epoch).await
    }

    /// Unlock from the persisted session, prompting for biometrics if the
    /// record requires it.
    pub async fn restore_session(&self) -> Result<bool> {
        let epoch = self.epoch.load(Ordering::Acquire);
        let mut op = self.begin().await;
        self.restore_locked(&mut op, epoch).await
    }

    /// Persist the current unlock. `false` when locked or the keystore
    /// cannot seal.
    pub async fn persist_session(&self) -> Result<bool> {
        let mut op = self.begin().await;
        let inner = &mut *op;
        match inner.key.as_ref() {
            Some(key) => self.persist_key(key).await,
            None => {
                debug!("Not persisting session of {}: locked", self.instance_id);
                Ok(false)
            }
        }
    }

    /// Delete the persisted session, if any
    pub async fn clear_persisted_session(&self) -> Result<()> {
        let _op = self.begin().await;
        self.vault.clear().await
    }

    /// Drop the key and close the datastore; optionally forget the
    /// persisted session too
    pub async fn lock(&self, clear_session: bool) -> Result<()> {
        let mut op = self.begin().await;
        if op.key.is_some() {
            info!("Instance {} locked", self.instance_id);
        }
        op.drop_key();

        if clear_session {
            self.vault.clear().await
        } else {
            Ok(())
        }
    }

    /// Rotate the password. Requires the instance to be unlocked.
    pub async fn change_password(&self, old: &str, new: &str) -> Result<bool> {
        let op = self.begin().await;
        if op.key.is_none() {
            return Err(Error::InvalidState(format!(
                "Instance {} must be unlocked to change its password",
                self.instance_id
            )));
        }
        self.credentials
            .change_password(old, new, &self.vault)
            .await
    }

    /// Forget everything: key, persisted session, credential and datastore
    pub async fn reset(&self) -> Result<()> {
        let mut op = self.begin().await;
        op.drop_key();
        self.reset_files().await
    }

    /// Re-read set-up and persisted-session flags from disk
    pub async fn refresh(&self) -> SessionState {
        drop(self.begin().await);
        self.state()
    }

    /// Run a statement on the instance datastore, opening it on first use
    pub async fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<QueryResult> {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;

        let Some(key) = inner.key.as_ref() else {
            return Err(Error::InvalidState(format!(
                "Instance {} is locked",
                self.instance_id
            )));
        };

        let db = match inner.datastore.take() {
            Some(db) => db,
            None => {
                debug!("Opening datastore for {}", self.instance_id);
                Database::open(self.layout.datastore_path(), &key.datastore_key())?
            }
        };
        let result = db.execute(sql, params);
        inner.datastore = Some(db);
        Ok(result?)
    }

    /// Invalidate in-flight unlocks and lock without touching the persisted
    /// session. Used when another instance becomes active.
    pub async fn deactivate(&self) {
        self.epoch.fetch_add(1, Ordering::AcqRel);
        let mut op = self.begin().await;
        if op.key.is_some() {
            info!("Instance {} deactivated", self.instance_id);
        }
        op.drop_key();
    }

    async fn unlock_locked(
        &self,
        inner: &mut Unlocked,
        password: &str,
        persist: bool,
        epoch: u64,
    ) -> Result<bool> {
        let key = match self.credentials.verify(password).await? {
            VerifyOutcome::Verified(key) => key,
            VerifyOutcome::WrongPassword => {
                debug!("Unlock of {} rejected: wrong password", self.instance_id);
                return Ok(false);
            }
            VerifyOutcome::NotSetUp => {
                debug!("Unlock of {} rejected: not set up", self.instance_id);
                return Ok(false);
            }
        };

        if self.is_stale(epoch) {
            debug!("Discarding unlock of {}: deactivated", self.instance_id);
            return Ok(false);
        }

        self.vault.reset_lockout();
        if inner.key.is_none() {
            inner.key = Some(key);
            info!("Instance {} unlocked", self.instance_id);
        }

        if persist {
            if let Some(key) = inner.key.as_ref() {
                match self.persist_key(key).await {
                    Ok(true) => {}
                    Ok(false) => {
                        warn!("Unlocked {} without persisting the session", self.instance_id)
                    }
                    Err(e) => warn!("Failed to persist session of {}: {}", self.instance_id, e),
                }
            }
        }
        Ok(true)
    }

    async fn restore_locked(&self, inner: &mut Unlocked, epoch: u64) -> Result<bool> {
        if inner.key.is_some() {
            return Ok(true);
        }

        let Some(credential) = self.credentials.load()? else {
            if self.vault.has_record() {
                warn!("Persisted session of {} has no credential", self.instance_id);
                self.vault.clear().await?;
            }
            return Ok(false);
        };

        match self.vault.unwrap(credential.credential_id).await? {
            UnwrapOutcome::Unwrapped(key) => {
                if self.is_stale(epoch) {
                    debug!("Discarding restore of {}: deactivated", self.instance_id);
                    return Ok(false);
                }
                inner.key = Some(key);
                info!("Instance {} unlocked from persisted session", self.instance_id);
                Ok(true)
            }
            UnwrapOutcome::NotFound => Ok(false),
            UnwrapOutcome::GateDenied => {
                debug!("Restore of {} denied at biometric gate", self.instance_id);
                Ok(false)
            }
        }
    }

    async fn persist_key(&self, key: &UnlockedKey) -> Result<bool> {
        let Some(credential) = self.credentials.load()? else {
            return Ok(false);
        };
        self.vault
            .wrap(key, credential.credential_id, self.require_biometric)
            .await
    }

    async fn reset_files(&self) -> Result<()> {
        self.vault.clear().await?;
        self.credentials.reset()?;
        for path in self.layout.datastore_files() {
            files::remove_if_exists(&path)?;
        }
        info!("Instance {} reset", self.instance_id);
        Ok(())
    }

    fn is_stale(&self, epoch: u64) -> bool {
        self.epoch.load(Ordering::Acquire) != epoch
    }

    /// Queue behind running operations and take the state lock. The
    /// returned guard publishes the resulting state when dropped.
    async fn begin(&self) -> Operation<'_> {
        self.state.send_if_modified(|s| {
            self.pending.fetch_add(1, Ordering::AcqRel);
            !std::mem::replace(&mut s.is_loading, true)
        });

        let mut queued = Queued {
            manager: self,
            armed: true,
        };
        let guard = self.inner.lock().await;
        queued.armed = false;

        Operation {
            manager: self,
            guard,
        }
    }

    /// Leave the queue. Runs under the state channel's lock so a call
    /// queued concurrently is never reported as idle.
    fn leave(&self, state: &mut SessionState) {
        state.is_loading = self.pending.fetch_sub(1, Ordering::AcqRel) > 1;
    }

    fn publish(&self, inner: &mut Unlocked) {
        let is_set_up = self.credentials.is_set_up();
        if inner.key.is_some() && !is_set_up {
            warn!("Credential of {} disappeared; locking", self.instance_id);
            inner.drop_key();
        }
        let is_unlocked = inner.key.is_some();
        let has_persisted_session = self.vault.has_record();

        self.state.send_modify(|state| {
            self.leave(state);
            state.is_set_up = is_set_up;
            state.is_unlocked = is_unlocked;
            state.has_persisted_session = has_persisted_session;
            state.current_instance_id = Some(self.instance_id.clone());
        });
    }
}

/// A call waiting for the state lock
struct Queued<'a> {
    manager: &'a SessionManager,
    armed: bool,
}

impl Drop for Queued<'_> {
    fn drop(&mut self) {
        // Cancelled before the lock was acquired
        if self.armed {
            self.manager.state.send_if_modified(|state| {
                let was_loading = state.is_loading;
                self.manager.leave(state);
                was_loading != state.is_loading
            });
        }
    }
}

/// A running operation holding the state lock
struct Operation<'a> {
    manager: &'a SessionManager,
    guard: MutexGuard<'a, Unlocked>,
}

impl Deref for Operation<'_> {
    type Target = Unlocked;

    fn deref(&self) -> &Unlocked {
        &self.guard
    }
}

impl DerefMut for Operation<'_> {
    fn deref_mut(&mut self) -> &mut Unlocked {
        &mut self.guard
    }
}

impl Drop for Operation<'_> {
    fn drop(&mut self) {
        self.manager.publish(&mut self.guard);
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("instance_id", &self.instance_id)
            .field("state", &*self.state.borrow())
            .finish()
    }
}
