//! Registry of per-instance session managers
//!
//! Owns one [`SessionManager`] per instance, tracks which instance is
//! active and announces switches through its [`InstanceChangeNotifier`].
//! There is no global registry; callers pass it where it is needed.

use crate::config::SessionConfig;
use crate::instance::{self, InstanceId};
use crate::manager::{SessionManager, SessionState};
use crate::notifier::{InstanceChange, InstanceChangeNotifier, QueryCache, Subscription};
use crate::Result;
use lockbox_storage_sqlite::PlatformKeystore;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tracing::info;

/// Session managers keyed by instance id
pub struct SessionRegistry {
    config: SessionConfig,
    keystore: Arc<dyn PlatformKeystore>,
    managers: RwLock<HashMap<InstanceId, Arc<SessionManager>>>,
    notifier: InstanceChangeNotifier,
    switching: Mutex<()>,
}

impl SessionRegistry {
    /// Create an empty registry with no active instance
    pub fn new(config: SessionConfig, keystore: Arc<dyn PlatformKeystore>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            keystore,
            managers: RwLock::new(HashMap::new()),
            notifier: InstanceChangeNotifier::new(),
            switching: Mutex::new(()),
        })
    }

    /// Active configuration
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Manager for `id`, created on first use
    pub fn manager(&self, id: &InstanceId) -> Arc<SessionManager> {
        if let Some(manager) = self.managers.read().get(id) {
            return manager.clone();
        }

        self.managers
            .write()
            .entry(id.clone())
            .or_insert_with(|| {
                Arc::new(SessionManager::new(
                    id.clone(),
                    &self.config,
                    self.keystore.clone(),
                ))
            })
            .clone()
    }

    /// Active instance id
    pub fn active_instance(&self) -> Option<InstanceId> {
        self.notifier.current()
    }

    /// Manager of the active instance
    pub fn active(&self) -> Option<Arc<SessionManager>> {
        self.active_instance().map(|id| self.manager(&id))
    }

    /// State of the active instance
    pub fn state(&self) -> Option<SessionState> {
        self.active().map(|manager| manager.state())
    }

    /// Make `id` the active instance.
    ///
    /// The previous instance is deactivated (its key dropped, its persisted
    /// session kept) and every subscriber is notified once before this
    /// returns. Switching to the active instance does nothing.
    pub async fn switch_instance(&self, id: InstanceId) -> Result<Arc<SessionManager>> {
        let _switching = self.switching.lock().await;

        let previous = self.notifier.current();
        if previous.as_ref() == Some(&id) {
            return Ok(self.manager(&id));
        }

        if let Some(previous) = previous.as_ref() {
            self.manager(previous).deactivate().await;
        }

        let manager = self.manager(&id);
        manager.refresh().await;

        self.notifier.activate(id.clone());
        info!(
            "Active instance: {} -> {}",
            previous.as_ref().map(InstanceId::as_str).unwrap_or("none"),
            id
        );
        Ok(manager)
    }

    /// Run `callback` on every instance switch until the subscription drops
    pub fn on_instance_change<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&InstanceChange) + Send + Sync + 'static,
    {
        self.notifier.subscribe(callback)
    }

    /// Follow the active instance asynchronously
    pub fn watch_instance(&self) -> watch::Receiver<Option<InstanceId>> {
        self.notifier.watch()
    }

    /// Query cache cleared on every instance switch
    pub fn query_cache(&self) -> QueryCache {
        QueryCache::attach(&self.notifier)
    }

    /// Instances present under the data directory
    pub fn instances(&self) -> Result<Vec<InstanceId>> {
        instance::list_instances(&self.config.data_dir)
    }
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("data_dir", &self.config.data_dir)
            .field("active", &self.notifier.current())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lockbox_storage_sqlite::{KdfParams, MockKeystore};
    use tempfile::tempdir;

    fn registry(dir: &std::path::Path) -> SessionRegistry {
        let config = SessionConfig::new(dir).with_kdf(KdfParams::insecure_for_tests());
        SessionRegistry::new(config, Arc::new(MockKeystore::new())).unwrap()
    }

    #[tokio::test]
    async fn test_manager_is_shared_per_instance() {
        let dir = tempdir().unwrap();
        let registry = registry(dir.path());
        let id = InstanceId::new("alpha").unwrap();

        assert!(Arc::ptr_eq(&registry.manager(&id), &registry.manager(&id)));
        assert!(registry.active().is_none());
    }

    #[tokio::test]
    async fn test_switch_is_idempotent() {
        let dir = tempdir().unwrap();
        let registry = registry(dir.path());
        let count = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = count.clone();
        let _sub = registry.on_instance_change(move |_| {
            counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        });

        let alpha = InstanceId::new("alpha").unwrap();
        registry.switch_instance(alpha.clone()).await.unwrap();
        registry.switch_instance(alpha.clone()).await.unwrap();

        assert_eq!(count.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(registry.active_instance(), Some(alpha));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let dir = tempdir().unwrap();
        let mut config = SessionConfig::new(dir.path());
        config.min_password_length = 0;
        assert!(SessionRegistry::new(config, Arc::new(MockKeystore::new())).is_err());
    }
}
