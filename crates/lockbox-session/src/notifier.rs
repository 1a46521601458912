//! Instance change notification
//!
//! One explicit event source for "the active instance changed". Callbacks
//! registered with [`InstanceChangeNotifier::subscribe`] run synchronously
//! during the switch, before it returns, so per-instance state is reset
//! before any query can reach the new instance. The new instance is already
//! current while callbacks run. Async observers can follow the same changes
//! through a `watch` channel.

use crate::instance::InstanceId;
use lockbox_storage_sqlite::QueryResult;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};
use tokio::sync::watch;

/// A change of the active instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceChange {
    /// Previously active instance
    pub previous: Option<InstanceId>,
    /// Newly active instance
    pub current: InstanceId,
}

type Callback = Arc<dyn Fn(&InstanceChange) + Send + Sync>;

#[derive(Default)]
struct Subscribers {
    next_id: u64,
    callbacks: BTreeMap<u64, Callback>,
}

/// Event source for active-instance changes
pub struct InstanceChangeNotifier {
    subscribers: Arc<Mutex<Subscribers>>,
    sender: watch::Sender<Option<InstanceId>>,
}

impl InstanceChangeNotifier {
    /// Create a notifier with no active instance
    pub fn new() -> Self {
        let (sender, _) = watch::channel(None);
        Self {
            subscribers: Arc::new(Mutex::new(Subscribers::default())),
            sender,
        }
    }

    /// Register `callback`; it stays registered until the returned
    /// [`Subscription`] is dropped. Callbacks run in registration order.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&InstanceChange) + Send + Sync + 'static,
    {
        let mut subscribers = self.subscribers.lock();
        let id = subscribers.next_id;
        subscribers.next_id += 1;
        subscribers.callbacks.insert(id, Arc::new(callback));

        Subscription {
            id,
            subscribers: Arc::downgrade(&self.subscribers),
        }
    }

    /// Receiver following the active instance
    pub fn watch(&self) -> watch::Receiver<Option<InstanceId>> {
        self.sender.subscribe()
    }

    /// Currently active instance
    pub fn current(&self) -> Option<InstanceId> {
        self.sender.borrow().clone()
    }

    /// Number of live subscriptions
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().callbacks.len()
    }

    /// Make `current` active and notify every subscriber once.
    ///
    /// Returns `false` without notifying when `current` is already active.
    pub(crate) fn activate(&self, current: InstanceId) -> bool {
        let previous = self.current();
        if previous.as_ref() == Some(&current) {
            return false;
        }

        self.sender.send_replace(Some(current.clone()));
        let change = InstanceChange { previous, current };

        // Snapshot so callbacks may subscribe or unsubscribe
        let callbacks: Vec<Callback> = self
            .subscribers
            .lock()
            .callbacks
            .values()
            .cloned()
            .collect();
        for callback in callbacks {
            callback(&change);
        }
        true
    }
}

impl Default for InstanceChangeNotifier {
    fn default() -> Self {
        Self::new()
    }
}

/// Keeps a callback registered; dropping it unsubscribes
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    id: u64,
    subscribers: Weak<Mutex<Subscribers>>,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(subscribers) = self.subscribers.upgrade() {
            subscribers.lock().callbacks.remove(&self.id);
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

#[derive(Default)]
struct CacheInner {
    instance: Option<InstanceId>,
    entries: HashMap<String, QueryResult>,
    resets: u64,
}

/// Query results cached for the active instance only
///
/// Cleared on every instance change; entries for any other instance are
/// neither stored nor served.
pub struct QueryCache {
    inner: Arc<Mutex<CacheInner>>,
    _subscription: Subscription,
}

impl QueryCache {
    /// Create a cache that follows `notifier`
    pub fn attach(notifier: &InstanceChangeNotifier) -> Self {
        let inner = Arc::new(Mutex::new(CacheInner {
            instance: notifier.current(),
            ..Default::default()
        }));

        let weak = Arc::downgrade(&inner);
        let subscription = notifier.subscribe(move |change| {
            if let Some(inner) = weak.upgrade() {
                let mut inner = inner.lock();
                inner.entries.clear();
                inner.instance = Some(change.current.clone());
                inner.resets += 1;
            }
        });

        Self {
            inner,
            _subscription: subscription,
        }
    }

    /// Cached result for `key` on `instance`
    pub fn get(&self, instance: &InstanceId, key: &str) -> Option<QueryResult> {
        let inner = self.inner.lock();
        if inner.instance.as_ref() != Some(instance) {
            return None;
        }
        inner.entries.get(key).cloned()
    }

    /// Cache `result`; ignored unless `instance` is the active one
    pub fn insert(&self, instance: &InstanceId, key: impl Into<String>, result: QueryResult) {
        let mut inner = self.inner.lock();
        if inner.instance.as_ref() == Some(instance) {
            inner.entries.insert(key.into(), result);
        }
    }

    /// Number of cached entries
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Whether the cache is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// How many instance changes cleared this cache
    pub fn reset_count(&self) -> u64 {
        self.inner.lock().resets
    }
}
