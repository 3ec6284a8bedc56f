//! Registry owning one sliding window per tenant key.
//!
//! Windows are created lazily on first use and live until removed explicitly.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use crate::config::WindowConfig;
use crate::window::SegmentedWindow;
use tracing::debug;

/// A tenant's window together with its in-process mutex.
///
/// The mutex is the exclusion used by [`crate::sync::LocalSyncAdapter`]; distributed
/// adapters also take it briefly while refreshing the local mirror.
#[derive(Debug)]
pub struct TenantWindow {
    key: String,
    window: Mutex<SegmentedWindow>,
    retired: AtomicBool,
}

impl TenantWindow {
    fn new(key: String, config: &WindowConfig) -> Self {
        Self {
            key,
            window: Mutex::new(SegmentedWindow::new(config)),
            retired: AtomicBool::new(false),
        }
    }

    /// Whether the window was removed from its registry. Read it while holding
    /// [`lock`](Self::lock): once set under the lock, no later holder may commit to it.
    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::SeqCst)
    }

    fn retire(&self) {
        let _window = self.lock();
        self.retired.store(true, Ordering::SeqCst);
    }

    /// Tenant key this window accounts for.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Lock the window. The window holds no invariant a panicking reader could break
    /// halfway, so a poisoned lock is recovered.
    pub fn lock(&self) -> MutexGuard<'_, SegmentedWindow> {
        self.window.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Map from tenant key to its window.
#[derive(Debug)]
pub struct TenantRegistry {
    config: WindowConfig,
    tenants: RwLock<HashMap<String, Arc<TenantWindow>>>,
}

impl TenantRegistry {
    pub fn new(config: WindowConfig) -> Self {
        Self { config, tenants: RwLock::new(HashMap::new()) }
    }

    /// Configuration every window in this registry is built from.
    pub fn config(&self) -> &WindowConfig {
        &self.config
    }

    /// Window for `key`, creating it on first use.
    ///
    /// Creation is exactly-once per key: concurrent callers for an unseen key all
    /// receive the same window.
    pub fn get_or_create(&self, key: &str) -> Arc<TenantWindow> {
        if let Some(existing) = self.get(key) {
            return existing;
        }
        let mut map = self.tenants.write().unwrap_or_else(PoisonError::into_inner);
        map.entry(key.to_string())
            .or_insert_with(|| {
                debug!(target: "loadgate::registry", tenant = %key, "tenant window created");
                Arc::new(TenantWindow::new(key.to_string(), &self.config))
            })
            .clone()
    }

    /// Window for `key` if it exists.
    pub fn get(&self, key: &str) -> Option<Arc<TenantWindow>> {
        let map = self.tenants.read().unwrap_or_else(PoisonError::into_inner);
        map.get(key).cloned()
    }

    /// Drop the window for `key`. Returns whether it existed.
    ///
    /// The removed window is retired under its lock: callers that looked it up earlier
    /// and take the lock afterwards see [`TenantWindow::is_retired`] and must look the
    /// key up again. The next lookup creates a fresh window.
    pub fn remove(&self, key: &str) -> bool {
        let removed = {
            let mut map = self.tenants.write().unwrap_or_else(PoisonError::into_inner);
            map.remove(key)
        };
        match removed {
            Some(window) => {
                window.retire();
                debug!(target: "loadgate::registry", tenant = %key, "tenant window removed");
                true
            }
            None => false,
        }
    }

    /// Known tenant keys, sorted.
    pub fn tenants(&self) -> Vec<String> {
        let map = self.tenants.read().unwrap_or_else(PoisonError::into_inner);
        let mut keys: Vec<String> = map.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.tenants.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
