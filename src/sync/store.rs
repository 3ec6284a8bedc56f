//! Lease-locked synchronization through a shared window store.

use async_trait::async_trait;
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::clock::{Clock, MonotonicClock};
use crate::error::{ConfigError, SyncError};
use crate::registry::TenantWindow;
use crate::sleeper::{Sleeper, TokioSleeper};
use crate::sync::{SyncAdapter, WindowOp};
use crate::window::SegmentedWindow;

/// Abstract storage for shared windows and their locks (e.g., a Redis or etcd client).
///
/// Implementations own the transport; the adapter only relies on these primitives.
/// Lock semantics follow the usual lease pattern: a lock is held by the caller that
/// set it with a unique `token` until it is released or its lease runs out.
#[async_trait]
pub trait SharedWindowStore: Send + Sync + std::fmt::Debug {
    /// Error type for storage operations.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Take the lock `key` for `lease` if it is free or expired.
    ///
    /// Returns `Ok(false)` when someone else holds it.
    async fn try_lock(&self, key: &str, token: &str, lease: Duration) -> Result<bool, Self::Error>;

    /// Release the lock `key` if it is still held with `token`.
    ///
    /// Returns `Ok(false)` if the lease had already expired or the lock changed hands.
    async fn unlock(&self, key: &str, token: &str) -> Result<bool, Self::Error>;

    /// Fetch the window stored under `key`.
    async fn load(&self, key: &str) -> Result<Option<SegmentedWindow>, Self::Error>;

    /// Overwrite the window stored under `key`.
    async fn save(&self, key: &str, window: &SegmentedWindow) -> Result<(), Self::Error>;
}

/// Settings of the lock protocol used by [`StoreSyncAdapter`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreSyncConfig {
    prefix: String,
    lease: Duration,
    acquire_timeout: Duration,
    retry_interval: Duration,
}

impl Default for StoreSyncConfig {
    fn default() -> Self {
        Self {
            prefix: "loadgate".to_string(),
            lease: Duration::from_secs(8),
            acquire_timeout: Duration::from_secs(2),
            retry_interval: Duration::from_millis(25),
        }
    }
}

impl StoreSyncConfig {
    /// Namespace for state and lock keys: `{prefix}:{tenant}` and `{prefix}:{tenant}:lock`.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// How long a lock stays valid without being released.
    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    /// Longest time spent trying to take a lock before giving up.
    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// Pause between two lock attempts.
    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn lease(&self) -> Duration {
        self.lease
    }

    pub fn acquire_timeout(&self) -> Duration {
        self.acquire_timeout
    }

    pub fn retry_interval(&self) -> Duration {
        self.retry_interval
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let prefix = self.prefix.trim();
        if prefix.is_empty() {
            return Err(ConfigError::InvalidStoreConfig("prefix cannot be empty".into()));
        }
        if prefix.chars().any(|c| c.is_control()) {
            return Err(ConfigError::InvalidStoreConfig(
                "prefix cannot contain control characters".into(),
            ));
        }
        if self.lease < Duration::from_millis(1) {
            return Err(ConfigError::InvalidStoreConfig(format!(
                "lease must be at least 1ms (got {:?})",
                self.lease
            )));
        }
        if self.retry_interval.is_zero() {
            return Err(ConfigError::InvalidStoreConfig("retry_interval must be > 0".into()));
        }
        Ok(())
    }
}

/// Synchronization adapter sharing windows between instances through a
/// [`SharedWindowStore`].
///
/// Each exclusive section:
/// 1. takes the tenant lock with a fresh random token, polling until `acquire_timeout`;
/// 2. loads the shared window into the local mirror (incompatible or missing state
///    starts from empty);
/// 3. runs the operation on the mirror;
/// 4. refuses to write if the lease has run out meanwhile;
/// 5. saves the window and releases the lock.
///
/// Instances must share a wall clock ([`crate::SystemClock`]) for their windows so that
/// segment indices agree. The adapter's own clock only measures lock timing.
///
/// If the operation panics the lock is not released and expires with its lease.
pub struct StoreSyncAdapter<S> {
    store: Arc<S>,
    config: StoreSyncConfig,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
}

impl<S> std::fmt::Debug for StoreSyncAdapter<S>
where
    S: std::fmt::Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreSyncAdapter")
            .field("store", &self.store)
            .field("config", &self.config)
            .field("clock", &self.clock)
            .field("sleeper", &"<sleeper>")
            .finish()
    }
}

impl<S> StoreSyncAdapter<S>
where
    S: SharedWindowStore + 'static,
{
    /// Create an adapter over `store`, validating `config`.
    pub fn new(store: Arc<S>, config: StoreSyncConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let config = StoreSyncConfig { prefix: config.prefix.trim().to_string(), ..config };
        Ok(Self {
            store,
            config,
            clock: Arc::new(MonotonicClock::default()),
            sleeper: Arc::new(TokioSleeper),
        })
    }

    /// Override the clock used for acquisition budget and lease checks.
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Override how the adapter waits between lock attempts.
    pub fn with_sleeper<Z: Sleeper + 'static>(mut self, sleeper: Z) -> Self {
        self.sleeper = Arc::new(sleeper);
        self
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn config(&self) -> &StoreSyncConfig {
        &self.config
    }

    /// Key under which the window of `tenant` is stored.
    pub fn state_key(&self, tenant: &str) -> String {
        format!("{}:{}", self.config.prefix, tenant)
    }

    /// Key of the lock guarding the window of `tenant`.
    pub fn lock_key(&self, tenant: &str) -> String {
        format!("{}:{}:lock", self.config.prefix, tenant)
    }

    fn millis(duration: Duration) -> u64 {
        u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
    }

    /// Take the lock, returning the clock reading taken just before the winning attempt.
    async fn acquire(&self, lock_key: &str, token: &str) -> Result<u64, SyncError> {
        let started = self.clock.now_millis();
        let budget = Self::millis(self.config.acquire_timeout);
        let mut attempts = 0usize;
        loop {
            let attempt_at = self.clock.now_millis();
            attempts += 1;
            let acquired = self
                .store
                .try_lock(lock_key, token, self.config.lease)
                .await
                .map_err(|e| SyncError::backend(lock_key, e))?;
            if acquired {
                debug!(target: "loadgate::sync", key = %lock_key, attempts, "lock acquired");
                return Ok(attempt_at);
            }

            let waited = self.clock.now_millis().saturating_sub(started);
            if waited >= budget {
                warn!(target: "loadgate::sync", key = %lock_key, attempts, waited_ms = waited, "lock acquisition timed out");
                return Err(SyncError::LockTimeout {
                    key: lock_key.to_string(),
                    waited: Duration::from_millis(waited),
                });
            }
            let pause = self.config.retry_interval.min(Duration::from_millis(budget - waited));
            self.sleeper.sleep(pause).await;
        }
    }

    async fn run_locked<'a>(
        &'a self,
        state_key: &'a str,
        lock_key: &'a str,
        acquired_at: u64,
        tenant: &'a TenantWindow,
        op: WindowOp<'a>,
    ) -> Result<(), SyncError> {
        let shared = self
            .store
            .load(state_key)
            .await
            .map_err(|e| SyncError::backend(state_key, e))?;

        let updated = {
            let mut window = tenant.lock();
            match shared {
                Some(shared) if shared.same_layout(&window) => *window = shared,
                Some(_) => {
                    warn!(target: "loadgate::sync", key = %state_key, "discarding shared window with a different layout");
                    window.reset();
                }
                None => window.reset(),
            }
            op(&mut *window);
            window.clone()
        };

        let held = self.clock.now_millis().saturating_sub(acquired_at);
        if held >= Self::millis(self.config.lease) {
            warn!(target: "loadgate::sync", key = %lock_key, held_ms = held, "lease expired before save; update dropped");
            return Err(SyncError::LeaseExpired { key: lock_key.to_string() });
        }

        self.store.save(state_key, &updated).await.map_err(|e| SyncError::backend(state_key, e))
    }
}

#[async_trait]
impl<S> SyncAdapter for StoreSyncAdapter<S>
where
    S: SharedWindowStore + 'static,
{
    async fn with_exclusive_access<'a>(
        &'a self,
        tenant: &'a TenantWindow,
        op: WindowOp<'a>,
    ) -> Result<(), SyncError> {
        let state_key = self.state_key(tenant.key());
        let lock_key = self.lock_key(tenant.key());
        let token = Uuid::new_v4().to_string();

        let acquired_at = self.acquire(&lock_key, &token).await?;
        let outcome = self.run_locked(&state_key, &lock_key, acquired_at, tenant, op).await;
        let released = self.store.unlock(&lock_key, &token).await;

        match (outcome, released) {
            (Err(e), released) => {
                if let Err(unlock_err) = released {
                    warn!(target: "loadgate::sync", key = %lock_key, error = %unlock_err, "failed to release lock after error");
                }
                Err(e)
            }
            (Ok(()), Ok(true)) => Ok(()),
            (Ok(()), Ok(false)) => {
                warn!(target: "loadgate::sync", key = %lock_key, "lock lost before release");
                Err(SyncError::LeaseExpired { key: lock_key })
            }
            (Ok(()), Err(e)) => Err(SyncError::backend(lock_key, e)),
        }
    }
}

#[derive(Debug, Default)]
struct StoreState {
    /// lock key -> (token, expires at millis)
    locks: HashMap<String, (String, u64)>,
    windows: HashMap<String, SegmentedWindow>,
}

/// In-process [`SharedWindowStore`]. Clones share the same data, so several adapters
/// built on one store behave like instances sharing a remote service.
#[derive(Debug, Clone)]
pub struct InMemorySharedStore {
    state: Arc<Mutex<StoreState>>,
    clock: Arc<dyn Clock>,
}

impl Default for InMemorySharedStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemorySharedStore {
    pub fn new() -> Self {
        Self::with_clock(MonotonicClock::default())
    }

    /// Store whose lease expiry follows `clock`.
    pub fn with_clock<C: Clock + 'static>(clock: C) -> Self {
        Self { state: Arc::new(Mutex::new(StoreState::default())), clock: Arc::new(clock) }
    }

    /// Current holder token of `key`, if the lock is held and not expired.
    pub fn lock_holder(&self, key: &str) -> Option<String> {
        let now = self.clock.now_millis();
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.locks.get(key).filter(|(_, expires)| *expires > now).map(|(token, _)| token.clone())
    }

    /// Copy of the stored window under `key`.
    pub fn window(&self, key: &str) -> Option<SegmentedWindow> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.windows.get(key).cloned()
    }
}

#[async_trait]
impl SharedWindowStore for InMemorySharedStore {
    type Error = Infallible;

    async fn try_lock(&self, key: &str, token: &str, lease: Duration) -> Result<bool, Self::Error> {
        let now = self.clock.now_millis();
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some((holder, expires)) = state.locks.get(key) {
            if *expires > now && holder != token {
                return Ok(false);
            }
        }
        let lease_ms = u64::try_from(lease.as_millis()).unwrap_or(u64::MAX);
        state.locks.insert(key.to_string(), (token.to_string(), now.saturating_add(lease_ms)));
        Ok(true)
    }

    async fn unlock(&self, key: &str, token: &str) -> Result<bool, Self::Error> {
        let now = self.clock.now_millis();
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        match state.locks.get(key) {
            Some((holder, expires)) if holder == token => {
                let live = *expires > now;
                state.locks.remove(key);
                Ok(live)
            }
            _ => Ok(false),
        }
    }

    async fn load(&self, key: &str) -> Result<Option<SegmentedWindow>, Self::Error> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(state.windows.get(key).cloned())
    }

    async fn save(&self, key: &str, window: &SegmentedWindow) -> Result<(), Self::Error> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.windows.insert(key.to_string(), window.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::WindowConfig;
    use crate::registry::TenantRegistry;
    use crate::sleeper::AdvancingSleeper;
    use std::io;

    fn registry() -> TenantRegistry {
        TenantRegistry::new(
            WindowConfig::new(100, Duration::from_secs(10), Some(Duration::from_secs(1))).unwrap(),
        )
    }

    fn adapter(store: Arc<InMemorySharedStore>, clock: &ManualClock) -> StoreSyncAdapter<InMemorySharedStore> {
        StoreSyncAdapter::new(store, StoreSyncConfig::default())
            .unwrap()
            .with_clock(clock.clone())
            .with_sleeper(AdvancingSleeper::new(clock.clone()))
    }

    #[test]
    fn config_validation() {
        let store = Arc::new(InMemorySharedStore::new());
        for bad in [
            StoreSyncConfig::default().with_prefix("  "),
            StoreSyncConfig::default().with_prefix("a\nb"),
            StoreSyncConfig::default().with_lease(Duration::ZERO),
            StoreSyncConfig::default().with_retry_interval(Duration::ZERO),
        ] {
            let err = StoreSyncAdapter::new(store.clone(), bad).expect_err("invalid config");
            assert!(matches!(err, ConfigError::InvalidStoreConfig(_)));
        }
        let ok = StoreSyncAdapter::new(store, StoreSyncConfig::default().with_prefix(" api ")).unwrap();
        assert_eq!(ok.state_key("t"), "api:t");
        assert_eq!(ok.lock_key("t"), "api:t:lock");
    }

    #[tokio::test]
    async fn writes_through_to_store_and_releases_lock() {
        let clock = ManualClock::starting_at(1_000);
        let store = Arc::new(InMemorySharedStore::with_clock(clock.clone()));
        let adapter = adapter(store.clone(), &clock);
        let registry = registry();
        let tenant = registry.get_or_create("t");

        adapter
            .with_exclusive_access(&tenant, Box::new(|w: &mut SegmentedWindow| w.add(30, 1_000)))
            .await
            .unwrap();

        assert_eq!(store.window("loadgate:t").map(|w| w.total()), Some(30));
        assert_eq!(store.lock_holder("loadgate:t:lock"), None);
    }

    #[tokio::test]
    async fn mirror_is_refreshed_from_store() {
        let clock = ManualClock::starting_at(1_000);
        let store = Arc::new(InMemorySharedStore::with_clock(clock.clone()));
        let first = adapter(store.clone(), &clock);
        let second = adapter(store.clone(), &clock);
        let (reg_a, reg_b) = (registry(), registry());

        first
            .with_exclusive_access(
                &reg_a.get_or_create("t"),
                Box::new(|w: &mut SegmentedWindow| w.add(40, 1_000)),
            )
            .await
            .unwrap();

        let mut seen = 0;
        second
            .with_exclusive_access(
                &reg_b.get_or_create("t"),
                Box::new(|w: &mut SegmentedWindow| seen = w.peek(1_000)),
            )
            .await
            .unwrap();
        assert_eq!(seen, 40);
    }

    #[tokio::test]
    async fn lock_held_elsewhere_times_out() {
        let clock = ManualClock::starting_at(1_000);
        let store = Arc::new(InMemorySharedStore::with_clock(clock.clone()));
        assert!(store.try_lock("loadgate:t:lock", "someone-else", Duration::from_secs(60)).await.unwrap());

        let sleeper = AdvancingSleeper::new(clock.clone());
        let adapter = StoreSyncAdapter::new(
            store.clone(),
            StoreSyncConfig::default()
                .with_acquire_timeout(Duration::from_millis(100))
                .with_retry_interval(Duration::from_millis(30)),
        )
        .unwrap()
        .with_clock(clock.clone())
        .with_sleeper(sleeper.clone());
        let registry = registry();

        let mut ran = false;
        let err = adapter
            .with_exclusive_access(
                &registry.get_or_create("t"),
                Box::new(|_w: &mut SegmentedWindow| ran = true),
            )
            .await
            .expect_err("lock is taken");

        assert!(!ran);
        assert!(matches!(err, SyncError::LockTimeout { ref key, .. } if key == "loadgate:t:lock"));
        // 30 + 30 + 30 + 10: never sleeps past the budget
        assert_eq!(sleeper.total_slept(), Duration::from_millis(100));
        assert_eq!(store.lock_holder("loadgate:t:lock").as_deref(), Some("someone-else"));
    }

    #[tokio::test]
    async fn expired_foreign_lock_is_taken_over() {
        let clock = ManualClock::starting_at(1_000);
        let store = Arc::new(InMemorySharedStore::with_clock(clock.clone()));
        assert!(store.try_lock("loadgate:t:lock", "crashed", Duration::from_millis(50)).await.unwrap());
        clock.advance(Duration::from_millis(60));

        let adapter = adapter(store.clone(), &clock);
        let registry = registry();
        adapter
            .with_exclusive_access(
                &registry.get_or_create("t"),
                Box::new(|w: &mut SegmentedWindow| w.add(1, 1_060)),
            )
            .await
            .unwrap();
        assert_eq!(store.window("loadgate:t").map(|w| w.total()), Some(1));
    }

    /// Store whose loads take longer than the lease.
    #[derive(Debug)]
    struct SlowStore {
        inner: InMemorySharedStore,
        clock: ManualClock,
        delay: Duration,
    }

    #[async_trait]
    impl SharedWindowStore for SlowStore {
        type Error = Infallible;

        async fn try_lock(&self, key: &str, token: &str, lease: Duration) -> Result<bool, Infallible> {
            self.inner.try_lock(key, token, lease).await
        }
        async fn unlock(&self, key: &str, token: &str) -> Result<bool, Infallible> {
            self.inner.unlock(key, token).await
        }
        async fn load(&self, key: &str) -> Result<Option<SegmentedWindow>, Infallible> {
            self.clock.advance(self.delay);
            self.inner.load(key).await
        }
        async fn save(&self, key: &str, window: &SegmentedWindow) -> Result<(), Infallible> {
            self.inner.save(key, window).await
        }
    }

    #[tokio::test]
    async fn lease_expiry_is_reported_and_nothing_is_written() {
        let clock = ManualClock::starting_at(1_000);
        let inner = InMemorySharedStore::with_clock(clock.clone());
        let store = Arc::new(SlowStore {
            inner: inner.clone(),
            clock: clock.clone(),
            delay: Duration::from_secs(9),
        });
        let adapter = StoreSyncAdapter::new(store, StoreSyncConfig::default())
            .unwrap()
            .with_clock(clock.clone());
        let registry = registry();

        let err = adapter
            .with_exclusive_access(
                &registry.get_or_create("t"),
                Box::new(|w: &mut SegmentedWindow| w.add(5, 1_000)),
            )
            .await
            .expect_err("lease is 8s, load took 9s");
        assert!(matches!(err, SyncError::LeaseExpired { .. }));
        assert!(inner.window("loadgate:t").is_none());
    }

    /// Store that is unreachable.
    #[derive(Debug)]
    struct DownStore;

    #[async_trait]
    impl SharedWindowStore for DownStore {
        type Error = io::Error;

        async fn try_lock(&self, _key: &str, _token: &str, _lease: Duration) -> Result<bool, io::Error> {
            Err(io::Error::new(io::ErrorKind::ConnectionRefused, "connection refused"))
        }
        async fn unlock(&self, _key: &str, _token: &str) -> Result<bool, io::Error> {
            Ok(true)
        }
        async fn load(&self, _key: &str) -> Result<Option<SegmentedWindow>, io::Error> {
            Ok(None)
        }
        async fn save(&self, _key: &str, _window: &SegmentedWindow) -> Result<(), io::Error> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn backend_failure_surfaces_as_sync_error() {
        let adapter = StoreSyncAdapter::new(Arc::new(DownStore), StoreSyncConfig::default()).unwrap();
        let registry = registry();
        let err = adapter
            .with_exclusive_access(
                &registry.get_or_create("t"),
                Box::new(|_w: &mut SegmentedWindow| {}),
            )
            .await
            .expect_err("store is down");
        assert!(matches!(err, SyncError::Backend { .. }));
        assert!(err.to_string().contains("connection refused"));
    }
}
