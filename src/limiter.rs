//! Submission controller: the admission decision for a tenant.
//!
//! Semantics of [`LoadLimiter::submit`]:
//! - The tenant's window is created on first use and rolled forward to "now" before
//!   anything else, all under the synchronization adapter's exclusion.
//! - A load of `0` is always accepted and records nothing.
//! - A load is accepted when `window_total + amount <= max_load` (equality accepts), and
//!   then recorded in the current segment.
//! - A rejection carries the shortest delay after which the same load would fit, unless
//!   the load exceeds `max_load` (it never fits) or retry hints are disabled.
//! - Synchronization failures are returned as errors, never as rejections.
//!
//! Example
//! ```rust
//! use loadgate::LoadLimiter;
//! use std::time::Duration;
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let limiter = LoadLimiter::builder()
//!     .max_load(100)
//!     .window_size(Duration::from_secs(10))
//!     .build()
//!     .unwrap();
//!
//! assert!(limiter.submit("client-a", 60).await.unwrap().accepted);
//! let second = limiter.submit("client-a", 50).await.unwrap();
//! assert!(!second.accepted);
//! assert!(second.retry_in().is_some());
//!
//! // never fits
//! let huge = limiter.submit("client-a", 500).await.unwrap();
//! assert_eq!(huge.retry_in(), None);
//! # });
//! ```

use crate::clock::{Clock, MonotonicClock, SystemClock};
use crate::config::WindowConfig;
use crate::error::{LoadLimiterError, SyncError};
use crate::registry::TenantRegistry;
use crate::sleeper::{Sleeper, TokioSleeper};
use crate::stats::WindowStats;
use crate::sync::{LocalSyncAdapter, SyncAdapter};
use crate::window::SegmentedWindow;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Outcome of one submission.
///
/// `retry_in` is meaningful only when `accepted` is false and `retry_in_available` is true.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmitResult {
    pub accepted: bool,
    pub retry_in_available: bool,
    pub retry_in: Duration,
}

impl SubmitResult {
    pub fn accepted() -> Self {
        Self { accepted: true, retry_in_available: false, retry_in: Duration::ZERO }
    }

    pub fn rejected_with_retry(retry_in: Duration) -> Self {
        Self { accepted: false, retry_in_available: true, retry_in }
    }

    pub fn rejected_without_retry() -> Self {
        Self { accepted: false, retry_in_available: false, retry_in: Duration::ZERO }
    }

    /// Suggested delay before resubmitting, if the load was rejected and can fit later.
    pub fn retry_in(&self) -> Option<Duration> {
        (!self.accepted && self.retry_in_available).then_some(self.retry_in)
    }
}

pub(crate) struct Inner {
    pub(crate) config: WindowConfig,
    pub(crate) retry_hints: bool,
    pub(crate) registry: TenantRegistry,
    pub(crate) adapter: Arc<dyn SyncAdapter>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) sleeper: Arc<dyn Sleeper>,
}

/// Multi-tenant sliding-window load limiter.
///
/// Clones share the same tenants, adapter and clock.
#[derive(Clone)]
pub struct LoadLimiter {
    pub(crate) inner: Arc<Inner>,
}

impl std::fmt::Debug for LoadLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadLimiter")
            .field("config", &self.inner.config)
            .field("retry_hints", &self.inner.retry_hints)
            .field("tenants", &self.inner.registry.len())
            .field("adapter", &self.inner.adapter)
            .field("clock", &self.inner.clock)
            .field("sleeper", &"<sleeper>")
            .finish()
    }
}

impl LoadLimiter {
    /// Construct a new builder; `max_load` and `window_size` are required.
    pub fn builder() -> LoadLimiterBuilder {
        LoadLimiterBuilder::new()
    }

    pub fn config(&self) -> &WindowConfig {
        &self.inner.config
    }

    /// Fixed-key view for callers with a single tenant (or global limiting).
    pub fn for_tenant(&self, tenant: impl Into<String>) -> TenantLimiter {
        TenantLimiter { limiter: self.clone(), tenant: tenant.into() }
    }

    /// Decide whether `amount` of load may proceed now for `tenant`; commit it if so.
    pub async fn submit(&self, tenant: &str, amount: u64) -> Result<SubmitResult, LoadLimiterError> {
        let max_load = self.inner.config.max_load();
        let retry_hints = self.inner.retry_hints;
        let clock = self.inner.clock.clone();

        let result = self
            .exclusive(tenant, move |window| {
                decide(window, clock.now_millis(), amount, max_load, retry_hints)
            })
            .await?;

        if result.accepted {
            debug!(target: "loadgate::limiter", tenant = %tenant, amount, "load accepted");
        } else {
            debug!(
                target: "loadgate::limiter",
                tenant = %tenant,
                amount,
                retry_in_ms = result.retry_in().map(|d| d.as_millis() as u64),
                "load rejected"
            );
        }
        Ok(result)
    }

    /// Snapshot of `tenant`'s window, rolled forward to now.
    pub async fn stats(&self, tenant: &str) -> Result<WindowStats, LoadLimiterError> {
        let max_load = self.inner.config.max_load();
        let clock = self.inner.clock.clone();
        let stats = self
            .exclusive(tenant, move |window| {
                let window_total = window.peek(clock.now_millis());
                WindowStats { window_total, max_load, segments: window.segments() }
            })
            .await?;
        Ok(stats)
    }

    /// Drop the local window of `tenant`, forgetting its load. Returns whether it existed.
    ///
    /// Submissions already waiting on the old window are redirected to a fresh one
    /// instead of committing to the removed window. Removal is a teardown: load recorded
    /// before it no longer counts, so a tenant removed while busy may briefly receive up
    /// to `max_load` again. Shared state held by a distributed adapter is left untouched.
    pub fn remove_tenant(&self, tenant: &str) -> bool {
        self.inner.registry.remove(tenant)
    }

    /// Tenants with a local window, sorted.
    pub fn tenants(&self) -> Vec<String> {
        self.inner.registry.tenants()
    }

    /// Run `f` on `tenant`'s window under the adapter's exclusion and copy its result out.
    ///
    /// A window retired by a concurrent `remove_tenant` is never written; the tenant is
    /// looked up again and the operation runs on its fresh window.
    async fn exclusive<R, F>(&self, tenant: &str, f: F) -> Result<R, LoadLimiterError>
    where
        R: Send,
        F: FnOnce(&mut SegmentedWindow) -> R + Send,
    {
        let mut f = Some(f);
        loop {
            let window = self.inner.registry.get_or_create(tenant);
            let mut output = None;
            let mut retired = false;
            let outcome = self
                .inner
                .adapter
                .with_exclusive_access(
                    &window,
                    Box::new(|w: &mut SegmentedWindow| {
                        retired = window.is_retired();
                        if !retired {
                            output = f.take().map(|f| f(w));
                        }
                    }),
                )
                .await;

            if let Err(e) = outcome {
                warn!(target: "loadgate::limiter", tenant = %tenant, error = %e, "synchronization failed");
                return Err(e.into());
            }
            if retired {
                debug!(target: "loadgate::limiter", tenant = %tenant, "window removed while waiting; retrying on a fresh one");
                continue;
            }
            return output.ok_or_else(|| {
                SyncError::backend(tenant, "adapter returned without running the window operation")
                    .into()
            });
        }
    }
}

/// Admission decision on a window already under exclusion.
fn decide(
    window: &mut SegmentedWindow,
    now_ms: u64,
    amount: u64,
    max_load: u64,
    retry_hints: bool,
) -> SubmitResult {
    let total = window.peek(now_ms);
    if amount == 0 {
        return SubmitResult::accepted();
    }
    if total.checked_add(amount).is_some_and(|after| after <= max_load) {
        window.add(amount, now_ms);
        return SubmitResult::accepted();
    }
    if !retry_hints {
        return SubmitResult::rejected_without_retry();
    }
    match window.estimate_retry_delay(now_ms, amount, max_load) {
        Some(delay) => SubmitResult::rejected_with_retry(delay),
        None => SubmitResult::rejected_without_retry(),
    }
}

/// Builder for [`LoadLimiter`].
pub struct LoadLimiterBuilder {
    max_load: u64,
    window_size: Duration,
    segment_duration: Option<Duration>,
    retry_hints: bool,
    adapter: Option<Arc<dyn SyncAdapter>>,
    clock: Option<Arc<dyn Clock>>,
    sleeper: Arc<dyn Sleeper>,
}

impl LoadLimiterBuilder {
    pub fn new() -> Self {
        Self {
            max_load: 0,
            window_size: Duration::ZERO,
            segment_duration: None,
            retry_hints: true,
            adapter: None,
            clock: None,
            sleeper: Arc::new(TokioSleeper),
        }
    }

    /// Ceiling of cumulative load in any trailing window. Must be > 0.
    pub fn max_load(mut self, max_load: u64) -> Self {
        self.max_load = max_load;
        self
    }

    /// Length of the trailing window: a whole number of milliseconds, at least 1ms.
    /// Sub-millisecond parts are rejected at [`build`](Self::build), not rounded.
    pub fn window_size(mut self, window_size: Duration) -> Self {
        self.window_size = window_size;
        self
    }

    /// Override the automatic segmentation; must divide the window evenly.
    pub fn segment_duration(mut self, segment: Duration) -> Self {
        self.segment_duration = Some(segment);
        self
    }

    /// Whether rejections carry a retry delay (default `true`).
    pub fn retry_hints(mut self, enabled: bool) -> Self {
        self.retry_hints = enabled;
        self
    }

    /// Share windows through `adapter` instead of keeping them in this process only.
    pub fn sync_adapter<A>(mut self, adapter: A) -> Self
    where
        A: SyncAdapter + 'static,
    {
        self.adapter = Some(Arc::new(adapter));
        self
    }

    /// Provide a custom clock. Defaults to [`MonotonicClock`], or [`SystemClock`] when a
    /// sync adapter is configured.
    pub fn clock<C>(mut self, clock: C) -> Self
    where
        C: Clock + 'static,
    {
        self.clock = Some(Arc::new(clock));
        self
    }

    /// Provide a custom sleeper for [`LoadLimiter::submit_until`].
    pub fn sleeper<S>(mut self, sleeper: S) -> Self
    where
        S: Sleeper + 'static,
    {
        self.sleeper = Arc::new(sleeper);
        self
    }

    /// Build the limiter, validating inputs.
    pub fn build(self) -> Result<LoadLimiter, LoadLimiterError> {
        let config = WindowConfig::new(self.max_load, self.window_size, self.segment_duration)?;
        let clock = match (self.clock, &self.adapter) {
            (Some(clock), _) => clock,
            (None, Some(_)) => Arc::new(SystemClock) as Arc<dyn Clock>,
            (None, None) => Arc::new(MonotonicClock::default()) as Arc<dyn Clock>,
        };
        let adapter =
            self.adapter.unwrap_or_else(|| Arc::new(LocalSyncAdapter) as Arc<dyn SyncAdapter>);

        Ok(LoadLimiter {
            inner: Arc::new(Inner {
                config,
                retry_hints: self.retry_hints,
                registry: TenantRegistry::new(config),
                adapter,
                clock,
                sleeper: self.sleeper,
            }),
        })
    }
}

impl Default for LoadLimiterBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Single-tenant view over a [`LoadLimiter`].
#[derive(Debug, Clone)]
pub struct TenantLimiter {
    limiter: LoadLimiter,
    tenant: String,
}

impl TenantLimiter {
    pub fn tenant(&self) -> &str {
        &self.tenant
    }

    pub async fn submit(&self, amount: u64) -> Result<SubmitResult, LoadLimiterError> {
        self.limiter.submit(&self.tenant, amount).await
    }

    pub async fn submit_until(&self, amount: u64, timeout: Duration) -> Result<(), LoadLimiterError> {
        self.limiter.submit_until(&self.tenant, amount, timeout).await
    }

    pub async fn stats(&self) -> Result<WindowStats, LoadLimiterError> {
        self.limiter.stats(&self.tenant).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::ConfigError;
    use crate::registry::TenantWindow;
    use crate::sync::WindowOp;
    use async_trait::async_trait;

    fn limiter(max_load: u64, clock: &ManualClock) -> LoadLimiter {
        LoadLimiter::builder()
            .max_load(max_load)
            .window_size(Duration::from_secs(10))
            .segment_duration(Duration::from_secs(1))
            .clock(clock.clone())
            .build()
            .unwrap()
    }

    #[test]
    fn build_rejects_invalid_config() {
        let err = LoadLimiter::builder().window_size(Duration::from_secs(1)).build().unwrap_err();
        assert!(matches!(err, LoadLimiterError::Configuration(ConfigError::ZeroMaxLoad)));

        let err = LoadLimiter::builder().max_load(1).build().unwrap_err();
        assert!(matches!(err, LoadLimiterError::Configuration(ConfigError::InvalidWindowSize(_))));
    }

    #[tokio::test]
    async fn worked_example_from_full_window() {
        let clock = ManualClock::new();
        let limiter = limiter(100, &clock);

        assert_eq!(limiter.submit("t", 60).await.unwrap(), SubmitResult::accepted());
        assert_eq!(limiter.stats("t").await.unwrap().window_total, 60);

        let rejected = limiter.submit("t", 50).await.unwrap();
        assert!(!rejected.accepted);
        assert!(rejected.retry_in_available);
        assert_eq!(rejected.retry_in, Duration::from_secs(10));

        clock.advance(Duration::from_secs(10));
        assert!(limiter.submit("t", 50).await.unwrap().accepted);
        assert_eq!(limiter.stats("t").await.unwrap().window_total, 50);
    }

    #[tokio::test]
    async fn oversized_request_never_gets_a_hint() {
        let clock = ManualClock::new();
        let limiter = limiter(10, &clock);
        let result = limiter.submit("t", 15).await.unwrap();
        assert_eq!(result, SubmitResult::rejected_without_retry());
        assert_eq!(result.retry_in(), None);
        assert_eq!(limiter.stats("t").await.unwrap().window_total, 0);
    }

    #[tokio::test]
    async fn exact_fit_is_accepted() {
        let clock = ManualClock::new();
        let limiter = limiter(100, &clock);
        assert!(limiter.submit("t", 70).await.unwrap().accepted);
        assert!(limiter.submit("t", 30).await.unwrap().accepted);
        assert!(!limiter.submit("t", 1).await.unwrap().accepted);
        assert_eq!(limiter.stats("t").await.unwrap().window_total, 100);
    }

    #[tokio::test]
    async fn zero_load_is_free() {
        let clock = ManualClock::new();
        let limiter = limiter(10, &clock);
        assert!(limiter.submit("t", 10).await.unwrap().accepted);
        assert!(limiter.submit("t", 0).await.unwrap().accepted);
        assert_eq!(limiter.stats("t").await.unwrap().window_total, 10);
    }

    #[tokio::test]
    async fn same_state_same_decision() {
        let clock = ManualClock::new();
        let limiter = limiter(100, &clock);
        limiter.submit("a", 40).await.unwrap();
        limiter.submit("b", 40).await.unwrap();
        // identical windows give identical answers
        let a = limiter.submit("a", 70).await.unwrap();
        let b = limiter.submit("b", 70).await.unwrap();
        assert_eq!(a, b);
        assert!(limiter.submit("a", 60).await.unwrap().accepted);
        assert!(limiter.submit("b", 60).await.unwrap().accepted);
    }

    #[tokio::test]
    async fn retry_hint_is_honoured_on_resubmission() {
        let clock = ManualClock::new();
        let limiter = limiter(100, &clock);
        limiter.submit("t", 30).await.unwrap();
        clock.advance(Duration::from_millis(2_300));
        limiter.submit("t", 50).await.unwrap();
        clock.advance(Duration::from_millis(4_100));

        let rejected = limiter.submit("t", 50).await.unwrap();
        let wait = rejected.retry_in().expect("fits later");
        // 20 free, the 30 from t=0 leaves at t=10s
        assert_eq!(wait, Duration::from_millis(3_600));

        clock.advance(wait - Duration::from_millis(1));
        assert!(!limiter.submit("t", 50).await.unwrap().accepted);
        clock.advance(Duration::from_millis(1));
        assert!(limiter.submit("t", 50).await.unwrap().accepted);
    }

    #[tokio::test]
    async fn hints_can_be_disabled() {
        let clock = ManualClock::new();
        let limiter = LoadLimiter::builder()
            .max_load(10)
            .window_size(Duration::from_secs(1))
            .retry_hints(false)
            .clock(clock)
            .build()
            .unwrap();
        limiter.submit("t", 10).await.unwrap();
        assert_eq!(limiter.submit("t", 1).await.unwrap(), SubmitResult::rejected_without_retry());
    }

    #[tokio::test]
    async fn tenant_view_and_teardown() {
        let clock = ManualClock::new();
        let limiter = limiter(10, &clock);
        let view = limiter.for_tenant("solo");
        assert_eq!(view.tenant(), "solo");
        assert!(view.submit(8).await.unwrap().accepted);
        assert_eq!(view.stats().await.unwrap().headroom(), 2);
        assert_eq!(limiter.tenants(), vec!["solo".to_string()]);

        assert!(limiter.remove_tenant("solo"));
        assert!(view.submit(8).await.unwrap().accepted);
    }

    #[tokio::test]
    async fn stats_lists_segments_oldest_first() {
        let clock = ManualClock::new();
        let limiter = limiter(100, &clock);
        limiter.submit("t", 5).await.unwrap();
        clock.advance(Duration::from_secs(2));
        limiter.submit("t", 7).await.unwrap();

        let stats = limiter.stats("t").await.unwrap();
        assert_eq!(stats.segments.len(), 10);
        assert_eq!(&stats.segments[7..], &[5, 0, 7]);
        assert_eq!(stats.window_total, 12);
        assert_eq!(stats.max_load, 100);
    }

    #[derive(Debug)]
    struct BrokenAdapter;

    #[async_trait]
    impl SyncAdapter for BrokenAdapter {
        async fn with_exclusive_access<'a>(
            &'a self,
            tenant: &'a TenantWindow,
            _op: WindowOp<'a>,
        ) -> Result<(), SyncError> {
            Err(SyncError::LockTimeout {
                key: tenant.key().to_string(),
                waited: Duration::from_millis(5),
            })
        }
    }

    #[tokio::test]
    async fn sync_failure_is_an_error_not_a_rejection() {
        let limiter = LoadLimiter::builder()
            .max_load(10)
            .window_size(Duration::from_secs(1))
            .sync_adapter(BrokenAdapter)
            .build()
            .unwrap();
        let err = limiter.submit("t", 1).await.unwrap_err();
        assert!(err.is_synchronization());
        assert_eq!(err.as_sync_error().map(|e| e.key()), Some("t"));
    }

    /// Removes the tenant from `limiter` on first use, as if a teardown raced the
    /// submission, then behaves like the local adapter.
    #[derive(Debug, Default)]
    struct TeardownAdapter {
        limiter: Arc<std::sync::Mutex<Option<LoadLimiter>>>,
        calls: Arc<std::sync::atomic::AtomicUsize>,
    }

    #[async_trait]
    impl SyncAdapter for TeardownAdapter {
        async fn with_exclusive_access<'a>(
            &'a self,
            tenant: &'a TenantWindow,
            op: WindowOp<'a>,
        ) -> Result<(), SyncError> {
            self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            let pending = self.limiter.lock().unwrap().take();
            if let Some(limiter) = pending {
                assert!(limiter.remove_tenant(tenant.key()));
            }
            LocalSyncAdapter.with_exclusive_access(tenant, op).await
        }
    }

    #[tokio::test]
    async fn removed_window_is_never_committed_to() {
        let adapter = TeardownAdapter::default();
        let (handle, calls) = (adapter.limiter.clone(), adapter.calls.clone());
        let limiter = LoadLimiter::builder()
            .max_load(10)
            .window_size(Duration::from_secs(1))
            .sync_adapter(adapter)
            .clock(ManualClock::new())
            .build()
            .unwrap();

        let orphan = limiter.inner.registry.get_or_create("t");
        *handle.lock().unwrap() = Some(limiter.clone());

        assert!(limiter.submit("t", 7).await.unwrap().accepted);
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 2);
        assert!(orphan.is_retired());
        assert_eq!(orphan.lock().total(), 0);

        let current = limiter.inner.registry.get("t").expect("recreated");
        assert!(!Arc::ptr_eq(&orphan, &current));
        assert_eq!(limiter.stats("t").await.unwrap().window_total, 7);
    }

    #[derive(Debug)]
    struct LazyAdapter;

    #[async_trait]
    impl SyncAdapter for LazyAdapter {
        async fn with_exclusive_access<'a>(
            &'a self,
            _tenant: &'a TenantWindow,
            _op: WindowOp<'a>,
        ) -> Result<(), SyncError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn adapter_skipping_the_operation_is_reported() {
        let limiter = LoadLimiter::builder()
            .max_load(10)
            .window_size(Duration::from_secs(1))
            .sync_adapter(LazyAdapter)
            .build()
            .unwrap();
        let err = limiter.submit("t", 1).await.unwrap_err();
        assert!(matches!(err, LoadLimiterError::Synchronization(SyncError::Backend { .. })));
    }
}
