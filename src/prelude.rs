//! Convenient re-exports for common loadgate types.
pub use crate::{
    clock::{Clock, ManualClock, MonotonicClock, SystemClock},
    config::WindowConfig,
    error::{ConfigError, LoadLimiterError, SyncError},
    limiter::{LoadLimiter, LoadLimiterBuilder, SubmitResult, TenantLimiter},
    sleeper::{Sleeper, TokioSleeper},
    stats::WindowStats,
    sync::{LocalSyncAdapter, SharedWindowStore, StoreSyncAdapter, StoreSyncConfig, SyncAdapter},
};
