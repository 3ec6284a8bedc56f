//! Error types for the load limiter
use std::time::Duration;
use thiserror::Error;

/// Boxed error produced by a shared-store backend.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Invalid limiter or adapter parameters, reported at construction.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// `max_load` must be > 0.
    #[error("max_load must be > 0")]
    ZeroMaxLoad,
    /// The window must be a whole number of milliseconds, at least one.
    #[error("window_size must be a whole number of milliseconds, at least 1ms (got {0:?})")]
    InvalidWindowSize(Duration),
    /// No automatic segmentation splits the window evenly; set `segment_duration`.
    #[error("window_size {0:?} cannot be split into evenly sized segments automatically; set segment_duration")]
    NoEvenSegmentation(Duration),
    /// A segment override must be >= 1ms, <= the window, and divide it evenly.
    #[error("segment_duration {segment:?} must be at least 1ms and divide window_size {window:?} evenly")]
    InvalidSegmentDuration {
        /// Segment duration provided by the caller.
        segment: Duration,
        /// Window it was supposed to partition.
        window: Duration,
    },
    /// Shared-store adapter settings are inconsistent.
    #[error("invalid shared store settings: {0}")]
    InvalidStoreConfig(String),
}

/// Failure to obtain or keep exclusive access to a tenant window.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The lock could not be acquired within the configured budget.
    #[error("could not acquire lock '{key}' within {waited:?}")]
    LockTimeout { key: String, waited: Duration },
    /// The lock lease ran out while the critical section was running; nothing was written.
    #[error("lease on lock '{key}' expired before the update completed")]
    LeaseExpired { key: String },
    /// The backing store failed (unreachable, serialization, ...).
    #[error("shared store operation on '{key}' failed: {source}")]
    Backend {
        key: String,
        #[source]
        source: BoxError,
    },
}

impl SyncError {
    /// Wrap a backend failure for `key`.
    pub fn backend(key: impl Into<String>, source: impl Into<BoxError>) -> Self {
        SyncError::Backend { key: key.into(), source: source.into() }
    }

    /// Key of the lock or state entry involved.
    pub fn key(&self) -> &str {
        match self {
            SyncError::LockTimeout { key, .. }
            | SyncError::LeaseExpired { key }
            | SyncError::Backend { key, .. } => key,
        }
    }
}

/// Unified error type for limiter operations.
#[derive(Debug, Error)]
pub enum LoadLimiterError {
    /// Invalid limiter parameters; fatal, never retried.
    #[error("invalid limiter configuration: {0}")]
    Configuration(#[from] ConfigError),
    /// Distributed lock or backing store failed during a submission.
    #[error("synchronization failed: {0}")]
    Synchronization(#[from] SyncError),
    /// Rejected and no retry delay can be offered; the request must shrink or be dropped.
    #[error("load of {requested} rejected with no retry hint (max load {max_load})")]
    RejectedNoRetryHint { requested: u64, max_load: u64 },
    /// `submit_until` ran out of budget while retrying.
    #[error("load request timed out after {elapsed:?} (limit: {timeout:?})")]
    Timeout { elapsed: Duration, timeout: Duration },
}

impl LoadLimiterError {
    /// Check if this error is a construction-time configuration error
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration(_))
    }
    /// Check if this error came from the synchronization adapter
    pub fn is_synchronization(&self) -> bool {
        matches!(self, Self::Synchronization(_))
    }
    /// Check if this error is a terminal rejection without retry hint
    pub fn is_rejected_no_retry_hint(&self) -> bool {
        matches!(self, Self::RejectedNoRetryHint { .. })
    }
    /// Check if this error is due to the retry budget running out
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
    /// Access timeout details as `(elapsed, timeout)`.
    pub fn timeout_details(&self) -> Option<(Duration, Duration)> {
        match self {
            Self::Timeout { elapsed, timeout } => Some((*elapsed, *timeout)),
            _ => None,
        }
    }
    /// Borrow the synchronization error if present.
    pub fn as_sync_error(&self) -> Option<&SyncError> {
        match self {
            Self::Synchronization(e) => Some(e),
            _ => None,
        }
    }
}
