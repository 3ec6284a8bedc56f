#![forbid(unsafe_code)]
#![deny(warnings)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # loadgate
//!
//! Multi-tenant sliding-window load limiting for async Rust.
//!
//! Each tenant (any string key) may submit at most `max_load` units of load within any
//! trailing window of `window_size`. The window is split into equal segments kept in a
//! ring, so eviction is cheap and a rejected caller is told how long to wait until the
//! same load would fit.
//!
//! ## Features
//!
//! - **Sliding windows** segmented into a fixed ring, advanced lazily on access
//! - **Retry hints** with the shortest delay after which a rejected load fits
//! - **Blocking submission** with a timeout budget ([`LoadLimiter::submit_until`])
//! - **Pluggable synchronization** so several instances can share one window per tenant
//! - **Injectable time** ([`Clock`], [`Sleeper`]) for deterministic tests
//!
//! ## Quick Start
//!
//! ```rust
//! use loadgate::LoadLimiter;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() {
//!     let limiter = LoadLimiter::builder()
//!         .max_load(100)
//!         .window_size(Duration::from_secs(10))
//!         .build()
//!         .unwrap();
//!
//!     let result = limiter.submit("tenant-a", 30).await.unwrap();
//!     assert!(result.accepted);
//!
//!     limiter
//!         .submit_until("tenant-a", 70, Duration::from_secs(1))
//!         .await
//!         .unwrap();
//! }
//! ```

pub mod clock;
pub mod config;
pub mod error;
pub mod limiter;
pub mod prelude;
pub mod registry;
pub mod retry;
pub mod sleeper;
pub mod stats;
pub mod sync;
pub mod window;

// Re-exports
pub use clock::{Clock, ManualClock, MonotonicClock, SystemClock};
pub use config::{WindowConfig, DEFAULT_SEGMENT_COUNT, MAX_SEGMENT_COUNT, MIN_SEGMENT_COUNT};
pub use error::{BoxError, ConfigError, LoadLimiterError, SyncError};
pub use limiter::{LoadLimiter, LoadLimiterBuilder, SubmitResult, TenantLimiter};
pub use registry::{TenantRegistry, TenantWindow};
pub use retry::RetryState;
pub use sleeper::{AdvancingSleeper, Sleeper, TokioSleeper};
pub use stats::WindowStats;
pub use sync::{
    InMemorySharedStore, LocalSyncAdapter, SharedWindowStore, StoreSyncAdapter, StoreSyncConfig,
    SyncAdapter, WindowOp,
};
pub use window::SegmentedWindow;
