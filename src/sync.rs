//! Exclusion and shared-state access for tenant windows.
//!
//! Every read or write of a [`SegmentedWindow`] made by the limiter runs inside
//! [`SyncAdapter::with_exclusive_access`]. Adapters decide what "exclusive" means:
//!
//! - [`LocalSyncAdapter`]: the tenant's in-process mutex. Single instance only.
//! - [`store::StoreSyncAdapter`]: a lease-based lock in a [`store::SharedWindowStore`],
//!   with the authoritative window kept in the store so several processes share it.
//!
//! Additional adapters can be supplied by implementing the trait; the limiter never
//! talks to a transport directly.

use crate::error::SyncError;
use crate::registry::TenantWindow;
use crate::window::SegmentedWindow;
use async_trait::async_trait;

pub mod store;

pub use store::{InMemorySharedStore, SharedWindowStore, StoreSyncAdapter, StoreSyncConfig};

/// Read-modify-write step run while the tenant's exclusion is held.
pub type WindowOp<'a> = Box<dyn FnOnce(&mut SegmentedWindow) + Send + 'a>;

/// Capability granting exclusive access to a tenant's window.
///
/// Contract:
/// - At most one holder per tenant key at a time, across every participating instance.
/// - Acquisition is bounded: fail with [`SyncError::LockTimeout`] rather than wait forever.
/// - `op` runs exactly once when `Ok(())` is returned, and never when the exclusion could
///   not be obtained.
/// - The exclusion is released on every exit path. Losing it before the update is
///   persisted is reported ([`SyncError::LeaseExpired`]), never ignored.
/// - `op` sees a window reflecting all previously committed updates for the key.
#[async_trait]
pub trait SyncAdapter: Send + Sync + std::fmt::Debug {
    async fn with_exclusive_access<'a>(
        &'a self,
        tenant: &'a TenantWindow,
        op: WindowOp<'a>,
    ) -> Result<(), SyncError>;
}

/// Default adapter: the per-tenant in-process mutex. Always succeeds.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalSyncAdapter;

#[async_trait]
impl SyncAdapter for LocalSyncAdapter {
    async fn with_exclusive_access<'a>(
        &'a self,
        tenant: &'a TenantWindow,
        op: WindowOp<'a>,
    ) -> Result<(), SyncError> {
        let mut window = tenant.lock();
        op(&mut *window);
        Ok(())
    }
}
