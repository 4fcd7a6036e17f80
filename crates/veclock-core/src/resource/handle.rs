//! Handles returned by lock acquisition.

use std::sync::Arc;
use std::time::{Duration, Instant};

use super::{LockManager, LockMode, ResourceLock};
use crate::context::ContextId;
use crate::error::Result;

/// Proof of a granted resource lock.
///
/// Must be passed back to [`LockManager::release`] exactly once. Prefer
/// [`ResourceGuard`] when the lock is scoped to a block.
#[must_use = "a lock handle must be released"]
#[derive(Debug)]
pub struct ResourceLockHandle {
    pub(crate) lock: Arc<ResourceLock>,
    pub(crate) mode: LockMode,
    pub(crate) manager_id: u64,
    pub(crate) context: ContextId,
    pub(crate) acquired_at: Instant,
}

impl ResourceLockHandle {
    /// Guarded resource.
    #[must_use]
    pub fn resource_id(&self) -> u64 {
        self.lock.resource_id()
    }

    /// Granted mode.
    #[must_use]
    pub fn mode(&self) -> LockMode {
        self.mode
    }

    /// Context that acquired the lock.
    #[must_use]
    pub fn context(&self) -> ContextId {
        self.context
    }

    /// Node the lock structure lives on.
    #[must_use]
    pub fn numa_node(&self) -> usize {
        self.lock.numa_node()
    }

    /// Time since the lock was granted.
    #[must_use]
    pub fn held_for(&self) -> Duration {
        self.acquired_at.elapsed()
    }
}

/// Scoped lock: released when dropped.
#[must_use = "the lock is released as soon as the guard is dropped"]
#[derive(Debug)]
pub struct ResourceGuard<'a> {
    manager: &'a LockManager,
    handle: Option<ResourceLockHandle>,
}

impl<'a> ResourceGuard<'a> {
    pub(crate) fn new(manager: &'a LockManager, handle: ResourceLockHandle) -> Self {
        Self {
            manager,
            handle: Some(handle),
        }
    }

    /// Guarded resource.
    #[must_use]
    pub fn resource_id(&self) -> u64 {
        self.handle
            .as_ref()
            .map_or(0, ResourceLockHandle::resource_id)
    }

    /// Granted mode.
    #[must_use]
    pub fn mode(&self) -> Option<LockMode> {
        self.handle.as_ref().map(ResourceLockHandle::mode)
    }

    /// Releases now, reporting release errors instead of logging them.
    pub fn unlock(mut self) -> Result<()> {
        match self.handle.take() {
            Some(handle) => self.manager.release(handle),
            None => Ok(()),
        }
    }

    /// Detaches the handle; the caller becomes responsible for releasing it.
    pub fn into_handle(mut self) -> Option<ResourceLockHandle> {
        self.handle.take()
    }
}

impl Drop for ResourceGuard<'_> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            let resource_id = handle.resource_id();
            if let Err(err) = self.manager.release(handle) {
                tracing::error!(resource_id, error = %err, "Failed to release resource lock on drop");
            }
        }
    }
}
