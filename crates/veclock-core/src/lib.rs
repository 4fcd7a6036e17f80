//! # `VecLock` Core
//!
//! Locking subsystem for a vector storage engine.
//!
//! `VecLock` coordinates concurrent access to the stored vectors and to the
//! index structures built over them:
//!
//! - **Resource locks**: per-resource reader/writer locks, created on first
//!   use, cached per NUMA node and reclaimed when idle
//! - **Index synchronization**: non-blocking optimistic readers and
//!   serialized writers with generation counting and grace periods
//! - **Deadlock handling**: dependency-graph cycle prevention, or periodic
//!   detection and resolution by a background scanner
//! - **Lock-free primitives**: CAS / fetch-add / exchange with bounded retry
//!   and jittered exponential backoff
//!
//! ## Quick Start
//!
//! ```rust
//! use veclock_core::{LockCore, LockCoreConfig, LockMode};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let core = LockCore::new(LockCoreConfig::default())?;
//!
//!     // Exclusive access to vector 42
//!     let handle = core.lock_acquire(42, LockMode::Write)?;
//!     core.lock_release(handle)?;
//!
//!     // Scoped shared access
//!     {
//!         let _guard = core.lock(42, LockMode::Read)?;
//!     }
//!
//!     // Optimistic index read
//!     let index = core.create_index_lock();
//!     let snapshot = core.index_read_begin(&index);
//!     let consistent = core.index_read_end(&index, snapshot);
//!     assert!(consistent);
//!
//!     let stats = core.stats_snapshot();
//!     assert_eq!(stats.acquisitions, stats.releases + stats.currently_held);
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
// Clippy lints configured in workspace Cargo.toml [workspace.lints.clippy]
#![cfg_attr(
    test,
    allow(
        clippy::doc_markdown,
        clippy::uninlined_format_args,
        clippy::cast_possible_truncation,
        clippy::manual_assert
    )
)]

pub mod cancel;
pub mod config;
pub mod context;
pub mod deadlock;
pub mod error;
pub mod index_sync;
pub mod lockfree;
pub mod numa;
pub mod resource;
pub mod stats;

pub use cancel::CancellationToken;
pub use config::{DeadlockPolicy, LockCoreConfig};
pub use context::ContextId;
pub use deadlock::{DeadlockDetector, LockKey, LockRef, ScanReport};
pub use error::{Error, Result};
pub use index_sync::{IndexLock, IndexReadGuard, IndexWriteToken};
pub use resource::{LockManager, LockMode, ResourceGuard, ResourceLockHandle};
pub use stats::StatsSnapshot;

use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::deadlock::DeadlockScanner;
use crate::lockfree::LockFreeCounters;
use crate::numa::{StaticTopology, Topology};

/// The locking core: resource locks, index locks and the deadlock detector,
/// sharing one configuration and one set of counters.
///
/// Dropping the core stops the background scanner.
#[derive(Debug)]
pub struct LockCore {
    config: LockCoreConfig,
    manager: LockManager,
    detector: Arc<DeadlockDetector>,
    scanner: Option<DeadlockScanner>,
    lock_free: Arc<LockFreeCounters>,
    indexes: Mutex<Vec<Weak<IndexLock>>>,
}

// Compile-time check: the core is shared across threads.
const _: () = {
    const fn assert_send_sync<T: Send + Sync>() {}
    assert_send_sync::<LockCore>();
};

impl LockCore {
    /// Creates a core with a static topology of `config.numa.nodes` nodes.
    pub fn new(config: LockCoreConfig) -> Result<Self> {
        let topology = Arc::new(StaticTopology::new(config.numa.nodes));
        Self::with_topology(config, topology)
    }

    /// Creates a core with a caller-supplied topology.
    pub fn with_topology(config: LockCoreConfig, topology: Arc<dyn Topology>) -> Result<Self> {
        config.validate()?;
        let lock_free = Arc::new(LockFreeCounters::new());
        let detector = Arc::new(DeadlockDetector::new(&config.deadlock));
        let tracked = config.deadlock.policy != DeadlockPolicy::Off;

        let manager = LockManager::with_parts(
            &config,
            topology,
            tracked.then(|| Arc::clone(&detector)),
            Arc::clone(&lock_free),
        )?;

        let scanner = if tracked && config.deadlock.background_scan {
            Some(DeadlockScanner::spawn(
                Arc::clone(&detector),
                config.deadlock.scan_interval(),
            )?)
        } else {
            None
        };

        tracing::info!(
            policy = ?config.deadlock.policy,
            nodes = config.numa.nodes,
            background_scan = scanner.is_some(),
            "Lock core initialized"
        );

        Ok(Self {
            config,
            manager,
            detector,
            scanner,
            lock_free,
            indexes: Mutex::new(Vec::new()),
        })
    }

    /// Loads configuration (defaults, optional TOML file, environment) and
    /// creates a core from it.
    pub fn from_config_file(path: Option<&std::path::Path>) -> Result<Self> {
        Self::new(LockCoreConfig::load(path)?)
    }

    /// Configuration in effect.
    #[must_use]
    pub fn config(&self) -> &LockCoreConfig {
        &self.config
    }

    /// Resource lock manager.
    #[must_use]
    pub fn manager(&self) -> &LockManager {
        &self.manager
    }

    /// Dependency graph and cycle resolver.
    #[must_use]
    pub fn detector(&self) -> &Arc<DeadlockDetector> {
        &self.detector
    }

    /// True while the background scan thread runs.
    #[must_use]
    pub fn has_background_scanner(&self) -> bool {
        self.scanner.is_some()
    }

    /// Acquires the lock of `resource_id`.
    ///
    /// Shared requests never block past the retry ceiling (`Busy`).
    /// Exclusive requests block until granted, unless refused with
    /// `WouldDeadlock` or aborted with `DeadlockVictim`.
    pub fn lock_acquire(&self, resource_id: u64, mode: LockMode) -> Result<ResourceLockHandle> {
        self.manager.acquire(resource_id, mode)
    }

    /// Like [`lock_acquire`](Self::lock_acquire), returning `Interrupted`
    /// once `cancel` fires.
    pub fn lock_acquire_with(
        &self,
        resource_id: u64,
        mode: LockMode,
        cancel: &CancellationToken,
    ) -> Result<ResourceLockHandle> {
        self.manager.acquire_with(resource_id, mode, cancel)
    }

    /// Acquires without waiting.
    pub fn try_lock_acquire(&self, resource_id: u64, mode: LockMode) -> Result<ResourceLockHandle> {
        self.manager.try_acquire(resource_id, mode)
    }

    /// Releases a handle from [`lock_acquire`](Self::lock_acquire).
    pub fn lock_release(&self, handle: ResourceLockHandle) -> Result<()> {
        self.manager.release(handle)
    }

    /// Acquires a scoped lock, released on drop.
    pub fn lock(&self, resource_id: u64, mode: LockMode) -> Result<ResourceGuard<'_>> {
        self.manager.lock(resource_id, mode)
    }

    /// Creates an index lock reporting into this core's statistics.
    pub fn create_index_lock(&self) -> Arc<IndexLock> {
        let index = Arc::new(IndexLock::with_parts(
            self.config.retry,
            Arc::clone(&self.lock_free),
        ));
        let mut indexes = self.indexes.lock();
        indexes.retain(|weak| weak.strong_count() > 0);
        indexes.push(Arc::downgrade(&index));
        index
    }

    /// Opens an optimistic read section on `index`.
    pub fn index_read_begin<'a>(&self, index: &'a IndexLock) -> IndexReadGuard<'a> {
        index.read_begin()
    }

    /// Closes a read section. Returns false if a write overlapped it and the
    /// read must be retried.
    pub fn index_read_end(&self, index: &IndexLock, snapshot: IndexReadGuard<'_>) -> bool {
        index.read_end(snapshot)
    }

    /// Enters the writer section of `index`.
    ///
    /// The write counts as an exclusive lock of the calling context: the
    /// dependency from its most recently held lock to the index is checked
    /// (`Prevent`) or recorded (`Detect`) before waiting, and resource locks
    /// acquired inside the section depend on the index. The dependency is
    /// withdrawn when the token is ended or dropped.
    pub fn index_write_begin<'a>(&'a self, index: &'a IndexLock) -> Result<IndexWriteToken<'a>> {
        self.manager.begin_index_write(index, None)
    }

    /// Like [`index_write_begin`](Self::index_write_begin), returning
    /// `Interrupted` once `cancel` fires.
    pub fn index_write_begin_with<'a>(
        &'a self,
        index: &'a IndexLock,
        cancel: &CancellationToken,
    ) -> Result<IndexWriteToken<'a>> {
        self.manager.begin_index_write(index, Some(cancel))
    }

    /// Publishes a write. Returns the new generation.
    pub fn index_write_end(&self, index: &IndexLock, token: IndexWriteToken<'_>) -> u64 {
        index.write_end(token)
    }

    /// Registers the dependency `from -> to` for the calling context, for
    /// locks managed outside this core.
    ///
    /// Under the `Prevent` policy the dependency is refused with
    /// `WouldDeadlock` if it would close a cycle.
    pub fn register_dependency(&self, from: LockRef, to: LockRef) -> Result<()> {
        let owner = ContextId::current();
        match self.config.deadlock.policy {
            DeadlockPolicy::Prevent => self.detector.check_dependency(from, to, owner),
            DeadlockPolicy::Detect => self.detector.record_dependency(from, to, owner),
            DeadlockPolicy::Off => Ok(()),
        }
    }

    /// Withdraws the calling context from every dependency touching `key`.
    pub fn release_dependency(&self, key: LockKey) -> usize {
        self.detector.release(ContextId::current(), key)
    }

    /// Runs one deadlock scan on the calling thread.
    pub fn scan_deadlocks(&self) -> ScanReport {
        self.detector.scan()
    }

    fn live_indexes(&self) -> Vec<Arc<IndexLock>> {
        let mut indexes = self.indexes.lock();
        indexes.retain(|weak| weak.strong_count() > 0);
        indexes.iter().filter_map(Weak::upgrade).collect()
    }

    /// Counters of every layer.
    #[must_use]
    pub fn stats_snapshot(&self) -> StatsSnapshot {
        let index_stats: Vec<_> = self.live_indexes().iter().map(|i| i.stats()).collect();
        StatsSnapshot::collect(
            &self.manager.stats(),
            &self.detector.stats(),
            &index_stats,
            self.lock_free.snapshot(),
        )
    }

    /// Clears the counters of every layer.
    pub fn reset_stats(&self) {
        self.manager.reset_stats();
        self.detector.reset_stats();
        self.lock_free.reset();
        for index in self.live_indexes() {
            index.reset_stats();
        }
        tracing::debug!("Lock core statistics reset");
    }
}
