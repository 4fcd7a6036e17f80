//! Resource lock manager.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::Serialize;

use super::{LockMode, ResourceGuard, ResourceLock, ResourceLockHandle, ResourceLockInfo};
use crate::cancel::CancellationToken;
use crate::config::{DeadlockPolicy, LockCoreConfig, RetryConfig};
use crate::context::{ContextId, HeldLock, HeldLocks};
use crate::deadlock::{DeadlockDetector, LockKey, LockRef};
use crate::error::{Error, Result};
use crate::index_sync::{IndexLock, IndexWriteToken};
use crate::lockfree::{LockFreeCounters, LockFreeOp};
use crate::numa::{CacheStats, NumaLockCache, StaticTopology, Topology};

static NEXT_MANAGER_ID: AtomicU64 = AtomicU64::new(1);

/// How long an acquisition may wait.
#[derive(Debug, Clone, Copy)]
enum Wait<'a> {
    /// Fail with `Busy` instead of waiting.
    Never,
    /// Wait until granted, cancelled, or chosen as a deadlock victim.
    Until(Option<&'a CancellationToken>),
}

#[derive(Debug)]
struct ManagerCounters {
    acquisitions: AtomicU64,
    releases: AtomicU64,
    held: AtomicU64,
    contentions: AtomicU64,
    busy: AtomicU64,
    interrupted: AtomicU64,
    refused: AtomicU64,
    victims: AtomicU64,
    created: AtomicU64,
    reclaimed: AtomicU64,
    per_node_allocations: Vec<AtomicU64>,
}

impl ManagerCounters {
    fn new(nodes: usize) -> Result<Self> {
        let mut per_node_allocations = Vec::new();
        per_node_allocations.try_reserve_exact(nodes)?;
        per_node_allocations.extend((0..nodes).map(|_| AtomicU64::new(0)));
        Ok(Self {
            acquisitions: AtomicU64::new(0),
            releases: AtomicU64::new(0),
            held: AtomicU64::new(0),
            contentions: AtomicU64::new(0),
            busy: AtomicU64::new(0),
            interrupted: AtomicU64::new(0),
            refused: AtomicU64::new(0),
            victims: AtomicU64::new(0),
            created: AtomicU64::new(0),
            reclaimed: AtomicU64::new(0),
            per_node_allocations,
        })
    }
}

/// Manager counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ManagerStats {
    /// Granted acquisitions.
    pub acquisitions: u64,
    /// Releases.
    pub releases: u64,
    /// Locks currently held.
    pub currently_held: u64,
    /// Acquisitions that did not succeed on the first attempt.
    pub contentions: u64,
    /// Acquisitions that failed with `Busy`.
    pub busy: u64,
    /// Acquisitions cancelled by the caller.
    pub interrupted: u64,
    /// Acquisitions refused because of a dependency cycle.
    pub refused: u64,
    /// Acquisitions aborted as deadlock victims.
    pub victims: u64,
    /// Lock structures created.
    pub locks_created: u64,
    /// Lock structures reclaimed.
    pub locks_reclaimed: u64,
    /// Lock structures currently in the table.
    pub live_locks: u64,
    /// Lock structures created per NUMA node.
    pub per_node_allocations: Vec<u64>,
    /// Node cache statistics.
    pub cache: CacheStats,
}

/// Owner of all per-resource locks.
///
/// Lookups go through the caller's node cache first and fall back to the
/// global table, which creates the lock on a miss. Each in-flight
/// acquisition and each holder keeps one reference on the lock structure.
#[derive(Debug)]
pub struct LockManager {
    id: u64,
    table: Mutex<FxHashMap<u64, Arc<ResourceLock>>>,
    table_len: AtomicUsize,
    cache: NumaLockCache,
    topology: Arc<dyn Topology>,
    detector: Option<Arc<DeadlockDetector>>,
    policy: DeadlockPolicy,
    retry: RetryConfig,
    wait_slice: Duration,
    retain_idle: usize,
    held: HeldLocks,
    counters: ManagerCounters,
    lock_free: Arc<LockFreeCounters>,
}

impl LockManager {
    /// Creates a manager with its own detector and a static topology.
    pub fn new(config: &LockCoreConfig) -> Result<Self> {
        config.validate()?;
        let topology: Arc<dyn Topology> = Arc::new(StaticTopology::new(config.numa.nodes));
        let detector = (config.deadlock.policy != DeadlockPolicy::Off)
            .then(|| Arc::new(DeadlockDetector::new(&config.deadlock)));
        Self::with_parts(
            config,
            topology,
            detector,
            Arc::new(LockFreeCounters::new()),
        )
    }

    /// Creates a manager from shared components.
    pub fn with_parts(
        config: &LockCoreConfig,
        topology: Arc<dyn Topology>,
        detector: Option<Arc<DeadlockDetector>>,
        lock_free: Arc<LockFreeCounters>,
    ) -> Result<Self> {
        let nodes = topology.node_count().max(1);
        let cache = NumaLockCache::new(nodes, config.numa.cache_capacity)?;
        let counters = ManagerCounters::new(nodes)?;
        let policy = if detector.is_some() {
            config.deadlock.policy
        } else {
            DeadlockPolicy::Off
        };
        let manager = Self {
            id: NEXT_MANAGER_ID.fetch_add(1, Ordering::Relaxed),
            table: Mutex::new(FxHashMap::default()),
            table_len: AtomicUsize::new(0),
            cache,
            topology,
            detector,
            policy,
            retry: config.retry,
            wait_slice: config.manager.wait_slice(),
            retain_idle: config.manager.retain_idle,
            held: HeldLocks::new(),
            counters,
            lock_free,
        };
        tracing::debug!(
            manager = manager.id,
            nodes,
            policy = ?manager.policy,
            "Lock manager initialized"
        );
        Ok(manager)
    }

    /// Unique id of this manager.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Dependency policy in effect.
    #[must_use]
    pub fn policy(&self) -> DeadlockPolicy {
        self.policy
    }

    /// Detector shared with this manager, if any.
    #[must_use]
    pub fn detector(&self) -> Option<&Arc<DeadlockDetector>> {
        self.detector.as_ref()
    }

    /// Acquires `resource_id` in `mode`, blocking writers until granted.
    pub fn acquire(&self, resource_id: u64, mode: LockMode) -> Result<ResourceLockHandle> {
        self.acquire_inner(resource_id, mode, Wait::Until(None))
    }

    /// Like [`acquire`](Self::acquire), abandoning the wait once `cancel`
    /// is cancelled.
    pub fn acquire_with(
        &self,
        resource_id: u64,
        mode: LockMode,
        cancel: &CancellationToken,
    ) -> Result<ResourceLockHandle> {
        self.acquire_inner(resource_id, mode, Wait::Until(Some(cancel)))
    }

    /// Acquires without waiting; fails with `Busy` if the lock is taken.
    pub fn try_acquire(&self, resource_id: u64, mode: LockMode) -> Result<ResourceLockHandle> {
        self.acquire_inner(resource_id, mode, Wait::Never)
    }

    /// Acquires and wraps the handle in a scoped guard.
    pub fn lock(&self, resource_id: u64, mode: LockMode) -> Result<ResourceGuard<'_>> {
        let handle = self.acquire(resource_id, mode)?;
        Ok(ResourceGuard::new(self, handle))
    }

    fn current_node(&self) -> usize {
        self.topology.current_node() % self.cache.node_count()
    }

    fn acquire_inner(
        &self,
        resource_id: u64,
        mode: LockMode,
        wait: Wait<'_>,
    ) -> Result<ResourceLockHandle> {
        let node = self.current_node();
        let context = ContextId::current();
        let op_name = match mode {
            LockMode::Read => "resource_read_acquire",
            LockMode::Write => "resource_write_acquire",
        };
        let mut op = LockFreeOp::new(op_name, self.retry).on_node(node);

        // A blocking writer counts as waiting from before its dependency is
        // registered, so a scan can never break its edge unnoticed.
        let waiting_on = match (&self.detector, mode, wait) {
            (Some(detector), LockMode::Write, Wait::Until(_)) => {
                let key = LockKey::Resource(resource_id);
                detector.mark_waiting(context, key);
                Some(detector)
            }
            _ => None,
        };
        let result = self.acquire_with_op(&mut op, resource_id, mode, wait, node, context);
        if let Some(detector) = waiting_on {
            detector.clear_waiting(context);
        }
        op.finish(&self.lock_free);

        if let Err(err) = &result {
            self.count_failure(err);
            tracing::debug!(resource_id, mode = mode.as_str(), error = %err, "Lock acquisition failed");
        }
        result
    }

    fn count_failure(&self, err: &Error) {
        let counter = match err {
            Error::Busy(_) => &self.counters.busy,
            Error::Interrupted(_) => &self.counters.interrupted,
            Error::WouldDeadlock { .. } => &self.counters.refused,
            Error::DeadlockVictim { .. } => &self.counters.victims,
            _ => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Enters the writer section of `index` on behalf of the calling
    /// context, tracking it like a held exclusive lock.
    ///
    /// The dependency "most recently held lock -> index" is registered
    /// before waiting, so resource and index locks taken in opposite orders
    /// are refused (`Prevent`) or broken by a scan (`Detect`).
    pub(crate) fn begin_index_write<'a>(
        &'a self,
        index: &'a IndexLock,
        cancel: Option<&CancellationToken>,
    ) -> Result<IndexWriteToken<'a>> {
        let context = ContextId::current();
        let key = LockKey::Index(index.id());
        if let Some(detector) = &self.detector {
            detector.mark_waiting(context, key);
        }
        let registered = match self.register_dependency(key, LockMode::Write, context) {
            Ok(registered) => registered,
            Err(err) => {
                if let Some(detector) = &self.detector {
                    detector.clear_waiting(context);
                }
                self.count_failure(&err);
                return Err(err);
            }
        };

        let result = index.write_begin_until(cancel, || match &self.detector {
            Some(detector) if detector.take_victim(context).is_some() => {
                tracing::warn!(
                    index = index.id(),
                    context = %context,
                    "Index write aborted to break a deadlock cycle"
                );
                Err(Error::DeadlockVictim {
                    resource_id: index.id(),
                })
            }
            _ => Ok(()),
        });
        if let Some(detector) = &self.detector {
            detector.clear_waiting(context);
        }

        match result {
            Ok(token) => {
                self.held.push(
                    context,
                    HeldLock {
                        key,
                        order: index.id(),
                        mode: LockMode::Write,
                    },
                );
                Ok(token.tracked_by(self, context))
            }
            Err(err) => {
                self.withdraw_dependency(registered, context, key);
                self.count_failure(&err);
                Err(err)
            }
        }
    }

    /// Drops the index write entered by [`begin_index_write`](Self::begin_index_write).
    pub(crate) fn end_index_write(&self, index_id: u64, context: ContextId) {
        self.untrack(context, LockKey::Index(index_id), LockMode::Write);
    }

    /// Removes `key` from the lock stack of `context` and, once the context
    /// no longer holds it in any mode, withdraws its dependencies on it.
    fn untrack(&self, context: ContextId, key: LockKey, mode: LockMode) {
        self.held.remove(context, key, mode);
        if let Some(detector) = &self.detector {
            if !self.held.holds(context, key) {
                detector.release(context, key);
            }
        }
    }

    fn acquire_with_op(
        &self,
        op: &mut LockFreeOp,
        resource_id: u64,
        mode: LockMode,
        wait: Wait<'_>,
        node: usize,
        context: ContextId,
    ) -> Result<ResourceLockHandle> {
        let key = LockKey::Resource(resource_id);
        let registered = self.register_dependency(key, mode, context)?;

        let lock = match self.retain(op, node, resource_id) {
            Ok(lock) => lock,
            Err(err) => {
                self.withdraw_dependency(registered, context, key);
                return Err(err);
            }
        };

        let started = Instant::now();
        let granted = match mode {
            LockMode::Read => Self::lock_shared(&lock, op, wait),
            LockMode::Write => self.lock_exclusive(&lock, op, wait, context),
        };
        let contended = match granted {
            Ok(contended) => contended,
            Err(err) => {
                lock.release_ref(op);
                self.withdraw_dependency(registered, context, key);
                return Err(err);
            }
        };

        lock.record_acquired(started.elapsed(), contended);
        if contended {
            self.counters.contentions.fetch_add(1, Ordering::Relaxed);
        }
        self.counters.acquisitions.fetch_add(1, Ordering::Relaxed);
        self.counters.held.fetch_add(1, Ordering::Relaxed);
        self.held.push(
            context,
            HeldLock {
                key,
                order: resource_id,
                mode,
            },
        );

        Ok(ResourceLockHandle {
            lock,
            mode,
            manager_id: self.id,
            context,
            acquired_at: Instant::now(),
        })
    }

    /// Registers "most recently held lock -> `key`" with the detector.
    ///
    /// Returns true if an edge was registered for this acquisition.
    fn register_dependency(&self, key: LockKey, mode: LockMode, context: ContextId) -> Result<bool> {
        let Some(detector) = &self.detector else {
            return Ok(false);
        };
        let Some(held) = self.held.last(context) else {
            return Ok(false);
        };
        // Re-entrant shared acquisition cannot block.
        if held.key == key && held.mode == LockMode::Read && mode == LockMode::Read {
            return Ok(false);
        }
        let from = LockRef::new(held.key, held.order);
        let to = LockRef::new(key, key.id());
        match self.policy {
            DeadlockPolicy::Prevent => detector.check_dependency(from, to, context)?,
            DeadlockPolicy::Detect => detector.record_dependency(from, to, context)?,
            DeadlockPolicy::Off => return Ok(false),
        }
        Ok(true)
    }

    fn withdraw_dependency(&self, registered: bool, context: ContextId, key: LockKey) {
        if !registered || self.held.holds(context, key) {
            return;
        }
        if let Some(detector) = &self.detector {
            detector.release(context, key);
        }
    }

    /// Finds or creates the lock and takes a reference on it.
    fn retain(&self, op: &mut LockFreeOp, node: usize, resource_id: u64) -> Result<Arc<ResourceLock>> {
        if let Some(lock) = self.cache.lookup(node, resource_id) {
            if lock.try_retain(op)? {
                return Ok(lock);
            }
            self.cache.invalidate(node, resource_id);
        }

        let lock = {
            let mut table = self.table.lock();
            let lock = if let Some(lock) = table.get(&resource_id) {
                Arc::clone(lock)
            } else {
                table.try_reserve(1)?;
                let lock = Arc::new(ResourceLock::new(resource_id, node));
                table.insert(resource_id, Arc::clone(&lock));
                self.table_len.fetch_add(1, Ordering::Relaxed);
                self.counters.created.fetch_add(1, Ordering::Relaxed);
                if let Some(count) = self.counters.per_node_allocations.get(node) {
                    count.fetch_add(1, Ordering::Relaxed);
                }
                lock
            };
            // Reclamation also runs under the table lock, so a lock found
            // here cannot be concurrently marked reclaimed.
            if !lock.try_retain(op)? {
                return Err(Error::Busy(format!(
                    "lock for resource {resource_id} is being reclaimed"
                )));
            }
            lock
        };
        self.cache.insert(node, &lock);
        Ok(lock)
    }

    /// Returns whether the first attempt failed.
    fn lock_shared(lock: &ResourceLock, op: &mut LockFreeOp, wait: Wait<'_>) -> Result<bool> {
        let mut contended = false;
        loop {
            if lock.try_read_once(op) {
                return Ok(contended);
            }
            contended = true;
            if matches!(wait, Wait::Never) && !lock.admits_readers() {
                return Err(Error::Busy(format!(
                    "resource {} is held or awaited by a writer",
                    lock.resource_id()
                )));
            }
            if !op.should_retry() {
                return Err(op.exhausted_error().into());
            }
            op.backoff();
        }
    }

    /// Returns whether the first attempt failed.
    fn lock_exclusive(
        &self,
        lock: &ResourceLock,
        op: &mut LockFreeOp,
        wait: Wait<'_>,
        context: ContextId,
    ) -> Result<bool> {
        if lock.try_write_once(op) {
            return Ok(false);
        }
        let Wait::Until(cancel) = wait else {
            return Err(Error::Busy(format!(
                "resource {} is held",
                lock.resource_id()
            )));
        };

        self.wait_exclusive(lock, op, cancel, context).map(|()| true)
    }

    fn wait_exclusive(
        &self,
        lock: &ResourceLock,
        op: &mut LockFreeOp,
        cancel: Option<&CancellationToken>,
        context: ContextId,
    ) -> Result<()> {
        // Lock-free phase, bounded by the retry ceiling.
        while op.should_retry() {
            op.backoff();
            if lock.try_write_once(op) {
                return Ok(());
            }
            self.check_abandon(lock, cancel, context)?;
        }

        // Blocking phase. The announcement keeps new readers out.
        lock.announce_writer(op);
        loop {
            if let Err(err) = self.check_abandon(lock, cancel, context) {
                lock.withdraw_writer(op);
                return Err(err);
            }
            if lock.try_write_announced(op) {
                return Ok(());
            }
            lock.park(self.wait_slice);
        }
    }

    fn check_abandon(
        &self,
        lock: &ResourceLock,
        cancel: Option<&CancellationToken>,
        context: ContextId,
    ) -> Result<()> {
        if cancel.is_some_and(CancellationToken::is_cancelled) {
            return Err(Error::Interrupted(format!(
                "wait for resource {} cancelled",
                lock.resource_id()
            )));
        }
        if let Some(detector) = &self.detector {
            if detector.take_victim(context).is_some() {
                tracing::warn!(
                    resource_id = lock.resource_id(),
                    context = %context,
                    "Acquisition aborted to break a deadlock cycle"
                );
                return Err(Error::DeadlockVictim {
                    resource_id: lock.resource_id(),
                });
            }
        }
        Ok(())
    }

    /// Releases a lock obtained from this manager.
    pub fn release(&self, handle: ResourceLockHandle) -> Result<()> {
        if handle.manager_id != self.id {
            return Err(Error::InvalidHandle(format!(
                "handle for resource {} was issued by manager {}, not {}",
                handle.resource_id(),
                handle.manager_id,
                self.id
            )));
        }
        let ResourceLockHandle {
            lock,
            mode,
            context,
            acquired_at,
            ..
        } = handle;
        let key = LockKey::Resource(lock.resource_id());
        let mut op = LockFreeOp::new(
            match mode {
                LockMode::Read => "resource_read_release",
                LockMode::Write => "resource_write_release",
            },
            self.retry,
        )
        .on_node(lock.numa_node());

        match mode {
            LockMode::Read => lock.release_read(&mut op),
            LockMode::Write => lock.release_write(&mut op),
        }
        lock.record_hold(acquired_at.elapsed());
        self.untrack(context, key, mode);
        self.counters.releases.fetch_add(1, Ordering::Relaxed);
        self.counters.held.fetch_sub(1, Ordering::Relaxed);

        let remaining = lock.release_ref(&mut op);
        if remaining == 0 && self.table_len.load(Ordering::Relaxed) > self.retain_idle {
            self.try_reclaim(&lock, &mut op);
        }
        op.finish(&self.lock_free);
        Ok(())
    }

    fn try_reclaim(&self, lock: &Arc<ResourceLock>, op: &mut LockFreeOp) -> bool {
        let mut table = self.table.lock();
        if !lock.try_mark_reclaimed(op) {
            return false;
        }
        let resource_id = lock.resource_id();
        if table
            .get(&resource_id)
            .is_some_and(|current| Arc::ptr_eq(current, lock))
        {
            table.remove(&resource_id);
            self.table_len.fetch_sub(1, Ordering::Relaxed);
        }
        drop(table);
        self.cache.invalidate_all(resource_id);
        self.counters.reclaimed.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(resource_id, "Reclaimed idle resource lock");
        true
    }

    /// Removes every unreferenced lock from the table. Returns how many.
    pub fn reclaim_idle(&self) -> usize {
        let mut op = LockFreeOp::new("resource_reclaim", self.retry);
        let mut reclaimed = Vec::new();
        {
            let mut table = self.table.lock();
            table.retain(|id, lock| {
                if lock.try_mark_reclaimed(&mut op) {
                    reclaimed.push(*id);
                    false
                } else {
                    true
                }
            });
            self.table_len.store(table.len(), Ordering::Relaxed);
        }
        for id in &reclaimed {
            self.cache.invalidate_all(*id);
        }
        self.counters
            .reclaimed
            .fetch_add(reclaimed.len() as u64, Ordering::Relaxed);
        op.finish(&self.lock_free);
        if !reclaimed.is_empty() {
            tracing::debug!(count = reclaimed.len(), "Reclaimed idle resource locks");
        }
        reclaimed.len()
    }

    fn find(&self, resource_id: u64) -> Option<Arc<ResourceLock>> {
        self.table.lock().get(&resource_id).cloned()
    }

    /// Outstanding references on the lock of `resource_id` (0 if none).
    #[must_use]
    pub fn ref_count(&self, resource_id: u64) -> u32 {
        self.find(resource_id).map_or(0, |lock| lock.ref_count())
    }

    /// Diagnostic view of the lock of `resource_id`.
    #[must_use]
    pub fn inspect(&self, resource_id: u64) -> Option<ResourceLockInfo> {
        self.find(resource_id).map(|lock| lock.info())
    }

    /// Locks of this manager held by the calling thread, index writes
    /// included.
    #[must_use]
    pub fn held_by_current_context(&self) -> usize {
        self.held.count(ContextId::current())
    }

    /// Locks of this manager held by `context`.
    #[must_use]
    pub fn held_by(&self, context: ContextId) -> usize {
        self.held.count(context)
    }

    /// Lock structures currently in the table.
    #[must_use]
    pub fn len(&self) -> usize {
        self.table_len.load(Ordering::Relaxed)
    }

    /// True if no lock structure exists.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Shared lock-free counter sink.
    #[must_use]
    pub fn lock_free_counters(&self) -> &Arc<LockFreeCounters> {
        &self.lock_free
    }

    /// Counter snapshot.
    #[must_use]
    pub fn stats(&self) -> ManagerStats {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        ManagerStats {
            acquisitions: load(&self.counters.acquisitions),
            releases: load(&self.counters.releases),
            currently_held: load(&self.counters.held),
            contentions: load(&self.counters.contentions),
            busy: load(&self.counters.busy),
            interrupted: load(&self.counters.interrupted),
            refused: load(&self.counters.refused),
            victims: load(&self.counters.victims),
            locks_created: load(&self.counters.created),
            locks_reclaimed: load(&self.counters.reclaimed),
            live_locks: self.len() as u64,
            per_node_allocations: self
                .counters
                .per_node_allocations
                .iter()
                .map(load)
                .collect(),
            cache: self.cache.stats(),
        }
    }

    /// Clears the counters.
    ///
    /// Acquisitions restart from the number of locks currently held, so
    /// that `acquisitions == releases + currently_held` keeps holding.
    pub fn reset_stats(&self) {
        let held = self.counters.held.load(Ordering::Relaxed);
        self.counters.acquisitions.store(held, Ordering::Relaxed);
        self.counters.releases.store(0, Ordering::Relaxed);
        for counter in [
            &self.counters.contentions,
            &self.counters.busy,
            &self.counters.interrupted,
            &self.counters.refused,
            &self.counters.victims,
            &self.counters.created,
            &self.counters.reclaimed,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        for counter in &self.counters.per_node_allocations {
            counter.store(0, Ordering::Relaxed);
        }
        self.cache.reset_stats();
        for lock in self.table.lock().values() {
            lock.reset_stats();
        }
    }
}
