//! Per-resource reader/writer lock structure.
//!
//! The whole lock state lives in one 64-bit word:
//!
//! ```text
//! bit 63       writer held
//! bits 32..63  writers announced as blocked
//! bits 0..32   active reader count
//! ```
//!
//! Writer-held and readers > 0 can therefore never be observed together;
//! every transition is a single atomic operation on that word. A writer that
//! exhausts its lock-free attempts announces itself before parking; while
//! any writer is announced, new readers are turned away so the reader count
//! drains and the writer gets in.

use std::sync::atomic::{fence, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::Serialize;

use crate::lockfree::{LockFreeOp, RetryExhausted};

const WRITER: u64 = 1 << 63;
const PENDING_UNIT: u64 = 1 << 32;
const PENDING_MASK: u64 = 0x7FFF_FFFF << 32;
const READER_MASK: u64 = 0xFFFF_FFFF;

/// Reference count value of a lock removed from the global table.
pub(crate) const RECLAIMED: u32 = u32::MAX;

/// Reader/writer lock guarding one resource.
#[derive(Debug)]
pub struct ResourceLock {
    resource_id: u64,
    numa_node: usize,
    created_at: Instant,
    state: AtomicU64,
    refs: AtomicU32,
    waiters: AtomicU32,
    parking: Mutex<()>,
    wakeup: Condvar,
    acquisitions: AtomicU64,
    contentions: AtomicU64,
    wait_ns: AtomicU64,
    hold_ns: AtomicU64,
}

/// Per-lock counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ResourceLockStats {
    /// Successful acquisitions.
    pub acquisitions: u64,
    /// Acquisitions that did not succeed on the first attempt.
    pub contentions: u64,
    /// Total time spent acquiring, in nanoseconds.
    pub wait_ns: u64,
    /// Total time held, in nanoseconds.
    pub hold_ns: u64,
}

/// Point-in-time view of a lock, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ResourceLockInfo {
    /// Guarded resource.
    pub resource_id: u64,
    /// Node the structure was allocated for.
    pub numa_node: usize,
    /// Exclusive holder present.
    pub writer_held: bool,
    /// Shared holders.
    pub readers: u32,
    /// Writers parked waiting for the lock.
    pub pending_writers: u32,
    /// Outstanding references (holders plus in-flight acquirers).
    pub ref_count: u32,
    /// Counters.
    pub stats: ResourceLockStats,
}

fn pending_of(state: u64) -> u32 {
    // Reason: masked to 31 bits
    #[allow(clippy::cast_possible_truncation)]
    let pending = ((state & PENDING_MASK) >> 32) as u32;
    pending
}

fn saturating_nanos(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
}

impl ResourceLock {
    pub(crate) fn new(resource_id: u64, numa_node: usize) -> Self {
        Self {
            resource_id,
            numa_node,
            created_at: Instant::now(),
            state: AtomicU64::new(0),
            refs: AtomicU32::new(0),
            waiters: AtomicU32::new(0),
            parking: Mutex::new(()),
            wakeup: Condvar::new(),
            acquisitions: AtomicU64::new(0),
            contentions: AtomicU64::new(0),
            wait_ns: AtomicU64::new(0),
            hold_ns: AtomicU64::new(0),
        }
    }

    /// Guarded resource.
    #[must_use]
    pub fn resource_id(&self) -> u64 {
        self.resource_id
    }

    /// Memory node the structure was allocated for.
    #[must_use]
    pub fn numa_node(&self) -> usize {
        self.numa_node
    }

    /// Time since the structure was created.
    #[must_use]
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// True while an exclusive holder exists.
    #[must_use]
    pub fn is_write_locked(&self) -> bool {
        self.state.load(Ordering::Acquire) & WRITER != 0
    }

    /// Number of shared holders.
    #[must_use]
    pub fn reader_count(&self) -> u32 {
        // Reason: masked to 32 bits
        #[allow(clippy::cast_possible_truncation)]
        let readers = (self.state.load(Ordering::Acquire) & READER_MASK) as u32;
        readers
    }

    /// Outstanding references; 0 once reclaimed.
    #[must_use]
    pub fn ref_count(&self) -> u32 {
        match self.refs.load(Ordering::Acquire) {
            RECLAIMED => 0,
            refs => refs,
        }
    }

    /// True once the lock has been removed from its table.
    #[must_use]
    pub fn is_reclaimed(&self) -> bool {
        self.refs.load(Ordering::Acquire) == RECLAIMED
    }

    /// Writers announced as blocked on this lock.
    #[must_use]
    pub fn pending_writers(&self) -> u32 {
        pending_of(self.state.load(Ordering::Acquire))
    }

    /// True if neither a writer nor a reader holds the lock.
    fn is_free(&self) -> bool {
        self.state.load(Ordering::Acquire) & (WRITER | READER_MASK) == 0
    }

    /// True if a shared request could currently be granted.
    pub(crate) fn admits_readers(&self) -> bool {
        self.state.load(Ordering::Acquire) & (WRITER | PENDING_MASK) == 0
    }

    /// One shared-acquire attempt. Fails if a writer holds or waits for the
    /// lock, or the compare-and-swap lost a race.
    pub(crate) fn try_read_once(&self, op: &mut LockFreeOp) -> bool {
        let current = self.state.load(Ordering::Acquire);
        if current & (WRITER | PENDING_MASK) != 0 || current & READER_MASK == READER_MASK {
            return false;
        }
        op.compare_and_swap(&self.state, current, current + 1)
    }

    /// One exclusive-acquire attempt by a writer that has not announced
    /// itself (free to writer-held).
    pub(crate) fn try_write_once(&self, op: &mut LockFreeOp) -> bool {
        let current = self.state.load(Ordering::Acquire);
        if current & (WRITER | READER_MASK) != 0 {
            return false;
        }
        op.compare_and_swap(&self.state, current, current | WRITER)
    }

    /// Registers the caller as a blocked writer. New readers are refused
    /// until it acquires or withdraws.
    pub(crate) fn announce_writer(&self, op: &mut LockFreeOp) {
        let previous = op.fetch_and_add(&self.state, PENDING_UNIT);
        debug_assert!(previous & PENDING_MASK != PENDING_MASK, "pending writer overflow");
    }

    /// Withdraws an announcement made by [`announce_writer`](Self::announce_writer).
    pub(crate) fn withdraw_writer(&self, op: &mut LockFreeOp) {
        let previous = op.fetch_and_add(&self.state, PENDING_UNIT.wrapping_neg());
        debug_assert!(previous & PENDING_MASK != 0, "withdraw without announcement");
    }

    /// One exclusive-acquire attempt by an announced writer. On success the
    /// announcement is consumed.
    pub(crate) fn try_write_announced(&self, op: &mut LockFreeOp) -> bool {
        let current = self.state.load(Ordering::Acquire);
        if current & (WRITER | READER_MASK) != 0 {
            return false;
        }
        debug_assert!(current & PENDING_MASK != 0, "writer was not announced");
        op.compare_and_swap(&self.state, current, (current - PENDING_UNIT) | WRITER)
    }

    /// Drops one shared holder, waking parked writers after the last one.
    pub(crate) fn release_read(&self, op: &mut LockFreeOp) {
        let previous = op.fetch_and_add(&self.state, 1u64.wrapping_neg());
        debug_assert!(previous & READER_MASK > 0, "shared release without holder");
        if previous & READER_MASK == 1 {
            self.wake_waiters();
        }
    }

    /// Clears the writer bit and wakes parked writers.
    ///
    /// Announced writers may change the word concurrently, so the bit is
    /// cleared by subtraction rather than by storing zero.
    pub(crate) fn release_write(&self, op: &mut LockFreeOp) {
        let previous = op.fetch_and_add(&self.state, WRITER.wrapping_neg());
        debug_assert!(
            previous & WRITER != 0 && previous & READER_MASK == 0,
            "exclusive release without holder"
        );
        self.wake_waiters();
    }

    fn wake_waiters(&self) {
        fence(Ordering::SeqCst);
        if self.waiters.load(Ordering::SeqCst) > 0 {
            let _parking = self.parking.lock();
            self.wakeup.notify_all();
        }
    }

    /// Parks the caller for at most `slice`, unless no one holds the lock.
    pub(crate) fn park(&self, slice: Duration) {
        self.waiters.fetch_add(1, Ordering::SeqCst);
        fence(Ordering::SeqCst);
        {
            let mut parking = self.parking.lock();
            if !self.is_free() {
                self.wakeup.wait_for(&mut parking, slice);
            }
        }
        self.waiters.fetch_sub(1, Ordering::SeqCst);
    }

    /// Takes a reference unless the lock was reclaimed.
    pub(crate) fn try_retain(&self, op: &mut LockFreeOp) -> Result<bool, RetryExhausted> {
        loop {
            let refs = self.refs.load(Ordering::Acquire);
            if refs == RECLAIMED {
                return Ok(false);
            }
            if refs < RECLAIMED - 1 && op.compare_and_swap(&self.refs, refs, refs + 1) {
                return Ok(true);
            }
            if !op.should_retry() {
                return Err(op.exhausted_error());
            }
            op.backoff();
        }
    }

    /// Drops a reference. Returns the remaining count.
    pub(crate) fn release_ref(&self, op: &mut LockFreeOp) -> u32 {
        let previous = op.fetch_and_add(&self.refs, 1u32.wrapping_neg());
        debug_assert!(previous > 0 && previous != RECLAIMED, "unbalanced release_ref");
        previous.wrapping_sub(1)
    }

    /// Marks an unreferenced lock as reclaimed. Fails if any reference exists.
    pub(crate) fn try_mark_reclaimed(&self, op: &mut LockFreeOp) -> bool {
        op.compare_and_swap(&self.refs, 0, RECLAIMED)
    }

    pub(crate) fn record_acquired(&self, waited: Duration, contended: bool) {
        self.acquisitions.fetch_add(1, Ordering::Relaxed);
        if contended {
            self.contentions.fetch_add(1, Ordering::Relaxed);
        }
        self.wait_ns
            .fetch_add(saturating_nanos(waited), Ordering::Relaxed);
    }

    pub(crate) fn record_hold(&self, held: Duration) {
        self.hold_ns
            .fetch_add(saturating_nanos(held), Ordering::Relaxed);
    }

    /// Counter snapshot.
    #[must_use]
    pub fn stats(&self) -> ResourceLockStats {
        ResourceLockStats {
            acquisitions: self.acquisitions.load(Ordering::Relaxed),
            contentions: self.contentions.load(Ordering::Relaxed),
            wait_ns: self.wait_ns.load(Ordering::Relaxed),
            hold_ns: self.hold_ns.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn reset_stats(&self) {
        self.acquisitions.store(0, Ordering::Relaxed);
        self.contentions.store(0, Ordering::Relaxed);
        self.wait_ns.store(0, Ordering::Relaxed);
        self.hold_ns.store(0, Ordering::Relaxed);
    }

    /// Diagnostic view built from a single load of the state word.
    #[must_use]
    pub fn info(&self) -> ResourceLockInfo {
        let state = self.state.load(Ordering::Acquire);
        // Reason: masked to 32 bits
        #[allow(clippy::cast_possible_truncation)]
        let readers = (state & READER_MASK) as u32;
        ResourceLockInfo {
            resource_id: self.resource_id,
            numa_node: self.numa_node,
            writer_held: state & WRITER != 0,
            readers,
            pending_writers: pending_of(state),
            ref_count: self.ref_count(),
            stats: self.stats(),
        }
    }
}
