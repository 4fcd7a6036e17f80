//! Index synchronization: optimistic reads, exclusive writes.
//!
//! An [`IndexLock`] guards a shared index structure (a graph layer, a
//! posting list) with a sequence lock for readers plus a writer section:
//!
//! - Readers never block. They record the sequence number at begin and
//!   check at end whether a write overlapped; if so they retry.
//! - Writers are serialized, wait for readers already in flight, publish
//!   with an odd sequence number, and bump the generation exactly once per
//!   completed write.
//! - After publishing, a writer waits for a grace period: every reader
//!   that might have observed the pre-update state has finished.
//!
//! Readers are counted in two epoch slots so that a grace period only waits
//! for readers that started before it, never for new arrivals.

#[cfg(test)]
mod loom_tests;
#[cfg(test)]
mod tests;

use std::sync::atomic::{fence, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::{Mutex, MutexGuard};
use serde::Serialize;

use crate::cancel::CancellationToken;
use crate::config::RetryConfig;
use crate::context::ContextId;
use crate::error::{Error, Result};
use crate::lockfree::{Backoff, LockFreeCounters, LockFreeOp};
use crate::resource::LockManager;

static NEXT_INDEX_ID: AtomicU64 = AtomicU64::new(1);

/// Writer lock polling interval while a cancellable write waits.
const WRITER_POLL: Duration = Duration::from_millis(1);

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

#[derive(Debug, Default)]
struct IndexCounters {
    reads: AtomicU64,
    read_retries: AtomicU64,
    writes: AtomicU64,
    grace_waits: AtomicU64,
}

/// Index lock counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IndexLockStats {
    /// Lock id.
    pub id: u64,
    /// Completed writes.
    pub generation: u64,
    /// Readers currently inside a read section.
    pub active_readers: u64,
    /// Writers waiting for the writer section.
    pub writers_waiting: u64,
    /// Completed read sections.
    pub reads: u64,
    /// Read sections that observed a concurrent write.
    pub read_retries: u64,
    /// Completed writes since the last counter reset.
    pub writes: u64,
    /// Grace periods that had to wait for readers.
    pub grace_waits: u64,
    /// Wall-clock time of the last completed write, ms since the epoch.
    pub last_update_ms: u64,
}

/// Sequence lock plus reader tracking for one index structure.
#[derive(Debug)]
pub struct IndexLock {
    id: u64,
    /// Odd while a writer is publishing.
    sequence: AtomicU64,
    generation: AtomicU64,
    /// Low bit selects the reader slot new readers register in.
    epoch: AtomicU64,
    readers: [AtomicU64; 2],
    writers_waiting: AtomicU64,
    last_update_ms: AtomicU64,
    writer: Mutex<()>,
    /// Serializes grace periods so each one owns its epoch flip.
    grace: Mutex<()>,
    retry: RetryConfig,
    counters: IndexCounters,
    lock_free: Arc<LockFreeCounters>,
}

impl Default for IndexLock {
    fn default() -> Self {
        Self::new()
    }
}

impl IndexLock {
    /// Creates an index lock with default retry settings.
    #[must_use]
    pub fn new() -> Self {
        Self::with_parts(RetryConfig::default(), Arc::new(LockFreeCounters::new()))
    }

    /// Creates an index lock reporting into a shared counter sink.
    #[must_use]
    pub fn with_parts(retry: RetryConfig, lock_free: Arc<LockFreeCounters>) -> Self {
        Self {
            id: NEXT_INDEX_ID.fetch_add(1, Ordering::Relaxed),
            sequence: AtomicU64::new(0),
            generation: AtomicU64::new(0),
            epoch: AtomicU64::new(0),
            readers: [AtomicU64::new(0), AtomicU64::new(0)],
            writers_waiting: AtomicU64::new(0),
            last_update_ms: AtomicU64::new(unix_millis()),
            writer: Mutex::new(()),
            grace: Mutex::new(()),
            retry,
            counters: IndexCounters::default(),
            lock_free,
        }
    }

    /// Unique id, usable as the order of an index lock in the dependency graph.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Completed writes.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Readers currently inside a read section.
    #[must_use]
    pub fn active_readers(&self) -> u64 {
        self.readers[0].load(Ordering::SeqCst) + self.readers[1].load(Ordering::SeqCst)
    }

    /// True while a writer is publishing.
    #[must_use]
    pub fn is_writing(&self) -> bool {
        self.sequence.load(Ordering::Acquire) & 1 == 1
    }

    /// Wall-clock time of the last completed write, ms since the epoch.
    #[must_use]
    pub fn last_update_ms(&self) -> u64 {
        self.last_update_ms.load(Ordering::Relaxed)
    }

    /// Enters a read section. Never blocks.
    pub fn read_begin(&self) -> IndexReadGuard<'_> {
        let mut op = LockFreeOp::new("index_read_begin", self.retry);
        let slot = (self.epoch.load(Ordering::SeqCst) & 1) as usize;
        op.fetch_and_add(&self.readers[slot], 1);
        fence(Ordering::SeqCst);
        let sequence = self.sequence.load(Ordering::SeqCst);
        let generation = self.generation.load(Ordering::Acquire);
        op.finish(&self.lock_free);
        IndexReadGuard {
            lock: self,
            slot,
            sequence,
            generation,
            active: true,
        }
    }

    /// Leaves a read section. Returns true if no write overlapped it.
    pub fn read_end(&self, guard: IndexReadGuard<'_>) -> bool {
        guard.finish()
    }

    fn leave(&self, slot: usize) {
        let mut op = LockFreeOp::new("index_read_end", self.retry);
        op.fetch_and_add(&self.readers[slot], 1u64.wrapping_neg());
        op.finish(&self.lock_free);
    }

    /// Runs `f` inside read sections until one completes without an
    /// overlapping write.
    pub fn read<T>(&self, mut f: impl FnMut(&IndexReadGuard<'_>) -> T) -> T {
        let mut backoff = Backoff::new(&self.retry);
        loop {
            let guard = self.read_begin();
            if guard.writer_active() {
                drop(guard);
                self.counters.read_retries.fetch_add(1, Ordering::Relaxed);
            } else {
                let value = f(&guard);
                if guard.finish() {
                    return value;
                }
            }
            backoff.snooze();
        }
    }

    /// Enters the writer section, waiting as long as needed.
    pub fn write_begin(&self) -> IndexWriteToken<'_> {
        self.writers_waiting.fetch_add(1, Ordering::Relaxed);
        let section = self.writer.lock();
        self.writers_waiting.fetch_sub(1, Ordering::Relaxed);
        // Cannot be interrupted without a token.
        let _ = self.synchronize(None);
        self.publish_begin(section)
    }

    /// Enters the writer section unless `cancel` fires first.
    pub fn write_begin_with(&self, cancel: &CancellationToken) -> Result<IndexWriteToken<'_>> {
        self.write_begin_until(Some(cancel), || Ok(()))
    }

    /// Enters the writer section, polling `abandon` and `cancel` while the
    /// writer lock is taken. The first error ends the wait.
    pub(crate) fn write_begin_until(
        &self,
        cancel: Option<&CancellationToken>,
        mut abandon: impl FnMut() -> Result<()>,
    ) -> Result<IndexWriteToken<'_>> {
        self.writers_waiting.fetch_add(1, Ordering::Relaxed);
        let section = loop {
            let check = if cancel.is_some_and(CancellationToken::is_cancelled) {
                Err(Error::Interrupted(format!(
                    "write to index {} cancelled",
                    self.id
                )))
            } else {
                abandon()
            };
            if let Err(err) = check {
                self.writers_waiting.fetch_sub(1, Ordering::Relaxed);
                return Err(err);
            }
            if let Some(section) = self.writer.try_lock_for(WRITER_POLL) {
                break section;
            }
        };
        self.writers_waiting.fetch_sub(1, Ordering::Relaxed);
        self.synchronize(cancel)?;
        Ok(self.publish_begin(section))
    }

    fn publish_begin<'a>(&'a self, section: MutexGuard<'a, ()>) -> IndexWriteToken<'a> {
        let mut op = LockFreeOp::new("index_write_begin", self.retry);
        let previous = op.fetch_and_add(&self.sequence, 1);
        debug_assert_eq!(previous & 1, 0, "nested index write");
        // The odd sequence must be visible before any data the writer stores.
        fence(Ordering::Release);
        op.finish(&self.lock_free);
        IndexWriteToken {
            lock: self,
            section: Some(section),
            generation_before: self.generation.load(Ordering::Acquire),
            tracked: None,
        }
    }

    /// Completes a write. Returns the new generation.
    pub fn write_end(&self, mut token: IndexWriteToken<'_>) -> u64 {
        token.complete()
    }

    fn publish_end(&self, section: MutexGuard<'_, ()>) -> u64 {
        let mut op = LockFreeOp::new("index_write_end", self.retry);
        let generation = op.fetch_and_add(&self.generation, 1) + 1;
        self.last_update_ms.store(unix_millis(), Ordering::Relaxed);
        op.fetch_and_add(&self.sequence, 1);
        op.finish(&self.lock_free);
        drop(section);

        // Cannot be interrupted without a token.
        let _ = self.synchronize(None);
        self.counters.writes.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(index = self.id, generation, "Index write published");
        generation
    }

    /// Waits until every reader registered before this call has left.
    ///
    /// Spins with backoff up to the retry ceiling, then yields to the
    /// scheduler between polls.
    pub fn synchronize(&self, cancel: Option<&CancellationToken>) -> Result<()> {
        let _grace = self.grace.lock();
        let mut op = LockFreeOp::new("index_grace_period", self.retry);
        let slot = (op.fetch_and_add(&self.epoch, 1) & 1) as usize;
        fence(Ordering::SeqCst);

        let mut waited = false;
        while self.readers[slot].load(Ordering::SeqCst) != 0 {
            waited = true;
            if cancel.is_some_and(CancellationToken::is_cancelled) {
                op.finish(&self.lock_free);
                return Err(Error::Interrupted(format!(
                    "grace period of index {} cancelled",
                    self.id
                )));
            }
            if op.should_retry() {
                op.backoff();
            } else {
                std::thread::yield_now();
            }
        }
        if waited {
            self.counters.grace_waits.fetch_add(1, Ordering::Relaxed);
        }
        op.finish(&self.lock_free);
        Ok(())
    }

    /// Counter snapshot.
    #[must_use]
    pub fn stats(&self) -> IndexLockStats {
        IndexLockStats {
            id: self.id,
            generation: self.generation(),
            active_readers: self.active_readers(),
            writers_waiting: self.writers_waiting.load(Ordering::Relaxed),
            reads: self.counters.reads.load(Ordering::Relaxed),
            read_retries: self.counters.read_retries.load(Ordering::Relaxed),
            writes: self.counters.writes.load(Ordering::Relaxed),
            grace_waits: self.counters.grace_waits.load(Ordering::Relaxed),
            last_update_ms: self.last_update_ms(),
        }
    }

    /// Clears the read/write counters. Generation is never reset.
    pub fn reset_stats(&self) {
        self.counters.reads.store(0, Ordering::Relaxed);
        self.counters.read_retries.store(0, Ordering::Relaxed);
        self.counters.writes.store(0, Ordering::Relaxed);
        self.counters.grace_waits.store(0, Ordering::Relaxed);
    }
}

/// An open read section.
///
/// Dropping the guard leaves the section without validating it.
#[must_use = "a read section must be ended to learn whether it was consistent"]
#[derive(Debug)]
pub struct IndexReadGuard<'a> {
    lock: &'a IndexLock,
    slot: usize,
    sequence: u64,
    generation: u64,
    active: bool,
}

impl IndexReadGuard<'_> {
    /// Generation observed when the section began.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Sequence number observed when the section began.
    #[must_use]
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// True if a writer was publishing when the section began.
    #[must_use]
    pub fn writer_active(&self) -> bool {
        self.sequence & 1 == 1
    }

    /// True if the data read so far may be inconsistent.
    #[must_use]
    pub fn is_stale(&self) -> bool {
        fence(Ordering::Acquire);
        self.writer_active() || self.lock.sequence.load(Ordering::SeqCst) != self.sequence
    }

    fn finish(mut self) -> bool {
        let consistent = !self.is_stale();
        self.active = false;
        self.lock.leave(self.slot);
        if consistent {
            self.lock.counters.reads.fetch_add(1, Ordering::Relaxed);
        } else {
            self.lock
                .counters
                .read_retries
                .fetch_add(1, Ordering::Relaxed);
        }
        consistent
    }
}

impl Drop for IndexReadGuard<'_> {
    fn drop(&mut self) {
        if self.active {
            self.active = false;
            self.lock.leave(self.slot);
        }
    }
}

/// Exclusive write access to an index.
///
/// Dropping the token completes the write, as [`IndexLock::write_end`] does.
#[must_use = "dropping the token publishes the write immediately"]
#[derive(Debug)]
pub struct IndexWriteToken<'a> {
    lock: &'a IndexLock,
    section: Option<MutexGuard<'a, ()>>,
    generation_before: u64,
    /// Manager holding this write in the acquiring context's lock stack.
    tracked: Option<(&'a LockManager, ContextId)>,
}

impl<'a> IndexWriteToken<'a> {
    pub(crate) fn tracked_by(mut self, manager: &'a LockManager, context: ContextId) -> Self {
        self.tracked = Some((manager, context));
        self
    }

    /// Generation before this write.
    #[must_use]
    pub fn generation_before(&self) -> u64 {
        self.generation_before
    }

    /// Id of the index being written.
    #[must_use]
    pub fn index_id(&self) -> u64 {
        self.lock.id
    }

    fn complete(&mut self) -> u64 {
        let generation = match self.section.take() {
            Some(section) => self.lock.publish_end(section),
            None => self.lock.generation(),
        };
        if let Some((manager, context)) = self.tracked.take() {
            manager.end_index_write(self.lock.id, context);
        }
        generation
    }
}

impl Drop for IndexWriteToken<'_> {
    fn drop(&mut self) {
        self.complete();
    }
}
