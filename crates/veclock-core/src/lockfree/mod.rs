//! Lock-free primitive layer.
//!
//! Wraps the three single-word atomic operations used by every other layer
//! (compare-and-swap, fetch-and-add, exchange) with per-operation accounting
//! and a bounded retry/backoff state machine.
//!
//! # Retry Contract
//!
//! [`LockFreeOp::should_retry`] returns `false` once the configured ceiling
//! is exceeded. Every caller must then leave the lock-free path (fall back to
//! blocking or report `Busy`); no lock-free loop in this crate spins without
//! consulting it.
//!
//! ```rust
//! use std::sync::atomic::AtomicU64;
//! use veclock_core::config::RetryConfig;
//! use veclock_core::lockfree::{LockFreeCounters, LockFreeOp};
//!
//! let counters = LockFreeCounters::new();
//! let word = AtomicU64::new(5);
//! let mut op = LockFreeOp::new("doc_example", RetryConfig::default());
//! let previous = op.update(&word, |v| Some(v * 2));
//! assert_eq!(previous, Ok(5));
//! op.finish(&counters);
//! assert_eq!(counters.snapshot().successes, 1);
//! ```

mod backoff;

#[cfg(test)]
mod tests;

pub use backoff::{pause, Backoff, PauseKind, SPIN_THRESHOLD, YIELD_THRESHOLD};

use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use serde::Serialize;

use crate::config::RetryConfig;

/// A machine word that supports the three lock-free primitives.
///
/// Implemented for the native atomic integer types so the retry wrapper is
/// written once, independent of the word width.
pub trait AtomicWord: Send + Sync {
    /// Plain value stored in the word.
    type Value: Copy + Eq + fmt::Debug;

    /// Loads the current value (acquire).
    fn load_word(&self) -> Self::Value;

    /// Stores `new` if the word equals `current` (acq-rel on success).
    fn compare_exchange_word(
        &self,
        current: Self::Value,
        new: Self::Value,
    ) -> Result<Self::Value, Self::Value>;

    /// Wrapping add, returning the previous value (acq-rel).
    fn fetch_add_word(&self, delta: Self::Value) -> Self::Value;

    /// Unconditional store, returning the previous value (acq-rel).
    fn swap_word(&self, new: Self::Value) -> Self::Value;
}

macro_rules! impl_atomic_word {
    ($atomic:ty, $value:ty) => {
        impl AtomicWord for $atomic {
            type Value = $value;

            #[inline]
            fn load_word(&self) -> $value {
                self.load(Ordering::Acquire)
            }

            #[inline]
            fn compare_exchange_word(&self, current: $value, new: $value) -> Result<$value, $value> {
                self.compare_exchange(current, new, Ordering::AcqRel, Ordering::Acquire)
            }

            #[inline]
            fn fetch_add_word(&self, delta: $value) -> $value {
                self.fetch_add(delta, Ordering::AcqRel)
            }

            #[inline]
            fn swap_word(&self, new: $value) -> $value {
                self.swap(new, Ordering::AcqRel)
            }
        }
    };
}

impl_atomic_word!(AtomicU32, u32);
impl_atomic_word!(AtomicU64, u64);
impl_atomic_word!(AtomicUsize, usize);
impl_atomic_word!(AtomicI64, i64);

/// Signal that a lock-free loop ran out of retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryExhausted {
    /// Operation identifier of the exhausted loop.
    pub op: &'static str,
    /// Attempts made before giving up.
    pub attempts: u32,
}

impl fmt::Display for RetryExhausted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} exhausted its retry budget after {} attempts",
            self.op, self.attempts
        )
    }
}

impl From<RetryExhausted> for crate::error::Error {
    fn from(err: RetryExhausted) -> Self {
        Self::Busy(err.to_string())
    }
}

/// Per-call-site bookkeeping for one lock-free operation.
///
/// Created at the start of the operation and folded into a
/// [`LockFreeCounters`] sink with [`finish`](Self::finish) at its end.
#[derive(Debug, Clone)]
pub struct LockFreeOp {
    op: &'static str,
    node: usize,
    max_retries: u32,
    retries: u32,
    attempts: u32,
    successes: u32,
    failures: u32,
    contentions: u32,
    exhausted: bool,
    backoff: Backoff,
}

impl LockFreeOp {
    /// Starts a new operation context.
    #[must_use]
    pub fn new(op: &'static str, policy: RetryConfig) -> Self {
        Self {
            op,
            node: 0,
            max_retries: policy.max_retries,
            retries: 0,
            attempts: 0,
            successes: 0,
            failures: 0,
            contentions: 0,
            exhausted: false,
            backoff: Backoff::new(&policy),
        }
    }

    /// Records the NUMA node the operation originates from.
    #[must_use]
    pub fn on_node(mut self, node: usize) -> Self {
        self.node = node;
        self
    }

    /// Single compare-and-swap attempt. Returns true if `new` was stored.
    pub fn compare_and_swap<A: AtomicWord>(
        &mut self,
        target: &A,
        expected: A::Value,
        new: A::Value,
    ) -> bool {
        self.attempts += 1;
        if target.compare_exchange_word(expected, new).is_ok() {
            self.successes += 1;
            true
        } else {
            self.failures += 1;
            self.contentions += 1;
            false
        }
    }

    /// Atomic wrapping add. Returns the previous value.
    pub fn fetch_and_add<A: AtomicWord>(&mut self, target: &A, delta: A::Value) -> A::Value {
        self.attempts += 1;
        self.successes += 1;
        target.fetch_add_word(delta)
    }

    /// Atomic exchange. Returns the previous value.
    pub fn exchange<A: AtomicWord>(&mut self, target: &A, new: A::Value) -> A::Value {
        self.attempts += 1;
        self.successes += 1;
        target.swap_word(new)
    }

    /// Counts a retry and reports whether the ceiling still allows one.
    pub fn should_retry(&mut self) -> bool {
        self.retries = self.retries.saturating_add(1);
        if self.retries > self.max_retries {
            if !self.exhausted {
                tracing::debug!(
                    op = self.op,
                    node = self.node,
                    attempts = self.attempts,
                    "lock-free retry ceiling reached"
                );
            }
            self.exhausted = true;
            false
        } else {
            true
        }
    }

    /// Waits for the next backoff delay and returns how it was spent.
    pub fn backoff(&mut self) -> PauseKind {
        self.backoff.snooze()
    }

    /// Computes the next backoff delay without waiting.
    pub fn next_delay(&mut self) -> Duration {
        self.backoff.next_delay()
    }

    /// Read-modify-write loop bounded by the retry ceiling.
    ///
    /// `f` maps the current value to the desired one, or `None` when the
    /// update cannot be applied yet (for example a writer holds the lock);
    /// both a `None` and a lost race consume a retry. Returns the value that
    /// was replaced.
    pub fn update<A, F>(&mut self, target: &A, mut f: F) -> Result<A::Value, RetryExhausted>
    where
        A: AtomicWord,
        F: FnMut(A::Value) -> Option<A::Value>,
    {
        loop {
            let current = target.load_word();
            if let Some(new) = f(current) {
                if self.compare_and_swap(target, current, new) {
                    return Ok(current);
                }
            } else {
                self.contentions += 1;
            }
            if !self.should_retry() {
                return Err(self.exhausted_error());
            }
            self.backoff();
        }
    }

    /// Builds the exhaustion signal for this operation.
    #[must_use]
    pub fn exhausted_error(&self) -> RetryExhausted {
        RetryExhausted {
            op: self.op,
            attempts: self.attempts,
        }
    }

    /// Operation identifier.
    #[must_use]
    pub fn op(&self) -> &'static str {
        self.op
    }

    /// Originating NUMA node.
    #[must_use]
    pub fn node(&self) -> usize {
        self.node
    }

    /// Retries counted so far.
    #[must_use]
    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Primitive calls made so far.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Successful primitive calls.
    #[must_use]
    pub fn successes(&self) -> u32 {
        self.successes
    }

    /// Failed compare-and-swap calls.
    #[must_use]
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Observed contention events.
    #[must_use]
    pub fn contentions(&self) -> u32 {
        self.contentions
    }

    /// True once `should_retry` has refused.
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    /// Folds this operation's counters into `sink`.
    pub fn finish(self, sink: &LockFreeCounters) {
        sink.absorb(&self);
    }
}

/// Aggregated lock-free counters, shared by every operation of a subsystem.
#[derive(Debug, Default)]
pub struct LockFreeCounters {
    attempts: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    contentions: AtomicU64,
    retries: AtomicU64,
    exhausted: AtomicU64,
}

impl LockFreeCounters {
    /// Creates a zeroed counter set.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            attempts: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            contentions: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            exhausted: AtomicU64::new(0),
        }
    }

    fn absorb(&self, op: &LockFreeOp) {
        if op.attempts == 0 && op.retries == 0 {
            return;
        }
        self.attempts
            .fetch_add(u64::from(op.attempts), Ordering::Relaxed);
        self.successes
            .fetch_add(u64::from(op.successes), Ordering::Relaxed);
        self.failures
            .fetch_add(u64::from(op.failures), Ordering::Relaxed);
        self.contentions
            .fetch_add(u64::from(op.contentions), Ordering::Relaxed);
        self.retries
            .fetch_add(u64::from(op.retries), Ordering::Relaxed);
        if op.exhausted {
            self.exhausted.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Returns a snapshot of all counters.
    #[must_use]
    pub fn snapshot(&self) -> LockFreeStats {
        LockFreeStats {
            attempts: self.attempts.load(Ordering::Relaxed),
            successes: self.successes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            contentions: self.contentions.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            exhausted: self.exhausted.load(Ordering::Relaxed),
        }
    }

    /// Clears all counters.
    pub fn reset(&self) {
        self.attempts.store(0, Ordering::Relaxed);
        self.successes.store(0, Ordering::Relaxed);
        self.failures.store(0, Ordering::Relaxed);
        self.contentions.store(0, Ordering::Relaxed);
        self.retries.store(0, Ordering::Relaxed);
        self.exhausted.store(0, Ordering::Relaxed);
    }
}

/// Immutable snapshot of [`LockFreeCounters`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LockFreeStats {
    /// Primitive calls.
    pub attempts: u64,
    /// Successful primitive calls.
    pub successes: u64,
    /// Failed compare-and-swap calls.
    pub failures: u64,
    /// Contention events (lost races and blocked preconditions).
    pub contentions: u64,
    /// Retries requested through `should_retry`.
    pub retries: u64,
    /// Operations that exhausted the retry ceiling.
    pub exhausted: u64,
}
