//! Execution-context identity and the per-context held-lock stacks.
//!
//! Every thread that touches the locking core gets a stable [`ContextId`].
//! Locks granted through a [`LockManager`](crate::resource::LockManager) are
//! pushed on a per-context stack owned by the manager, so that it knows,
//! before granting another lock, which lock the context already holds.

use std::cell::Cell;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use rustc_hash::FxBuildHasher;
use serde::Serialize;
use smallvec::SmallVec;

use crate::deadlock::LockKey;
use crate::resource::LockMode;

static NEXT_CONTEXT: AtomicU64 = AtomicU64::new(1);

/// Identifier of an execution context (one per OS thread).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct ContextId(u64);

impl ContextId {
    /// Returns the identifier of the calling thread, assigning one on first use.
    #[must_use]
    pub fn current() -> Self {
        CONTEXT_ID.with(|id| {
            let value = id.get();
            if value != 0 {
                return Self(value);
            }
            let fresh = NEXT_CONTEXT.fetch_add(1, Ordering::Relaxed);
            id.set(fresh);
            Self(fresh)
        })
    }

    /// Builds an identifier from a raw value.
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw numeric value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx#{}", self.0)
    }
}

/// A lock currently held by a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct HeldLock {
    pub key: LockKey,
    pub order: u64,
    pub mode: LockMode,
}

thread_local! {
    static CONTEXT_ID: Cell<u64> = const { Cell::new(0) };
}

/// Locks held per context, most recent last.
///
/// Keyed by the acquiring context rather than by the calling thread, so a
/// handle released on another thread still clears the acquirer's entry.
#[derive(Debug, Default)]
pub(crate) struct HeldLocks {
    stacks: DashMap<ContextId, SmallVec<[HeldLock; 4]>, FxBuildHasher>,
}

impl HeldLocks {
    pub(crate) fn new() -> Self {
        Self {
            stacks: DashMap::with_hasher(FxBuildHasher),
        }
    }

    /// Records that `context` now holds `lock`.
    pub(crate) fn push(&self, context: ContextId, lock: HeldLock) {
        self.stacks.entry(context).or_default().push(lock);
    }

    /// Forgets the most recent matching entry of `context`. Returns false
    /// if none matched.
    pub(crate) fn remove(&self, context: ContextId, key: LockKey, mode: LockMode) -> bool {
        let removed = {
            let Some(mut stack) = self.stacks.get_mut(&context) else {
                return false;
            };
            match stack.iter().rposition(|h| h.key == key && h.mode == mode) {
                Some(pos) => {
                    stack.remove(pos);
                    true
                }
                None => false,
            }
        };
        self.stacks.remove_if(&context, |_, stack| stack.is_empty());
        removed
    }

    /// Most recently acquired lock still held by `context`.
    pub(crate) fn last(&self, context: ContextId) -> Option<HeldLock> {
        self.stacks
            .get(&context)
            .and_then(|stack| stack.last().copied())
    }

    /// True if `context` holds `key` in any mode.
    pub(crate) fn holds(&self, context: ContextId, key: LockKey) -> bool {
        self.stacks
            .get(&context)
            .is_some_and(|stack| stack.iter().any(|h| h.key == key))
    }

    /// Number of locks held by `context`.
    pub(crate) fn count(&self, context: ContextId) -> usize {
        self.stacks.get(&context).map_or(0, |stack| stack.len())
    }
}
