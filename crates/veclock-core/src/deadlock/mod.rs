//! Deadlock prevention and detection.
//!
//! Lock dependencies ("a context holding A requests B") are kept in a
//! directed graph. Under [`DeadlockPolicy::Prevent`](crate::config::DeadlockPolicy)
//! an edge that would close a cycle is refused before it is inserted; under
//! `Detect` edges are recorded unchecked and a periodic scan breaks the
//! cycles it finds.
//!
//! # Lock ordering
//!
//! Every lock carries a numeric order. When a cycle must be broken, the edge
//! whose endpoints are furthest apart in that order is removed, so that the
//! remaining edges stay close to a total order.

mod detector;
mod graph;
mod scanner;

#[cfg(test)]
mod tests;

pub use detector::{
    DeadlockCycle, DeadlockDetector, DetectorState, DetectorStats, ScanReport,
};
pub use scanner::DeadlockScanner;

use std::fmt;

use serde::Serialize;

/// Identity of a lock in the dependency graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(tag = "kind", content = "id", rename_all = "lowercase")]
pub enum LockKey {
    /// Per-resource lock.
    Resource(u64),
    /// Index synchronization lock.
    Index(u64),
    /// Lock owned by the embedder, registered through the public API.
    External(u64),
}

impl LockKey {
    /// Numeric id, without the kind.
    #[must_use]
    pub const fn id(self) -> u64 {
        match self {
            Self::Resource(id) | Self::Index(id) | Self::External(id) => id,
        }
    }
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Resource(id) => write!(f, "resource:{id}"),
            Self::Index(id) => write!(f, "index:{id}"),
            Self::External(id) => write!(f, "external:{id}"),
        }
    }
}

/// A lock together with its position in the global lock order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct LockRef {
    /// Lock identity.
    pub key: LockKey,
    /// Order used by cycle resolution.
    pub order: u64,
}

impl LockRef {
    /// Creates a reference with an explicit order.
    #[must_use]
    pub const fn new(key: LockKey, order: u64) -> Self {
        Self { key, order }
    }

    /// Resource lock; ordered by resource id.
    #[must_use]
    pub const fn resource(resource_id: u64) -> Self {
        Self::new(LockKey::Resource(resource_id), resource_id)
    }
}
