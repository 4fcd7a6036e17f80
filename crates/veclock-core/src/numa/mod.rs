//! NUMA-aware placement of lock structures.
//!
//! Each execution context is attributed to a memory node through a
//! [`Topology`]. Lock structures are allocated on, and cached per, the node
//! of the context that first creates them; a cache hit requires that the
//! cached lock actually lives on the requesting context's node.

mod cache;
mod topology;

#[cfg(test)]
mod tests;

pub use cache::{CacheStats, NumaLockCache};
pub use topology::{pin_current_thread, unpin_current_thread, StaticTopology, Topology};
