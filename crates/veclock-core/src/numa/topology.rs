//! Mapping from execution contexts to memory nodes.

use std::cell::Cell;
use std::fmt;

use crate::context::ContextId;

/// Source of NUMA placement information.
///
/// The locking core never asks the operating system directly; embedders
/// with real topology data implement this trait, everything else uses
/// [`StaticTopology`].
pub trait Topology: Send + Sync + fmt::Debug {
    /// Number of memory nodes. Always at least 1.
    fn node_count(&self) -> usize;

    /// Node of the calling context, in `0..node_count()`.
    fn current_node(&self) -> usize;
}

thread_local! {
    static PINNED_NODE: Cell<Option<usize>> = const { Cell::new(None) };
}

/// Pins the calling thread to `node` for every [`StaticTopology`].
///
/// Values at or above the topology's node count wrap around.
pub fn pin_current_thread(node: usize) {
    PINNED_NODE.with(|pinned| pinned.set(Some(node)));
}

/// Removes a pin set by [`pin_current_thread`].
pub fn unpin_current_thread() {
    PINNED_NODE.with(|pinned| pinned.set(None));
}

/// Fixed node count; contexts are spread round-robin by id unless pinned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaticTopology {
    nodes: usize,
}

impl StaticTopology {
    /// Creates a topology with `nodes` memory nodes (0 is treated as 1).
    #[must_use]
    pub fn new(nodes: usize) -> Self {
        Self {
            nodes: nodes.max(1),
        }
    }

    /// Single-node topology.
    #[must_use]
    pub fn uniform() -> Self {
        Self::new(1)
    }
}

impl Default for StaticTopology {
    fn default() -> Self {
        Self::uniform()
    }
}

impl Topology for StaticTopology {
    fn node_count(&self) -> usize {
        self.nodes
    }

    fn current_node(&self) -> usize {
        if self.nodes == 1 {
            return 0;
        }
        if let Some(node) = PINNED_NODE.with(Cell::get) {
            return node % self.nodes;
        }
        // Reason: the remainder is < nodes, which is a usize
        #[allow(clippy::cast_possible_truncation)]
        let node = (ContextId::current().as_u64() % self.nodes as u64) as usize;
        node
    }
}
