//! Arena-backed lock dependency graph.
//!
//! Nodes live in a slot vector addressed by [`NodeHandle`]; freed slots are
//! recycled through a free list. A node exists only while at least one edge
//! touches it. Every allocation goes through `try_reserve` so that memory
//! exhaustion surfaces as [`Error::OutOfMemory`] with the graph unchanged.

use std::time::Instant;

use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use super::{LockKey, LockRef};
use crate::context::ContextId;
use crate::error::{Error, Result};

/// Index of a node slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct NodeHandle(u32);

impl NodeHandle {
    fn index(self) -> usize {
        self.0 as usize
    }
}

/// Directed dependency `node -> to`.
#[derive(Debug, Clone)]
pub(crate) struct DependencyEdge {
    pub to: NodeHandle,
    /// Contexts that registered this dependency and have not released it.
    pub owners: SmallVec<[ContextId; 2]>,
    pub created_at: Instant,
    /// Number of registrations, including repeats by the same context.
    pub weight: u32,
}

#[derive(Debug, Clone)]
pub(crate) struct DependencyNode {
    pub key: LockKey,
    pub order: u64,
    /// Context whose registration created the node.
    pub owner: ContextId,
    pub created_at: Instant,
    pub outgoing: SmallVec<[DependencyEdge; 4]>,
    pub incoming: SmallVec<[NodeHandle; 4]>,
}

/// Result of a bounded reachability query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Reach {
    Found,
    NotFound,
    /// Not found, but the depth bound cut at least one path short.
    DepthLimited,
}

fn oom(what: &str) -> Error {
    Error::OutOfMemory(format!("dependency graph {what}"))
}

#[derive(Debug, Default)]
pub(crate) struct DependencyGraph {
    slots: Vec<Option<DependencyNode>>,
    free: Vec<u32>,
    index: FxHashMap<LockKey, NodeHandle>,
    edges: usize,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node_count(&self) -> usize {
        self.index.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges
    }

    pub fn handle_of(&self, key: LockKey) -> Option<NodeHandle> {
        self.index.get(&key).copied()
    }

    pub fn node(&self, handle: NodeHandle) -> Option<&DependencyNode> {
        self.slots.get(handle.index()).and_then(Option::as_ref)
    }

    fn node_mut(&mut self, handle: NodeHandle) -> Option<&mut DependencyNode> {
        self.slots.get_mut(handle.index()).and_then(Option::as_mut)
    }

    fn outgoing(&self, handle: NodeHandle) -> &[DependencyEdge] {
        self.node(handle).map_or(&[], |node| node.outgoing.as_slice())
    }

    pub fn edge(&self, from: NodeHandle, to: NodeHandle) -> Option<&DependencyEdge> {
        self.outgoing(from).iter().find(|edge| edge.to == to)
    }

    pub fn has_edge(&self, from: NodeHandle, to: NodeHandle) -> bool {
        self.edge(from, to).is_some()
    }

    /// True if an edge `from -> to` exists between the two keys.
    pub fn has_key_edge(&self, from: LockKey, to: LockKey) -> bool {
        match (self.handle_of(from), self.handle_of(to)) {
            (Some(f), Some(t)) => self.has_edge(f, t),
            _ => false,
        }
    }

    fn ensure_node(&mut self, lock: LockRef, owner: ContextId) -> Result<NodeHandle> {
        if let Some(handle) = self.handle_of(lock.key) {
            return Ok(handle);
        }
        self.index.try_reserve(1).map_err(|_| oom("index"))?;
        let node = DependencyNode {
            key: lock.key,
            order: lock.order,
            owner,
            created_at: Instant::now(),
            outgoing: SmallVec::new(),
            incoming: SmallVec::new(),
        };
        let handle = if let Some(slot) = self.free.pop() {
            self.slots[slot as usize] = Some(node);
            NodeHandle(slot)
        } else {
            let slot = u32::try_from(self.slots.len()).map_err(|_| oom("slot space"))?;
            self.slots.try_reserve(1).map_err(|_| oom("node"))?;
            self.slots.push(Some(node));
            NodeHandle(slot)
        };
        self.index.insert(lock.key, handle);
        Ok(handle)
    }

    /// Inserts `from -> to`, or bumps the weight of an existing edge.
    ///
    /// On failure nothing created by this call survives.
    pub fn insert_edge(&mut self, from: LockRef, to: LockRef, owner: ContextId) -> Result<()> {
        let f = self.ensure_node(from, owner)?;
        let t = match self.ensure_node(to, owner) {
            Ok(t) => t,
            Err(err) => {
                self.collect(f);
                return Err(err);
            }
        };
        if let Err(err) = self.link(f, t, owner) {
            self.collect(f);
            self.collect(t);
            return Err(err);
        }
        Ok(())
    }

    fn link(&mut self, f: NodeHandle, t: NodeHandle, owner: ContextId) -> Result<()> {
        let Some(from_node) = self.node_mut(f) else {
            return Err(oom("dangling handle"));
        };
        if let Some(edge) = from_node.outgoing.iter_mut().find(|edge| edge.to == t) {
            edge.weight = edge.weight.saturating_add(1);
            if !edge.owners.contains(&owner) {
                edge.owners.try_reserve(1).map_err(|_| oom("edge owner"))?;
                edge.owners.push(owner);
            }
            return Ok(());
        }
        from_node.outgoing.try_reserve(1).map_err(|_| oom("edge"))?;

        // Reserve the back-reference before publishing the edge.
        let Some(to_node) = self.node_mut(t) else {
            return Err(oom("dangling handle"));
        };
        to_node.incoming.try_reserve(1).map_err(|_| oom("edge"))?;
        to_node.incoming.push(f);

        let mut owners = SmallVec::new();
        owners.push(owner);
        if let Some(from_node) = self.node_mut(f) {
            from_node.outgoing.push(DependencyEdge {
                to: t,
                owners,
                created_at: Instant::now(),
                weight: 1,
            });
        }
        self.edges += 1;
        Ok(())
    }

    /// Removes `from -> to` and returns it.
    pub fn remove_edge(&mut self, from: NodeHandle, to: NodeHandle) -> Option<DependencyEdge> {
        let node = self.node_mut(from)?;
        let pos = node.outgoing.iter().position(|edge| edge.to == to)?;
        let edge = node.outgoing.remove(pos);
        if let Some(target) = self.node_mut(to) {
            if let Some(back) = target.incoming.iter().position(|h| *h == from) {
                target.incoming.swap_remove(back);
            }
        }
        self.edges -= 1;
        self.collect(from);
        self.collect(to);
        Some(edge)
    }

    /// Withdraws `owner` from every edge touching `key`. Edges left without
    /// owners are removed. Returns the number of edges removed.
    pub fn release_owner(&mut self, owner: ContextId, key: LockKey) -> usize {
        let Some(handle) = self.handle_of(key) else {
            return 0;
        };
        let mut pairs: SmallVec<[(NodeHandle, NodeHandle); 8]> = SmallVec::new();
        if let Some(node) = self.node(handle) {
            pairs.extend(node.outgoing.iter().map(|edge| (handle, edge.to)));
            pairs.extend(node.incoming.iter().map(|from| (*from, handle)));
        }

        let mut removed = 0;
        for (from, to) in pairs {
            let orphaned = self.node_mut(from).is_some_and(|node| {
                node.outgoing
                    .iter_mut()
                    .find(|edge| edge.to == to)
                    .is_some_and(|edge| {
                        edge.owners.retain(|o| *o != owner);
                        edge.owners.is_empty()
                    })
            });
            if orphaned && self.remove_edge(from, to).is_some() {
                removed += 1;
            }
        }
        removed
    }

    /// Frees the node if no edge touches it any more.
    fn collect(&mut self, handle: NodeHandle) {
        let unused = self
            .node(handle)
            .is_some_and(|node| node.outgoing.is_empty() && node.incoming.is_empty());
        if !unused {
            return;
        }
        if let Some(node) = self.slots[handle.index()].take() {
            self.index.remove(&node.key);
            self.free.push(handle.0);
        }
    }

    /// Depth-bounded DFS: is `target` reachable from `start`?
    pub fn reaches(&self, start: NodeHandle, target: NodeHandle, max_depth: usize) -> Reach {
        if start == target {
            return Reach::Found;
        }
        let mut visited = vec![false; self.slots.len()];
        let mut stack: Vec<(NodeHandle, usize)> = vec![(start, 0)];
        let mut cut = false;
        visited[start.index()] = true;

        while let Some((current, depth)) = stack.pop() {
            for edge in self.outgoing(current) {
                if edge.to == target {
                    return Reach::Found;
                }
                if visited[edge.to.index()] {
                    continue;
                }
                if depth + 1 >= max_depth {
                    cut = true;
                    continue;
                }
                visited[edge.to.index()] = true;
                stack.push((edge.to, depth + 1));
            }
        }
        if cut {
            Reach::DepthLimited
        } else {
            Reach::NotFound
        }
    }

    /// Enumerates up to `max_cycles` cycles with white/gray/black colouring.
    ///
    /// Each cycle is returned as the node sequence `n0 -> n1 -> ... -> nk`,
    /// closed by the edge `nk -> n0`, starting at its smallest handle.
    /// Paths longer than `max_depth` are not explored. A node whose subtree
    /// was cut by the depth limit is not finished: it turns white again
    /// after the current root, so a later root can reach it at a shallower
    /// depth.
    pub fn find_cycles(&self, max_depth: usize, max_cycles: usize) -> Vec<Vec<NodeHandle>> {
        const WHITE: u8 = 0;
        const GRAY: u8 = 1;
        const BLACK: u8 = 2;

        let mut cycles: Vec<Vec<NodeHandle>> = Vec::new();
        if max_cycles == 0 {
            return cycles;
        }
        let mut color = vec![WHITE; self.slots.len()];
        let mut unfinished: Vec<NodeHandle> = Vec::new();
        let roots: Vec<NodeHandle> = {
            let mut roots: Vec<NodeHandle> = self.index.values().copied().collect();
            roots.sort_unstable();
            roots
        };

        for root in roots {
            if color[root.index()] != WHITE {
                continue;
            }
            color[root.index()] = GRAY;
            // (node, index of the next outgoing edge to follow, subtree cut)
            let mut stack: Vec<(NodeHandle, usize, bool)> = vec![(root, 0, false)];

            while let Some(&(current, next, cut)) = stack.last() {
                let outgoing = self.outgoing(current);
                let too_deep = stack.len() > max_depth;
                if too_deep || next >= outgoing.len() {
                    color[current.index()] = BLACK;
                    stack.pop();
                    if too_deep || cut {
                        unfinished.push(current);
                        if let Some(parent) = stack.last_mut() {
                            parent.2 = true;
                        }
                    }
                    continue;
                }
                if let Some(top) = stack.last_mut() {
                    top.1 += 1;
                }
                let to = outgoing[next].to;
                match color[to.index()] {
                    WHITE => {
                        color[to.index()] = GRAY;
                        stack.push((to, 0, false));
                    }
                    GRAY => {
                        if let Some(start) = stack.iter().position(|(h, _, _)| *h == to) {
                            let mut cycle: Vec<NodeHandle> =
                                stack[start..].iter().map(|(h, _, _)| *h).collect();
                            let min = cycle
                                .iter()
                                .enumerate()
                                .min_by_key(|(_, h)| **h)
                                .map_or(0, |(pos, _)| pos);
                            cycle.rotate_left(min);
                            if !cycles.contains(&cycle) {
                                cycles.push(cycle);
                                if cycles.len() >= max_cycles {
                                    return cycles;
                                }
                            }
                        }
                    }
                    _ => {}
                }
            }

            for handle in unfinished.drain(..) {
                color[handle.index()] = WHITE;
            }
        }
        cycles
    }

    /// Keys of the given handles, in order.
    pub fn keys(&self, handles: &[NodeHandle]) -> Vec<LockKey> {
        handles
            .iter()
            .filter_map(|h| self.node(*h).map(|node| node.key))
            .collect()
    }
}
