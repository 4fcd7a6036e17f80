//! Cycle prevention, detection and resolution over the dependency graph.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use dashmap::DashMap;
use parking_lot::Mutex;
use rustc_hash::FxBuildHasher;
use serde::Serialize;

use super::graph::{DependencyGraph, NodeHandle, Reach};
use super::{LockKey, LockRef};
use crate::config::DeadlockConfig;
use crate::context::ContextId;
use crate::error::{Error, Result};

/// Phase of the detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum DetectorState {
    /// No check or scan in progress.
    Idle = 0,
    /// A dependency check or cycle search holds the graph.
    Checking = 1,
    /// A scan is breaking cycles.
    Resolving = 2,
}

impl DetectorState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Checking,
            2 => Self::Resolving,
            _ => Self::Idle,
        }
    }
}

/// A cycle found by [`DeadlockDetector::scan`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeadlockCycle {
    /// Locks on the cycle; the last one depends on the first.
    pub nodes: Vec<LockKey>,
    /// Number of edges on the cycle.
    pub length: usize,
    /// Resolution rank: lower values are resolved first.
    pub priority: usize,
    /// Edge removed to break the cycle, if it was still intact.
    pub broken_edge: Option<(LockKey, LockKey)>,
    #[serde(skip)]
    pub detected_at: Option<Instant>,
}

/// Outcome of one scan pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScanReport {
    /// Cycles found, in resolution order.
    pub cycles: Vec<DeadlockCycle>,
    /// Edges removed.
    pub edges_broken: usize,
    /// Blocked contexts told to abandon their acquisition.
    pub victims: Vec<ContextId>,
    /// Another scan was already running; nothing was done.
    pub skipped: bool,
    /// Pending edges merged before the search.
    pub drained: usize,
    /// Time spent holding the graph.
    #[serde(with = "duration_micros")]
    pub duration: Duration,
}

mod duration_micros {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(duration.as_micros()).unwrap_or(u64::MAX))
    }
}

/// Detector counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DetectorStats {
    /// Cycles found by scans.
    pub deadlocks_detected: u64,
    /// Dependencies refused because they would close a cycle.
    pub deadlocks_prevented: u64,
    /// Edges removed by cycle resolution.
    pub edges_broken: u64,
    /// Acquisitions aborted as deadlock victims.
    pub victims: u64,
    /// Dependencies queued while a scan held the graph.
    pub deferred_checks: u64,
    /// Reachability checks cut short by the depth bound.
    pub depth_limited: u64,
    /// Completed scans.
    pub scans: u64,
    /// Scans skipped because one was already running.
    pub scans_skipped: u64,
    /// Nodes currently in the graph.
    pub graph_nodes: u64,
    /// Edges currently in the graph.
    pub graph_edges: u64,
}

#[derive(Debug, Default)]
struct DetectorCounters {
    deadlocks_detected: AtomicU64,
    deadlocks_prevented: AtomicU64,
    edges_broken: AtomicU64,
    victims: AtomicU64,
    deferred_checks: AtomicU64,
    depth_limited: AtomicU64,
    scans: AtomicU64,
    scans_skipped: AtomicU64,
}

impl DetectorCounters {
    #[inline]
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn reset(&self) {
        for counter in [
            &self.deadlocks_detected,
            &self.deadlocks_prevented,
            &self.edges_broken,
            &self.victims,
            &self.deferred_checks,
            &self.depth_limited,
            &self.scans,
            &self.scans_skipped,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct PendingEdge {
    from: LockRef,
    to: LockRef,
    owner: ContextId,
}

/// Dependency tracker with cycle prevention and periodic cycle breaking.
///
/// Dependency checks are serialized on the graph mutex. While a scan owns
/// the graph, new dependencies are queued on a channel instead and merged
/// at the start of the next check, release or scan.
#[derive(Debug)]
pub struct DeadlockDetector {
    graph: Mutex<DependencyGraph>,
    state: AtomicU8,
    scanning: AtomicBool,
    pending_tx: Sender<PendingEdge>,
    pending_rx: Receiver<PendingEdge>,
    /// Lock each blocked context is waiting for.
    waiting: DashMap<ContextId, LockKey, FxBuildHasher>,
    /// Blocked contexts whose dependency was broken.
    victims: DashMap<ContextId, LockKey, FxBuildHasher>,
    max_depth: usize,
    max_cycles: usize,
    counters: DetectorCounters,
}

impl DeadlockDetector {
    /// Creates an empty detector bounded by `config`.
    #[must_use]
    pub fn new(config: &DeadlockConfig) -> Self {
        let (pending_tx, pending_rx) = crossbeam_channel::unbounded();
        Self {
            graph: Mutex::new(DependencyGraph::new()),
            state: AtomicU8::new(DetectorState::Idle as u8),
            scanning: AtomicBool::new(false),
            pending_tx,
            pending_rx,
            waiting: DashMap::with_hasher(FxBuildHasher),
            victims: DashMap::with_hasher(FxBuildHasher),
            max_depth: config.max_depth.max(1),
            max_cycles: config.max_cycles_per_scan.max(1),
            counters: DetectorCounters::default(),
        }
    }

    /// Current phase.
    #[must_use]
    pub fn state(&self) -> DetectorState {
        DetectorState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: DetectorState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Registers `from -> to` for `owner`, refusing it if `from` is
    /// reachable from `to`.
    ///
    /// A refused dependency leaves the graph untouched. A dependency on the
    /// lock itself is always refused.
    pub fn check_dependency(&self, from: LockRef, to: LockRef, owner: ContextId) -> Result<()> {
        if from.key == to.key {
            return Err(self.refuse(from.key, to.key, owner));
        }
        if self.defer(from, to, owner)? {
            return Ok(());
        }
        let mut graph = self.graph.lock();
        self.set_state(DetectorState::Checking);
        self.drain_pending(&mut graph);
        let result = self.check_locked(&mut graph, from, to, owner);
        self.set_state(DetectorState::Idle);
        result
    }

    /// Registers `from -> to` for `owner` without a cycle check.
    pub fn record_dependency(&self, from: LockRef, to: LockRef, owner: ContextId) -> Result<()> {
        if from.key == to.key {
            return Err(self.refuse(from.key, to.key, owner));
        }
        if self.defer(from, to, owner)? {
            return Ok(());
        }
        let mut graph = self.graph.lock();
        self.drain_pending(&mut graph);
        graph.insert_edge(from, to, owner)
    }

    /// Queues the edge if a scan currently owns the graph.
    fn defer(&self, from: LockRef, to: LockRef, owner: ContextId) -> Result<bool> {
        if !self.scanning.load(Ordering::Acquire) {
            return Ok(false);
        }
        self.pending_tx
            .send(PendingEdge { from, to, owner })
            .map_err(|_| Error::Init("dependency queue disconnected".to_string()))?;
        DetectorCounters::bump(&self.counters.deferred_checks);
        Ok(true)
    }

    fn check_locked(
        &self,
        graph: &mut DependencyGraph,
        from: LockRef,
        to: LockRef,
        owner: ContextId,
    ) -> Result<()> {
        if let (Some(f), Some(t)) = (graph.handle_of(from.key), graph.handle_of(to.key)) {
            if !graph.has_edge(f, t) {
                match graph.reaches(t, f, self.max_depth) {
                    Reach::Found => return Err(self.refuse(from.key, to.key, owner)),
                    Reach::DepthLimited => {
                        DetectorCounters::bump(&self.counters.depth_limited);
                    }
                    Reach::NotFound => {}
                }
            }
        }
        graph.insert_edge(from, to, owner)
    }

    fn refuse(&self, from: LockKey, to: LockKey, owner: ContextId) -> Error {
        DetectorCounters::bump(&self.counters.deadlocks_prevented);
        tracing::warn!(
            %from,
            %to,
            context = %owner,
            "Refusing lock dependency that would close a cycle"
        );
        Error::WouldDeadlock { from, to }
    }

    fn drain_pending(&self, graph: &mut DependencyGraph) -> usize {
        let mut drained = 0;
        while let Ok(edge) = self.pending_rx.try_recv() {
            drained += 1;
            if let Err(err) = graph.insert_edge(edge.from, edge.to, edge.owner) {
                tracing::warn!(
                    from = %edge.from.key,
                    to = %edge.to.key,
                    error = %err,
                    "Dropping deferred lock dependency"
                );
            }
        }
        drained
    }

    /// Withdraws `owner` from every dependency touching `key`.
    ///
    /// Returns the number of edges removed.
    pub fn release(&self, owner: ContextId, key: LockKey) -> usize {
        let mut graph = self.graph.lock();
        self.drain_pending(&mut graph);
        graph.release_owner(owner, key)
    }

    /// Records that `context` is blocked acquiring `key`.
    pub fn mark_waiting(&self, context: ContextId, key: LockKey) {
        self.waiting.insert(context, key);
    }

    /// Clears the blocked marker and any victim flag of `context`.
    pub fn clear_waiting(&self, context: ContextId) {
        self.waiting.remove(&context);
        self.victims.remove(&context);
    }

    /// Consumes the victim flag of `context`, if set.
    #[must_use]
    pub fn take_victim(&self, context: ContextId) -> Option<LockKey> {
        let (_, key) = self.victims.remove(&context)?;
        DetectorCounters::bump(&self.counters.victims);
        Some(key)
    }

    /// Finds and breaks cycles. Only one scan runs at a time; a concurrent
    /// call returns a report with `skipped` set.
    pub fn scan(&self) -> ScanReport {
        if self
            .scanning
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            DetectorCounters::bump(&self.counters.scans_skipped);
            return ScanReport {
                skipped: true,
                ..ScanReport::default()
            };
        }

        let started = Instant::now();
        let mut report = {
            let mut graph = self.graph.lock();
            self.set_state(DetectorState::Checking);
            let drained = self.drain_pending(&mut graph);
            let found = graph.find_cycles(self.max_depth, self.max_cycles);
            let mut report = ScanReport {
                drained,
                ..ScanReport::default()
            };
            if !found.is_empty() {
                self.set_state(DetectorState::Resolving);
                self.resolve(&mut graph, found, &mut report);
            }
            self.set_state(DetectorState::Idle);
            report
        };
        self.scanning.store(false, Ordering::Release);

        report.duration = started.elapsed();
        DetectorCounters::bump(&self.counters.scans);
        if report.cycles.is_empty() {
            tracing::trace!(drained = report.drained, "Deadlock scan found no cycles");
        } else {
            tracing::info!(
                cycles = report.cycles.len(),
                edges_broken = report.edges_broken,
                victims = report.victims.len(),
                "Deadlock scan resolved cycles"
            );
        }
        report
    }

    fn resolve(
        &self,
        graph: &mut DependencyGraph,
        mut found: Vec<Vec<NodeHandle>>,
        report: &mut ScanReport,
    ) {
        // Shorter cycles first: they involve fewer contexts.
        found.sort_by_key(Vec::len);
        let detected_at = Instant::now();

        for (priority, cycle) in found.into_iter().enumerate() {
            let pairs: Vec<(NodeHandle, NodeHandle)> = cycle
                .iter()
                .zip(cycle.iter().cycle().skip(1))
                .map(|(a, b)| (*a, *b))
                .collect();
            let mut entry = DeadlockCycle {
                nodes: graph.keys(&cycle),
                length: cycle.len(),
                priority,
                broken_edge: None,
                detected_at: Some(detected_at),
            };
            // An earlier resolution may already have broken this one.
            if pairs.iter().any(|(a, b)| !graph.has_edge(*a, *b)) {
                report.cycles.push(entry);
                continue;
            }
            DetectorCounters::bump(&self.counters.deadlocks_detected);

            let Some((from, to)) = Self::select_edge(graph, &pairs) else {
                report.cycles.push(entry);
                continue;
            };
            let keys = (
                graph.node(from).map(|n| n.key),
                graph.node(to).map(|n| n.key),
            );
            if let (Some(edge), (Some(from_key), Some(to_key))) = (graph.remove_edge(from, to), keys)
            {
                DetectorCounters::bump(&self.counters.edges_broken);
                report.edges_broken += 1;
                entry.broken_edge = Some((from_key, to_key));
                for owner in edge.owners {
                    let blocked_on_target = self
                        .waiting
                        .get(&owner)
                        .is_some_and(|waiting| *waiting.value() == to_key);
                    if blocked_on_target {
                        self.victims.insert(owner, to_key);
                        report.victims.push(owner);
                    }
                }
                tracing::warn!(
                    cycle = ?entry.nodes,
                    broken_from = %from_key,
                    broken_to = %to_key,
                    "Deadlock cycle broken"
                );
            }
            report.cycles.push(entry);
        }
    }

    /// Picks the edge with the largest lock-order distance; ties go to the
    /// heavier edge, then to the newer one.
    fn select_edge(
        graph: &DependencyGraph,
        pairs: &[(NodeHandle, NodeHandle)],
    ) -> Option<(NodeHandle, NodeHandle)> {
        pairs
            .iter()
            .filter_map(|&(a, b)| {
                let edge = graph.edge(a, b)?;
                let distance = graph.node(a)?.order.abs_diff(graph.node(b)?.order);
                Some(((distance, edge.weight, edge.created_at), (a, b)))
            })
            .max_by(|x, y| x.0.cmp(&y.0))
            .map(|(_, pair)| pair)
    }

    /// Cycles currently in the graph, without resolving them.
    #[must_use]
    pub fn detect_cycles(&self) -> Vec<Vec<LockKey>> {
        let graph = self.graph.lock();
        graph
            .find_cycles(self.max_depth, self.max_cycles)
            .iter()
            .map(|cycle| graph.keys(cycle))
            .collect()
    }

    /// True if the dependency `from -> to` is registered.
    #[must_use]
    pub fn has_dependency(&self, from: LockKey, to: LockKey) -> bool {
        self.graph.lock().has_key_edge(from, to)
    }

    /// Nodes and edges currently in the graph.
    #[must_use]
    pub fn graph_size(&self) -> (usize, usize) {
        let graph = self.graph.lock();
        (graph.node_count(), graph.edge_count())
    }

    /// Holds or releases the scan flag without scanning.
    #[cfg(test)]
    pub(crate) fn set_scanning(&self, scanning: bool) {
        self.scanning.store(scanning, Ordering::Release);
    }

    /// Dependencies queued behind a running scan.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending_rx.len()
    }

    /// Counter snapshot.
    #[must_use]
    pub fn stats(&self) -> DetectorStats {
        let (nodes, edges) = self.graph_size();
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        DetectorStats {
            deadlocks_detected: load(&self.counters.deadlocks_detected),
            deadlocks_prevented: load(&self.counters.deadlocks_prevented),
            edges_broken: load(&self.counters.edges_broken),
            victims: load(&self.counters.victims),
            deferred_checks: load(&self.counters.deferred_checks),
            depth_limited: load(&self.counters.depth_limited),
            scans: load(&self.counters.scans),
            scans_skipped: load(&self.counters.scans_skipped),
            graph_nodes: nodes as u64,
            graph_edges: edges as u64,
        }
    }

    /// Clears the counters. The graph itself is kept.
    pub fn reset_stats(&self) {
        self.counters.reset();
    }
}
