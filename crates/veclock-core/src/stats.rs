//! Aggregated statistics of a [`LockCore`](crate::LockCore).

use std::fmt::Write;

use serde::Serialize;

use crate::deadlock::DetectorStats;
use crate::index_sync::IndexLockStats;
use crate::lockfree::LockFreeStats;
use crate::resource::ManagerStats;

/// Point-in-time counters of every layer.
///
/// `acquisitions == releases + currently_held` holds for every snapshot,
/// including after [`LockCore::reset_stats`](crate::LockCore::reset_stats).
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StatsSnapshot {
    /// Granted resource lock acquisitions.
    pub acquisitions: u64,
    /// Resource lock releases.
    pub releases: u64,
    /// Resource locks currently held.
    pub currently_held: u64,
    /// Acquisitions that did not succeed on the first attempt.
    pub contentions: u64,
    /// Acquisitions that failed with `Busy`.
    pub busy: u64,
    /// Acquisitions cancelled by their caller.
    pub interrupted: u64,
    /// Cycles found by deadlock scans.
    pub deadlocks_detected: u64,
    /// Dependencies refused because they would close a cycle.
    pub deadlocks_prevented: u64,
    /// Acquisitions aborted as deadlock victims.
    pub deadlock_victims: u64,
    /// Dependency edges removed to break cycles.
    pub edges_broken: u64,
    /// Dependencies queued while a scan held the graph.
    pub deferred_checks: u64,
    /// Node cache hits.
    pub cache_hits: u64,
    /// Node cache misses.
    pub cache_misses: u64,
    /// `cache_hits / (cache_hits + cache_misses)`.
    pub cache_hit_rate: f64,
    /// Lock structures created per NUMA node.
    pub per_node_allocations: Vec<u64>,
    /// Lock structures currently alive.
    pub live_locks: u64,
    /// Lock structures reclaimed.
    pub locks_reclaimed: u64,
    /// Dependency graph size.
    pub graph_nodes: u64,
    /// Dependency graph size.
    pub graph_edges: u64,
    /// Index locks alive.
    pub index_locks: u64,
    /// Completed index read sections.
    pub index_reads: u64,
    /// Index read sections that overlapped a write.
    pub index_read_retries: u64,
    /// Completed index writes.
    pub index_writes: u64,
    /// Lock-free primitive counters.
    pub lock_free: LockFreeStats,
}

impl StatsSnapshot {
    pub(crate) fn collect(
        manager: &ManagerStats,
        detector: &DetectorStats,
        indexes: &[IndexLockStats],
        lock_free: LockFreeStats,
    ) -> Self {
        Self {
            acquisitions: manager.acquisitions,
            releases: manager.releases,
            currently_held: manager.currently_held,
            contentions: manager.contentions,
            busy: manager.busy,
            interrupted: manager.interrupted,
            deadlocks_detected: detector.deadlocks_detected,
            deadlocks_prevented: detector.deadlocks_prevented,
            deadlock_victims: manager.victims,
            edges_broken: detector.edges_broken,
            deferred_checks: detector.deferred_checks,
            cache_hits: manager.cache.hits,
            cache_misses: manager.cache.misses,
            cache_hit_rate: manager.cache.hit_rate(),
            per_node_allocations: manager.per_node_allocations.clone(),
            live_locks: manager.live_locks,
            locks_reclaimed: manager.locks_reclaimed,
            graph_nodes: detector.graph_nodes,
            graph_edges: detector.graph_edges,
            index_locks: indexes.len() as u64,
            index_reads: indexes.iter().map(|s| s.reads).sum(),
            index_read_retries: indexes.iter().map(|s| s.read_retries).sum(),
            index_writes: indexes.iter().map(|s| s.writes).sum(),
            lock_free,
        }
    }

    /// Renders the snapshot in the Prometheus text exposition format.
    #[must_use]
    pub fn to_prometheus(&self) -> String {
        let mut output = String::new();

        counter(
            &mut output,
            "veclock_acquisitions_total",
            "Granted resource lock acquisitions",
            self.acquisitions,
        );
        counter(
            &mut output,
            "veclock_releases_total",
            "Resource lock releases",
            self.releases,
        );
        gauge(
            &mut output,
            "veclock_locks_held",
            "Resource locks currently held",
            self.currently_held,
        );

        output.push_str("# HELP veclock_acquisition_failures_total Failed acquisitions by reason\n");
        output.push_str("# TYPE veclock_acquisition_failures_total counter\n");
        for (reason, value) in [
            ("busy", self.busy),
            ("interrupted", self.interrupted),
            ("would_deadlock", self.deadlocks_prevented),
            ("deadlock_victim", self.deadlock_victims),
        ] {
            let _ = writeln!(
                output,
                "veclock_acquisition_failures_total{{reason=\"{reason}\"}} {value}"
            );
        }
        output.push('\n');

        counter(
            &mut output,
            "veclock_contentions_total",
            "Acquisitions that did not succeed on the first attempt",
            self.contentions,
        );
        counter(
            &mut output,
            "veclock_deadlocks_detected_total",
            "Dependency cycles found by background scans",
            self.deadlocks_detected,
        );
        counter(
            &mut output,
            "veclock_deadlock_edges_broken_total",
            "Dependency edges removed to break cycles",
            self.edges_broken,
        );
        counter(
            &mut output,
            "veclock_deferred_checks_total",
            "Dependency checks queued behind a running scan",
            self.deferred_checks,
        );

        output.push_str("# HELP veclock_cache_lookups_total Node cache lookups by result\n");
        output.push_str("# TYPE veclock_cache_lookups_total counter\n");
        let _ = writeln!(
            output,
            "veclock_cache_lookups_total{{result=\"hit\"}} {}",
            self.cache_hits
        );
        let _ = writeln!(
            output,
            "veclock_cache_lookups_total{{result=\"miss\"}} {}\n",
            self.cache_misses
        );

        output.push_str("# HELP veclock_node_allocations_total Lock structures created per NUMA node\n");
        output.push_str("# TYPE veclock_node_allocations_total counter\n");
        for (node, value) in self.per_node_allocations.iter().enumerate() {
            let _ = writeln!(
                output,
                "veclock_node_allocations_total{{node=\"{node}\"}} {value}"
            );
        }
        output.push('\n');

        gauge(
            &mut output,
            "veclock_live_locks",
            "Resource lock structures alive",
            self.live_locks,
        );
        gauge(
            &mut output,
            "veclock_dependency_graph_edges",
            "Edges in the lock dependency graph",
            self.graph_edges,
        );
        counter(
            &mut output,
            "veclock_index_reads_total",
            "Completed index read sections",
            self.index_reads,
        );
        counter(
            &mut output,
            "veclock_index_read_retries_total",
            "Index read sections that overlapped a write",
            self.index_read_retries,
        );
        counter(
            &mut output,
            "veclock_index_writes_total",
            "Completed index writes",
            self.index_writes,
        );
        counter(
            &mut output,
            "veclock_lockfree_retries_total",
            "Retries of lock-free primitives",
            self.lock_free.retries,
        );
        counter(
            &mut output,
            "veclock_lockfree_exhausted_total",
            "Lock-free operations that hit the retry ceiling",
            self.lock_free.exhausted,
        );

        output
    }
}

fn counter(output: &mut String, name: &str, help: &str, value: u64) {
    metric(output, name, help, "counter", value);
}

fn gauge(output: &mut String, name: &str, help: &str, value: u64) {
    metric(output, name, help, "gauge", value);
}

fn metric(output: &mut String, name: &str, help: &str, kind: &str, value: u64) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} {kind}");
    let _ = writeln!(output, "{name} {value}\n");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prometheus_export_contains_help_and_type() {
        let snapshot = StatsSnapshot {
            acquisitions: 10,
            releases: 7,
            currently_held: 3,
            busy: 2,
            per_node_allocations: vec![4, 1],
            ..StatsSnapshot::default()
        };
        let output = snapshot.to_prometheus();

        assert!(output.contains("# HELP veclock_acquisitions_total"));
        assert!(output.contains("# TYPE veclock_locks_held gauge"));
        assert!(output.contains("veclock_acquisitions_total 10"));
        assert!(output.contains("veclock_locks_held 3"));
        assert!(output.contains("veclock_acquisition_failures_total{reason=\"busy\"} 2"));
        assert!(output.contains("veclock_node_allocations_total{node=\"1\"} 1"));
    }

    #[test]
    fn test_snapshot_serializes_to_json() {
        let snapshot = StatsSnapshot {
            deadlocks_detected: 1,
            ..StatsSnapshot::default()
        };
        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["deadlocks_detected"], 1);
        assert_eq!(json["lock_free"]["retries"], 0);
    }
}
