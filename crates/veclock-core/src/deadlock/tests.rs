//! Tests for the dependency graph and the deadlock detector.

use super::graph::{DependencyGraph, Reach};
use super::*;
use crate::config::DeadlockConfig;
use crate::context::ContextId;
use crate::error::Error;

fn r(id: u64) -> LockRef {
    LockRef::resource(id)
}

fn ctx(raw: u64) -> ContextId {
    ContextId::from_raw(1_000_000 + raw)
}

fn detector() -> DeadlockDetector {
    DeadlockDetector::new(&DeadlockConfig::default())
}

// -------------------------------------------------------------------------
// Graph
// -------------------------------------------------------------------------

#[test]
fn test_graph_repeated_registration_bumps_weight() {
    let mut graph = DependencyGraph::new();
    graph.insert_edge(r(1), r(2), ctx(1)).unwrap();
    graph.insert_edge(r(1), r(2), ctx(1)).unwrap();
    graph.insert_edge(r(1), r(2), ctx(2)).unwrap();

    assert_eq!(graph.edge_count(), 1);
    let from = graph.handle_of(LockKey::Resource(1)).unwrap();
    let to = graph.handle_of(LockKey::Resource(2)).unwrap();
    let edge = graph.edge(from, to).unwrap();
    assert_eq!(edge.weight, 3);
    assert_eq!(edge.owners.len(), 2);
}

#[test]
fn test_graph_release_owner_collects_nodes() {
    let mut graph = DependencyGraph::new();
    graph.insert_edge(r(1), r(2), ctx(1)).unwrap();
    graph.insert_edge(r(2), r(3), ctx(1)).unwrap();
    graph.insert_edge(r(1), r(2), ctx(2)).unwrap();
    assert_eq!(graph.node_count(), 3);

    // ctx(2) still owns 1 -> 2
    assert_eq!(graph.release_owner(ctx(1), LockKey::Resource(2)), 1);
    assert_eq!(graph.edge_count(), 1);
    assert_eq!(graph.node_count(), 2);

    assert_eq!(graph.release_owner(ctx(2), LockKey::Resource(1)), 1);
    assert_eq!(graph.edge_count(), 0);
    assert_eq!(graph.node_count(), 0);
}

#[test]
fn test_graph_slots_are_recycled() {
    let mut graph = DependencyGraph::new();
    graph.insert_edge(r(1), r(2), ctx(1)).unwrap();
    graph.release_owner(ctx(1), LockKey::Resource(1));
    graph.insert_edge(r(3), r(4), ctx(1)).unwrap();

    let handles = [
        graph.handle_of(LockKey::Resource(3)).unwrap(),
        graph.handle_of(LockKey::Resource(4)).unwrap(),
    ];
    assert_eq!(
        graph.keys(&handles),
        vec![LockKey::Resource(3), LockKey::Resource(4)]
    );
    assert!(graph.handle_of(LockKey::Resource(1)).is_none());
}

#[test]
fn test_graph_reaches_respects_depth_bound() {
    let mut graph = DependencyGraph::new();
    for id in 1..5 {
        graph.insert_edge(r(id), r(id + 1), ctx(1)).unwrap();
    }
    let first = graph.handle_of(LockKey::Resource(1)).unwrap();
    let last = graph.handle_of(LockKey::Resource(5)).unwrap();

    assert_eq!(graph.reaches(first, last, 32), Reach::Found);
    assert_eq!(graph.reaches(first, last, 2), Reach::DepthLimited);
    assert_eq!(graph.reaches(last, first, 32), Reach::NotFound);
}

#[test]
fn test_graph_find_cycles_is_bounded() {
    let mut graph = DependencyGraph::new();
    // Two disjoint 2-cycles
    graph.insert_edge(r(1), r(2), ctx(1)).unwrap();
    graph.insert_edge(r(2), r(1), ctx(2)).unwrap();
    graph.insert_edge(r(3), r(4), ctx(3)).unwrap();
    graph.insert_edge(r(4), r(3), ctx(4)).unwrap();

    assert_eq!(graph.find_cycles(32, 16).len(), 2);
    assert_eq!(graph.find_cycles(32, 1).len(), 1);
    assert!(graph.find_cycles(32, 0).is_empty());
}

#[test]
fn test_graph_cycle_past_depth_cut_found_from_later_root() {
    let mut graph = DependencyGraph::new();
    // 1 -> 2 -> 3 -> 4 <-> 5: from root 1 the cycle starts past depth 3
    for id in 1..5 {
        graph.insert_edge(r(id), r(id + 1), ctx(1)).unwrap();
    }
    graph.insert_edge(r(5), r(4), ctx(2)).unwrap();

    let cycles = graph.find_cycles(3, 16);
    assert_eq!(cycles.len(), 1);
    let mut keys = graph.keys(&cycles[0]);
    keys.sort();
    assert_eq!(keys, vec![LockKey::Resource(4), LockKey::Resource(5)]);

    assert_eq!(graph.find_cycles(32, 16).len(), 1, "a cycle is reported once");
}

// -------------------------------------------------------------------------
// Prevention
// -------------------------------------------------------------------------

#[test]
fn test_chain_then_closing_edge_is_refused() {
    let detector = detector();
    detector.check_dependency(r(1), r(2), ctx(1)).unwrap();
    detector.check_dependency(r(2), r(3), ctx(2)).unwrap();

    let err = detector.check_dependency(r(3), r(1), ctx(3)).unwrap_err();
    assert_eq!(
        err,
        Error::WouldDeadlock {
            from: LockKey::Resource(3),
            to: LockKey::Resource(1),
        }
    );
    // Refusal leaves the graph untouched
    assert_eq!(detector.graph_size(), (3, 2));
    assert!(!detector.has_dependency(LockKey::Resource(3), LockKey::Resource(1)));
    assert_eq!(detector.stats().deadlocks_prevented, 1);
    assert!(detector.detect_cycles().is_empty());
}

#[test]
fn test_self_dependency_is_refused() {
    let detector = detector();
    assert!(matches!(
        detector.check_dependency(r(4), r(4), ctx(1)),
        Err(Error::WouldDeadlock { .. })
    ));
    assert!(matches!(
        detector.record_dependency(r(4), r(4), ctx(1)),
        Err(Error::WouldDeadlock { .. })
    ));
    assert_eq!(detector.graph_size(), (0, 0));
}

#[test]
fn test_existing_edge_is_accepted_again() {
    let detector = detector();
    detector.check_dependency(r(1), r(2), ctx(1)).unwrap();
    detector.check_dependency(r(1), r(2), ctx(2)).unwrap();
    assert_eq!(detector.graph_size(), (2, 1));

    // One owner left: the edge survives
    detector.release(ctx(1), LockKey::Resource(2));
    assert!(detector.has_dependency(LockKey::Resource(1), LockKey::Resource(2)));
    detector.release(ctx(2), LockKey::Resource(2));
    assert_eq!(detector.graph_size(), (0, 0));
}

#[test]
fn test_depth_limited_check_accepts_and_counts() {
    let config = DeadlockConfig {
        max_depth: 2,
        ..DeadlockConfig::default()
    };
    let detector = DeadlockDetector::new(&config);
    for id in 1..4 {
        detector.check_dependency(r(id), r(id + 1), ctx(id)).unwrap();
    }
    // 1 -> 2 -> 3 -> 4 is deeper than the bound: the closing edge slips through
    detector.check_dependency(r(4), r(1), ctx(9)).unwrap();
    assert_eq!(detector.stats().depth_limited, 1);
}

#[test]
fn test_checks_are_deferred_while_scanning() {
    let detector = detector();
    detector.set_scanning(true);
    detector.check_dependency(r(1), r(2), ctx(1)).unwrap();
    assert_eq!(detector.pending_len(), 1);
    assert_eq!(detector.graph_size(), (0, 0));
    assert!(detector.scan().skipped);
    detector.set_scanning(false);

    // The next check merges the queue first
    detector.check_dependency(r(2), r(3), ctx(1)).unwrap();
    assert_eq!(detector.pending_len(), 0);
    assert_eq!(detector.graph_size(), (3, 2));

    let stats = detector.stats();
    assert_eq!(stats.deferred_checks, 1);
    assert_eq!(stats.scans_skipped, 1);
}

// -------------------------------------------------------------------------
// Detection and resolution
// -------------------------------------------------------------------------

#[test]
fn test_scan_breaks_edge_with_largest_order_distance() {
    let detector = detector();
    detector.record_dependency(r(1), r(2), ctx(1)).unwrap();
    detector.record_dependency(r(2), r(3), ctx(2)).unwrap();
    detector.record_dependency(r(3), r(4), ctx(3)).unwrap();
    detector.record_dependency(r(4), r(1), ctx(4)).unwrap();
    assert_eq!(detector.detect_cycles().len(), 1);

    let report = detector.scan();
    assert!(!report.skipped);
    assert_eq!(report.cycles.len(), 1);
    assert_eq!(report.cycles[0].length, 4);
    assert_eq!(
        report.cycles[0].broken_edge,
        Some((LockKey::Resource(4), LockKey::Resource(1)))
    );
    assert_eq!(report.edges_broken, 1);
    // Nobody was blocked, so nobody is a victim
    assert!(report.victims.is_empty());

    assert!(detector.detect_cycles().is_empty());
    let stats = detector.stats();
    assert_eq!(stats.deadlocks_detected, 1);
    assert_eq!(stats.edges_broken, 1);
    assert_eq!(detector.state(), DetectorState::Idle);
}

#[test]
fn test_scan_flags_blocked_owner_as_victim() {
    let detector = detector();
    detector.record_dependency(r(10), r(20), ctx(1)).unwrap();
    detector.record_dependency(r(20), r(10), ctx(2)).unwrap();
    detector.mark_waiting(ctx(1), LockKey::Resource(20));
    detector.mark_waiting(ctx(2), LockKey::Resource(10));

    let report = detector.scan();
    assert_eq!(report.edges_broken, 1);
    assert_eq!(report.victims.len(), 1);

    let victim = report.victims[0];
    let survivor = if victim == ctx(1) { ctx(2) } else { ctx(1) };
    assert!(detector.take_victim(victim).is_some());
    assert!(detector.take_victim(victim).is_none(), "victim flag is consumed");
    assert!(detector.take_victim(survivor).is_none());
    assert_eq!(detector.stats().victims, 1);
}

#[test]
fn test_tie_on_distance_breaks_heavier_edge() {
    let detector = detector();
    // Both edges have order distance 1; 2 -> 1 was registered twice.
    detector.record_dependency(r(1), r(2), ctx(1)).unwrap();
    detector.record_dependency(r(2), r(1), ctx(2)).unwrap();
    detector.record_dependency(r(2), r(1), ctx(2)).unwrap();

    let report = detector.scan();
    assert_eq!(
        report.cycles[0].broken_edge,
        Some((LockKey::Resource(2), LockKey::Resource(1)))
    );
}

#[test]
fn test_clear_waiting_drops_stale_victim_flag() {
    let detector = detector();
    detector.record_dependency(r(1), r(2), ctx(1)).unwrap();
    detector.record_dependency(r(2), r(1), ctx(1)).unwrap();
    detector.mark_waiting(ctx(1), LockKey::Resource(1));
    let report = detector.scan();
    assert_eq!(report.victims, vec![ctx(1)]);

    detector.clear_waiting(ctx(1));
    assert!(detector.take_victim(ctx(1)).is_none());
}

#[test]
fn test_reset_stats_keeps_graph() {
    let detector = detector();
    detector.check_dependency(r(1), r(2), ctx(1)).unwrap();
    let _ = detector.check_dependency(r(2), r(1), ctx(2));
    detector.reset_stats();
    let stats = detector.stats();
    assert_eq!(stats.deadlocks_prevented, 0);
    assert_eq!(stats.graph_edges, 1);
}

#[test]
fn test_background_scanner_resolves_cycle() {
    let config = DeadlockConfig {
        scan_interval_ms: 5,
        ..DeadlockConfig::default()
    };
    let detector = std::sync::Arc::new(DeadlockDetector::new(&config));
    detector.record_dependency(r(1), r(2), ctx(1)).unwrap();
    detector.record_dependency(r(2), r(1), ctx(2)).unwrap();

    let scanner =
        DeadlockScanner::spawn(std::sync::Arc::clone(&detector), config.scan_interval()).unwrap();
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
    while detector.stats().deadlocks_detected == 0 && std::time::Instant::now() < deadline {
        std::thread::sleep(std::time::Duration::from_millis(5));
    }
    scanner.stop();

    assert_eq!(detector.stats().deadlocks_detected, 1);
    assert!(detector.detect_cycles().is_empty());
}

#[test]
fn test_lock_key_display() {
    assert_eq!(LockKey::Resource(7).to_string(), "resource:7");
    assert_eq!(LockKey::Index(2).to_string(), "index:2");
    assert_eq!(LockKey::External(9).id(), 9);
}
