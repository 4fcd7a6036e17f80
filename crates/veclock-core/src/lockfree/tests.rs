//! Tests for the lock-free primitive layer.

use super::*;
use std::sync::Arc;
use std::thread;

fn fast_policy(max_retries: u32) -> RetryConfig {
    RetryConfig {
        max_retries,
        backoff_initial_ns: 1,
        backoff_max_ns: 64,
        jitter_percent: 25,
    }
}

#[test]
fn test_compare_and_swap_success_and_failure_accounting() {
    let word = AtomicU64::new(1);
    let mut op = LockFreeOp::new("cas", RetryConfig::default());

    assert!(op.compare_and_swap(&word, 1, 2));
    assert!(!op.compare_and_swap(&word, 1, 3));

    assert_eq!(word.load(Ordering::Relaxed), 2);
    assert_eq!(op.attempts(), 2);
    assert_eq!(op.successes(), 1);
    assert_eq!(op.failures(), 1);
    assert_eq!(op.contentions(), 1);
}

#[test]
fn test_fetch_and_add_and_exchange_return_old_value() {
    let word = AtomicU32::new(10);
    let mut op = LockFreeOp::new("faa", RetryConfig::default());

    assert_eq!(op.fetch_and_add(&word, 5), 10);
    assert_eq!(op.exchange(&word, 99), 15);
    assert_eq!(word.load(Ordering::Relaxed), 99);
    assert_eq!(op.successes(), 2);
    assert_eq!(op.failures(), 0);
}

#[test]
fn test_fetch_and_add_wraps_for_decrement() {
    let word = AtomicU64::new(3);
    let mut op = LockFreeOp::new("dec", RetryConfig::default());

    let old = op.fetch_and_add(&word, 1u64.wrapping_neg());
    assert_eq!(old, 3);
    assert_eq!(word.load(Ordering::Relaxed), 2);
}

#[test]
fn test_should_retry_honors_ceiling() {
    let mut op = LockFreeOp::new("ceiling", fast_policy(16));
    let mut granted = 0;
    while op.should_retry() {
        granted += 1;
        assert!(granted <= 16, "retry loop exceeded the ceiling");
    }
    assert_eq!(granted, 16);
    assert!(op.is_exhausted());
    // Stays refused once exhausted
    assert!(!op.should_retry());
}

#[test]
fn test_cas_loop_against_stuck_word_stops_at_ceiling() {
    // Expected value never matches, so every CAS fails.
    let word = AtomicU64::new(7);
    let mut op = LockFreeOp::new("stuck", fast_policy(16));
    let mut loops = 0u32;

    let exhausted = loop {
        if op.compare_and_swap(&word, 0, 1) {
            break false;
        }
        if !op.should_retry() {
            break true;
        }
        loops += 1;
        op.backoff();
    };

    assert!(exhausted);
    assert_eq!(loops, 16);
    assert_eq!(op.attempts(), 17);
    assert_eq!(word.load(Ordering::Relaxed), 7);
}

#[test]
fn test_update_returns_exhausted_when_precondition_never_holds() {
    let word = AtomicU64::new(u64::MAX);
    let mut op = LockFreeOp::new("blocked", fast_policy(4));

    let result = op.update(&word, |v| (v != u64::MAX).then(|| v + 1));

    let err = result.unwrap_err();
    assert_eq!(err.op, "blocked");
    assert!(op.is_exhausted());
    assert_eq!(op.retries(), 5);
    assert_eq!(op.contentions(), 5);
}

#[test]
fn test_update_converts_to_busy_error() {
    let word = AtomicU64::new(0);
    let mut op = LockFreeOp::new("busy", fast_policy(1));
    let err: crate::Error = op.update(&word, |_| None).unwrap_err().into();
    assert!(matches!(err, crate::Error::Busy(_)));
}

#[test]
fn test_update_concurrent_increments_lose_nothing() {
    let word = Arc::new(AtomicU64::new(0));
    let counters = Arc::new(LockFreeCounters::new());
    let mut handles = Vec::new();

    for _ in 0..4 {
        let word = Arc::clone(&word);
        let counters = Arc::clone(&counters);
        handles.push(thread::spawn(move || {
            for _ in 0..1_000 {
                let mut op = LockFreeOp::new("inc", RetryConfig::default());
                loop {
                    if op.update(&*word, |v| Some(v + 1)).is_ok() {
                        break;
                    }
                    // Ceiling reached: start a fresh context, as a blocking
                    // fallback would after re-queueing.
                    op = LockFreeOp::new("inc", RetryConfig::default());
                }
                op.finish(&counters);
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(word.load(Ordering::Relaxed), 4_000);
    let stats = counters.snapshot();
    assert!(stats.successes >= 4_000);
    assert_eq!(stats.attempts, stats.successes + stats.failures);
}

#[test]
fn test_counters_absorb_and_reset() {
    let counters = LockFreeCounters::new();
    let word = AtomicUsize::new(0);
    let mut op = LockFreeOp::new("absorb", fast_policy(1)).on_node(3);
    assert_eq!(op.node(), 3);
    op.compare_and_swap(&word, 1, 2);
    op.should_retry();
    op.should_retry();
    op.finish(&counters);

    let stats = counters.snapshot();
    assert_eq!(stats.attempts, 1);
    assert_eq!(stats.failures, 1);
    assert_eq!(stats.retries, 2);
    assert_eq!(stats.exhausted, 1);

    counters.reset();
    assert_eq!(counters.snapshot(), LockFreeStats::default());
}

#[test]
fn test_backoff_doubles_and_caps() {
    let policy = RetryConfig {
        max_retries: 16,
        backoff_initial_ns: 100,
        backoff_max_ns: 1_000,
        jitter_percent: 0,
    };
    let mut backoff = Backoff::new(&policy);
    let delays: Vec<u64> = (0..6)
        .map(|_| u64::try_from(backoff.next_delay().as_nanos()).unwrap())
        .collect();
    assert_eq!(delays, vec![100, 200, 400, 800, 1_000, 1_000]);
}

#[test]
fn test_backoff_jitter_stays_within_quarter() {
    let policy = RetryConfig {
        max_retries: 16,
        backoff_initial_ns: 10_000,
        backoff_max_ns: 10_000,
        jitter_percent: 25,
    };
    let mut backoff = Backoff::new(&policy);
    for _ in 0..200 {
        let ns = backoff.next_delay().as_nanos();
        // base 10_000, jitter window 2_500 centered on the base, clamped at the cap
        assert!((8_750..=10_000).contains(&ns), "delay {ns} out of range");
    }
}

#[test]
fn test_pause_kind_thresholds() {
    assert_eq!(
        PauseKind::for_delay(Duration::from_nanos(500)),
        PauseKind::BusyWait
    );
    assert_eq!(
        PauseKind::for_delay(Duration::from_micros(20)),
        PauseKind::Relax
    );
    assert_eq!(
        PauseKind::for_delay(Duration::from_millis(2)),
        PauseKind::Yield
    );
}

#[test]
fn test_pause_waits_at_least_delay() {
    let delay = Duration::from_micros(50);
    let start = std::time::Instant::now();
    assert_eq!(pause(delay), PauseKind::Relax);
    assert!(start.elapsed() >= delay);
}
