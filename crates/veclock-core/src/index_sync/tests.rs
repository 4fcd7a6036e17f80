//! Tests for index synchronization.

use super::*;
use std::sync::atomic::AtomicBool;
use std::sync::Barrier;
use std::thread;

#[test]
fn test_uncontended_read_is_consistent() {
    let index = IndexLock::new();
    let guard = index.read_begin();
    assert_eq!(guard.generation(), 0);
    assert!(!guard.writer_active());
    assert_eq!(index.active_readers(), 1);
    assert!(index.read_end(guard));
    assert_eq!(index.active_readers(), 0);
    assert_eq!(index.stats().reads, 1);
}

#[test]
fn test_generation_advances_once_per_write() {
    let index = IndexLock::new();
    for expected in 1..=3 {
        let token = index.write_begin();
        assert_eq!(token.generation_before(), expected - 1);
        assert!(index.is_writing());
        assert_eq!(index.write_end(token), expected);
        assert!(!index.is_writing());
    }
    assert_eq!(index.generation(), 3);
    assert_eq!(index.stats().writes, 3);
}

#[test]
fn test_reader_live_at_write_begin_stays_consistent() {
    let index = Arc::new(IndexLock::new());
    let guard = index.read_begin();

    let writer = {
        let index = Arc::clone(&index);
        thread::spawn(move || {
            let token = index.write_begin();
            index.write_end(token)
        })
    };
    // The writer waits for this reader before it publishes.
    thread::sleep(Duration::from_millis(10));
    assert!(!guard.is_stale());
    assert!(index.read_end(guard));
    assert_eq!(writer.join().unwrap(), 1);
}

#[test]
fn test_reader_that_started_during_publish_retries() {
    let index = IndexLock::new();
    let token = index.write_begin();
    // Same thread, so no grace period wait is involved.
    let guard = index.read_begin();
    assert!(guard.writer_active());
    assert!(guard.is_stale());
    drop(guard);
    index.write_end(token);

    let guard = index.read_begin();
    assert_eq!(guard.generation(), 1);
    assert!(index.read_end(guard));
}

#[test]
fn test_stale_read_is_counted_as_retry() {
    let index = IndexLock::new();
    let token = index.write_begin();
    let guard = index.read_begin();
    assert!(!index.read_end(guard));
    index.write_end(token);
    assert_eq!(index.stats().read_retries, 1);
}

#[test]
fn test_read_helper_never_observes_torn_state() {
    let index = Arc::new(IndexLock::new());
    // Two halves written under the index lock; readers must see them equal.
    let left = Arc::new(AtomicU64::new(0));
    let right = Arc::new(AtomicU64::new(0));
    let stop = Arc::new(AtomicBool::new(false));

    let writer = {
        let (index, left, right, stop) = (
            Arc::clone(&index),
            Arc::clone(&left),
            Arc::clone(&right),
            Arc::clone(&stop),
        );
        thread::spawn(move || {
            for value in 1..=200u64 {
                let token = index.write_begin();
                left.store(value, Ordering::Relaxed);
                thread::yield_now();
                right.store(value, Ordering::Relaxed);
                index.write_end(token);
            }
            stop.store(true, Ordering::Release);
        })
    };

    let readers: Vec<_> = (0..3)
        .map(|_| {
            let (index, left, right, stop) = (
                Arc::clone(&index),
                Arc::clone(&left),
                Arc::clone(&right),
                Arc::clone(&stop),
            );
            thread::spawn(move || {
                let mut last_generation = 0;
                while !stop.load(Ordering::Acquire) {
                    let (l, r, generation) = index.read(|guard| {
                        (
                            left.load(Ordering::Relaxed),
                            right.load(Ordering::Relaxed),
                            guard.generation(),
                        )
                    });
                    assert_eq!(l, r, "torn read at generation {generation}");
                    assert!(generation >= last_generation, "generation went backwards");
                    last_generation = generation;
                }
            })
        })
        .collect();

    writer.join().unwrap();
    for reader in readers {
        reader.join().unwrap();
    }
    assert_eq!(index.generation(), 200);
    assert_eq!(index.active_readers(), 0);
}

#[test]
fn test_writers_are_serialized() {
    let index = Arc::new(IndexLock::new());
    let barrier = Arc::new(Barrier::new(4));
    let inside = Arc::new(AtomicU64::new(0));

    let writers: Vec<_> = (0..4)
        .map(|_| {
            let (index, barrier, inside) =
                (Arc::clone(&index), Arc::clone(&barrier), Arc::clone(&inside));
            thread::spawn(move || {
                barrier.wait();
                for _ in 0..50 {
                    let token = index.write_begin();
                    assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                    inside.fetch_sub(1, Ordering::SeqCst);
                    index.write_end(token);
                }
            })
        })
        .collect();
    for writer in writers {
        writer.join().unwrap();
    }
    assert_eq!(index.generation(), 200);
}

#[test]
fn test_grace_period_waits_for_existing_reader() {
    let index = Arc::new(IndexLock::new());
    let guard = index.read_begin();
    let done = Arc::new(AtomicBool::new(false));

    let writer = {
        let (index, done) = (Arc::clone(&index), Arc::clone(&done));
        thread::spawn(move || {
            let token = index.write_begin();
            done.store(true, Ordering::Release);
            index.write_end(token);
        })
    };
    thread::sleep(Duration::from_millis(30));
    assert!(!done.load(Ordering::Acquire), "writer entered while a reader was live");
    assert!(index.read_end(guard));
    writer.join().unwrap();
    assert!(index.stats().grace_waits >= 1);
}

#[test]
fn test_cancelled_write_begin_is_interrupted() {
    let index = Arc::new(IndexLock::new());
    let holder = index.write_begin();
    let token = CancellationToken::new();
    token.cancel();

    let result = {
        let index = Arc::clone(&index);
        thread::spawn(move || index.write_begin_with(&token).map(|t| t.index_id()))
            .join()
            .unwrap()
    };
    assert!(matches!(result, Err(Error::Interrupted(_))));
    assert_eq!(index.stats().writers_waiting, 0);
    assert_eq!(index.write_end(holder), 1);
}

#[test]
fn test_dropped_token_publishes() {
    let index = IndexLock::new();
    {
        let _token = index.write_begin();
    }
    assert_eq!(index.generation(), 1);
    assert!(!index.is_writing());
}

#[test]
fn test_shared_counter_sink_sees_index_primitives() {
    let sink = Arc::new(LockFreeCounters::new());
    let index = IndexLock::with_parts(RetryConfig::default(), Arc::clone(&sink));
    let guard = index.read_begin();
    index.read_end(guard);
    assert!(sink.snapshot().attempts >= 2);
}
