//! Loom models of the index sequence protocol.
//!
//! # Running Loom Tests
//!
//! ```bash
//! RUSTFLAGS="--cfg loom" cargo test -p veclock-core --features loom --release loom_
//! ```
//!
//! The models re-implement the word-level protocol on loom atomics:
//! readers validate against the sequence number, writers bump it around the
//! update and bump the generation exactly once.

#[cfg(loom)]
mod loom_seqlock {
    use loom::sync::atomic::{AtomicU64, Ordering};
    use loom::sync::Arc;
    use loom::thread;

    struct SeqIndex {
        sequence: AtomicU64,
        generation: AtomicU64,
        // Two halves of the guarded value; a consistent read sees them equal.
        left: AtomicU64,
        right: AtomicU64,
    }

    impl SeqIndex {
        fn new() -> Self {
            Self {
                sequence: AtomicU64::new(0),
                generation: AtomicU64::new(0),
                left: AtomicU64::new(0),
                right: AtomicU64::new(0),
            }
        }

        fn write(&self, value: u64) {
            self.sequence.fetch_add(1, Ordering::SeqCst);
            self.left.store(value, Ordering::SeqCst);
            self.right.store(value, Ordering::SeqCst);
            self.generation.fetch_add(1, Ordering::SeqCst);
            self.sequence.fetch_add(1, Ordering::SeqCst);
        }

        /// Returns `None` when the read must be retried.
        fn try_read(&self) -> Option<(u64, u64)> {
            let begin = self.sequence.load(Ordering::SeqCst);
            if begin & 1 == 1 {
                return None;
            }
            let left = self.left.load(Ordering::SeqCst);
            let right = self.right.load(Ordering::SeqCst);
            let end = self.sequence.load(Ordering::SeqCst);
            (begin == end).then_some((left, right))
        }
    }

    #[test]
    fn loom_validated_read_is_never_torn() {
        loom::model(|| {
            let index = Arc::new(SeqIndex::new());

            let writer_index = Arc::clone(&index);
            let writer = thread::spawn(move || writer_index.write(7));

            if let Some((left, right)) = index.try_read() {
                assert_eq!(left, right, "validated read observed a torn value");
            }

            writer.join().unwrap();
            assert_eq!(index.generation.load(Ordering::SeqCst), 1);
            assert_eq!(index.sequence.load(Ordering::SeqCst) & 1, 0);
        });
    }

    #[test]
    fn loom_generation_counts_every_write() {
        loom::model(|| {
            let index = Arc::new(SeqIndex::new());
            let section = Arc::new(loom::sync::Mutex::new(()));

            let handles: Vec<_> = (1..=2)
                .map(|value| {
                    let index = Arc::clone(&index);
                    let section = Arc::clone(&section);
                    thread::spawn(move || {
                        let _guard = section.lock().unwrap();
                        index.write(value);
                    })
                })
                .collect();
            for handle in handles {
                handle.join().unwrap();
            }

            assert_eq!(index.generation.load(Ordering::SeqCst), 2);
            assert_eq!(index.sequence.load(Ordering::SeqCst), 4);
        });
    }
}
