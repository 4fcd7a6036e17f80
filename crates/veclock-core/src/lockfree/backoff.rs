//! Exponential backoff with jitter.
//!
//! The delay doubles on every call up to a cap, with random jitter so that
//! contending contexts desynchronize. How the delay is spent depends on its
//! magnitude:
//!
//! ```text
//! delay < 1µs        busy-wait on the clock
//! 1µs <= delay < 1ms spin with a CPU relax hint
//! delay >= 1ms       voluntarily yield to the scheduler
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::config::RetryConfig;

/// Delays below this are spent busy-waiting.
pub const SPIN_THRESHOLD: Duration = Duration::from_micros(1);

/// Delays at or above this yield to the scheduler.
pub const YIELD_THRESHOLD: Duration = Duration::from_millis(1);

/// Seed source so that concurrently created backoffs do not share a sequence.
static SEED: AtomicU64 = AtomicU64::new(0x5DEE_CE66_D1A4_B5B5);

/// How a backoff delay is spent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseKind {
    /// Busy-wait on the clock (sub-microsecond).
    BusyWait,
    /// Spin with `std::hint::spin_loop` (microsecond scale).
    Relax,
    /// Yield the current thread (millisecond scale).
    Yield,
}

impl PauseKind {
    /// Selects the pause strategy for a delay.
    #[must_use]
    pub fn for_delay(delay: Duration) -> Self {
        if delay < SPIN_THRESHOLD {
            Self::BusyWait
        } else if delay < YIELD_THRESHOLD {
            Self::Relax
        } else {
            Self::Yield
        }
    }
}

/// Exponential backoff state.
#[derive(Debug, Clone)]
pub struct Backoff {
    current_ns: u64,
    max_ns: u64,
    jitter_percent: u8,
    /// Xorshift state, 0 until the first jittered delay.
    rng_state: u64,
}

impl Backoff {
    /// Creates a backoff starting at the policy's initial delay.
    #[must_use]
    pub fn new(policy: &RetryConfig) -> Self {
        Self {
            current_ns: policy.backoff_initial_ns.max(1),
            max_ns: policy.backoff_max_ns.max(policy.backoff_initial_ns).max(1),
            jitter_percent: policy.jitter_percent.min(100),
            rng_state: 0,
        }
    }

    /// Returns the un-jittered delay the next call will be based on.
    #[must_use]
    pub fn current(&self) -> Duration {
        Duration::from_nanos(self.current_ns)
    }

    /// Computes the next jittered delay and doubles the base, up to the cap.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.current_ns;
        self.current_ns = base.saturating_mul(2).min(self.max_ns);

        let range = base.saturating_mul(u64::from(self.jitter_percent)) / 100;
        if range == 0 {
            return Duration::from_nanos(base);
        }
        let offset = self.next_random() % (range + 1);
        let jittered = (base - range / 2).saturating_add(offset);
        Duration::from_nanos(jittered.clamp(1, self.max_ns))
    }

    /// Computes the next delay and spends it.
    pub fn snooze(&mut self) -> PauseKind {
        let delay = self.next_delay();
        pause(delay)
    }

    fn next_random(&mut self) -> u64 {
        // Seeded on first use so uncontended operations never touch SEED.
        if self.rng_state == 0 {
            self.rng_state = SEED.fetch_add(0x9E37_79B9_7F4A_7C15, Ordering::Relaxed) | 1;
        }
        let mut state = self.rng_state;
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        self.rng_state = state;
        state
    }
}

/// Spends `delay` using the strategy appropriate to its magnitude.
pub fn pause(delay: Duration) -> PauseKind {
    let kind = PauseKind::for_delay(delay);
    let start = Instant::now();
    match kind {
        PauseKind::BusyWait => while start.elapsed() < delay {},
        PauseKind::Relax => {
            while start.elapsed() < delay {
                std::hint::spin_loop();
            }
        }
        PauseKind::Yield => {
            while start.elapsed() < delay {
                std::thread::yield_now();
            }
        }
    }
    kind
}
