//! Workloads driven by the CLI.
//!
//! Both workloads run on plain OS threads against a shared [`LockCore`] and
//! return a serializable report; rendering lives in [`crate::output`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use veclock_core::{DeadlockPolicy, Error, LockCore, LockMode, StatsSnapshot};

/// Parameters of a stress run.
#[derive(Debug, Clone, Copy)]
pub struct StressOptions {
    pub threads: usize,
    pub ops_per_thread: u64,
    pub resources: u64,
    /// Share of operations taking the exclusive mode, in percent.
    pub write_percent: u32,
    /// Time each granted lock is held.
    pub hold: Duration,
    pub seed: u64,
}

/// Outcome of a stress run.
#[derive(Debug, Serialize)]
pub struct StressReport {
    pub threads: usize,
    pub operations: u64,
    pub granted: u64,
    pub busy: u64,
    /// Exclusive increments that did not survive. Anything but 0 is a bug.
    pub lost_updates: u64,
    pub elapsed_ms: u128,
    pub ops_per_sec: f64,
    pub stats: StatsSnapshot,
}

#[derive(Debug, Default, Clone, Copy)]
struct ThreadTally {
    granted: u64,
    writes: u64,
    busy: u64,
}

/// Runs a random mix of shared and exclusive acquisitions.
pub fn run_stress(core: &Arc<LockCore>, options: &StressOptions) -> anyhow::Result<StressReport> {
    if options.resources == 0 {
        bail!("--resources must be at least 1");
    }
    let slots_len = usize::try_from(options.resources).context("--resources is too large")?;
    // One plain counter per resource, bumped with a non-atomic
    // read-then-write while the exclusive lock is held.
    let slots: Vec<AtomicU64> = (0..slots_len).map(|_| AtomicU64::new(0)).collect();
    let started = Instant::now();

    let tallies = thread::scope(|scope| {
        let workers: Vec<_> = (0..options.threads)
            .map(|t| {
                let core = Arc::clone(core);
                let slots = &slots;
                scope.spawn(move || stress_worker(&core, options, slots, t as u64))
            })
            .collect();
        workers
            .into_iter()
            .map(|worker| {
                worker
                    .join()
                    .map_err(|_| anyhow::anyhow!("stress worker panicked"))?
            })
            .collect::<anyhow::Result<Vec<_>>>()
    })?;

    let elapsed = started.elapsed();
    let granted: u64 = tallies.iter().map(|t| t.granted).sum();
    let busy: u64 = tallies.iter().map(|t| t.busy).sum();
    let writes: u64 = tallies.iter().map(|t| t.writes).sum();
    let recorded: u64 = slots.iter().map(|s| s.load(Ordering::Relaxed)).sum();
    let lost_updates = writes.saturating_sub(recorded);
    let operations = granted + busy;
    if lost_updates > 0 {
        tracing::warn!(lost_updates, writes, "Exclusive sections overlapped");
    }
    // Reason: operation counts stay far below 2^52.
    #[allow(clippy::cast_precision_loss)]
    let ops_per_sec = operations as f64 / elapsed.as_secs_f64().max(f64::EPSILON);

    tracing::info!(operations, granted, busy, ?elapsed, "Stress run finished");

    Ok(StressReport {
        threads: options.threads,
        operations,
        granted,
        busy,
        lost_updates,
        elapsed_ms: elapsed.as_millis(),
        ops_per_sec,
        stats: core.stats_snapshot(),
    })
}

fn stress_worker(
    core: &LockCore,
    options: &StressOptions,
    slots: &[AtomicU64],
    thread_index: u64,
) -> anyhow::Result<ThreadTally> {
    let mut rng = StdRng::seed_from_u64(options.seed.wrapping_add(thread_index));
    let mut tally = ThreadTally::default();

    for _ in 0..options.ops_per_thread {
        let resource_id = rng.gen_range(0..options.resources);
        let mode = if rng.gen_ratio(options.write_percent.min(100), 100) {
            LockMode::Write
        } else {
            LockMode::Read
        };
        match core.lock_acquire(resource_id, mode) {
            Ok(handle) => {
                if mode == LockMode::Write {
                    // Reason: resource_id < resources == slots.len()
                    #[allow(clippy::cast_possible_truncation)]
                    let slot = &slots[resource_id as usize];
                    let value = slot.load(Ordering::Relaxed);
                    slot.store(value + 1, Ordering::Relaxed);
                    tally.writes += 1;
                }
                if !options.hold.is_zero() {
                    thread::sleep(options.hold);
                }
                core.lock_release(handle)
                    .with_context(|| format!("releasing resource {resource_id}"))?;
                tally.granted += 1;
            }
            Err(Error::Busy(_)) => tally.busy += 1,
            Err(err) => {
                return Err(err).with_context(|| format!("acquiring resource {resource_id}"))
            }
        }
    }
    Ok(tally)
}

/// What happened to one participant of a rotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleOutcome {
    Granted,
    Victim,
    Refused,
}

impl CycleOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Granted => "granted",
            Self::Victim => "deadlock victim",
            Self::Refused => "refused (would deadlock)",
        }
    }
}

/// One participant of a rotation.
#[derive(Debug, Clone, Serialize)]
pub struct CycleParticipant {
    pub thread: usize,
    pub held: u64,
    pub requested: u64,
    pub outcome: CycleOutcome,
}

/// Outcome of a deadlock rotation demo.
#[derive(Debug, Serialize)]
pub struct CycleReport {
    pub policy: DeadlockPolicy,
    pub participants: Vec<CycleParticipant>,
    pub elapsed_ms: u128,
    pub stats: StatsSnapshot,
}

/// Makes `ring` threads each hold one resource and request the next one,
/// forming a cycle, and reports how the core resolved it.
pub fn run_cycle(core: &Arc<LockCore>, ring: usize, timeout: Duration) -> anyhow::Result<CycleReport> {
    if ring < 2 {
        bail!("a cycle needs at least 2 threads");
    }
    if core.config().deadlock.policy == DeadlockPolicy::Off {
        bail!("deadlock handling is off; the rotation would never finish");
    }
    let started = Instant::now();
    let barrier = Arc::new(Barrier::new(ring));
    let (tx, rx) = mpsc::channel();
    let ring_len = ring as u64;

    for thread_index in 0..ring {
        let core = Arc::clone(core);
        let barrier = Arc::clone(&barrier);
        let tx = tx.clone();
        thread::Builder::new()
            .name(format!("veclock-cycle-{thread_index}"))
            .spawn(move || {
                let index = thread_index as u64;
                let held = index + 1;
                let requested = (index + 1) % ring_len + 1;
                let result = cycle_participant(&core, &barrier, held, requested);
                let _ = tx.send(result.map(|outcome| CycleParticipant {
                    thread: thread_index,
                    held,
                    requested,
                    outcome,
                }));
            })
            .context("spawning cycle participant")?;
    }
    drop(tx);

    let mut participants = Vec::with_capacity(ring);
    for _ in 0..ring {
        let participant = rx
            .recv_timeout(timeout)
            .context("rotation did not finish in time; the cycle was not resolved")??;
        participants.push(participant);
    }
    participants.sort_by_key(|p| p.thread);

    Ok(CycleReport {
        policy: core.config().deadlock.policy,
        participants,
        elapsed_ms: started.elapsed().as_millis(),
        stats: core.stats_snapshot(),
    })
}

fn cycle_participant(
    core: &LockCore,
    barrier: &Barrier,
    held: u64,
    requested: u64,
) -> anyhow::Result<CycleOutcome> {
    let own = core.lock_acquire(held, LockMode::Write)?;
    barrier.wait();
    let outcome = match core.lock_acquire(requested, LockMode::Write) {
        Ok(next) => {
            core.lock_release(next)?;
            CycleOutcome::Granted
        }
        Err(Error::DeadlockVictim { .. }) => CycleOutcome::Victim,
        Err(Error::WouldDeadlock { .. }) => CycleOutcome::Refused,
        Err(err) => return Err(err.into()),
    };
    core.lock_release(own)?;
    tracing::debug!(held, requested, outcome = outcome.as_str(), "Cycle participant done");
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use veclock_core::LockCoreConfig;

    fn core(policy: DeadlockPolicy, background_scan: bool) -> Arc<LockCore> {
        let mut config = LockCoreConfig::default();
        config.deadlock.policy = policy;
        config.deadlock.background_scan = background_scan;
        config.deadlock.scan_interval_ms = 5;
        Arc::new(LockCore::new(config).unwrap())
    }

    #[test]
    fn test_stress_accounts_every_operation() {
        let core = core(DeadlockPolicy::Prevent, false);
        let options = StressOptions {
            threads: 4,
            ops_per_thread: 250,
            resources: 16,
            write_percent: 30,
            hold: Duration::ZERO,
            seed: 7,
        };

        let report = run_stress(&core, &options).unwrap();

        assert_eq!(report.operations, 1_000);
        assert_eq!(report.granted + report.busy, 1_000);
        assert_eq!(report.lost_updates, 0);
        assert_eq!(report.stats.acquisitions, report.granted);
        assert_eq!(report.stats.currently_held, 0);
    }

    #[test]
    fn test_stress_rejects_empty_resource_space() {
        let core = core(DeadlockPolicy::Prevent, false);
        let options = StressOptions {
            threads: 1,
            ops_per_thread: 1,
            resources: 0,
            write_percent: 0,
            hold: Duration::ZERO,
            seed: 0,
        };
        assert!(run_stress(&core, &options).is_err());
    }

    #[test]
    fn test_cycle_under_prevent_refuses_one_request() {
        let core = core(DeadlockPolicy::Prevent, false);
        let report = run_cycle(&core, 3, Duration::from_secs(20)).unwrap();

        let refused = report
            .participants
            .iter()
            .filter(|p| p.outcome == CycleOutcome::Refused)
            .count();
        assert_eq!(refused, 1);
        assert_eq!(report.participants.len(), 3);
        assert_eq!(report.stats.deadlocks_prevented, 1);
    }

    #[test]
    fn test_cycle_under_detect_picks_one_victim() {
        let core = core(DeadlockPolicy::Detect, true);
        let report = run_cycle(&core, 3, Duration::from_secs(20)).unwrap();

        let victims = report
            .participants
            .iter()
            .filter(|p| p.outcome == CycleOutcome::Victim)
            .count();
        assert_eq!(victims, 1);
        assert!(report.stats.deadlocks_detected >= 1);
    }

    #[test]
    fn test_cycle_refuses_when_handling_is_off() {
        let core = core(DeadlockPolicy::Off, false);
        assert!(run_cycle(&core, 2, Duration::from_millis(10)).is_err());
    }
}
