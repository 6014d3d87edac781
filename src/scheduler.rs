//! Scheduler & usage accounting, plus the interrupt signal for clean
//! cancellation.
//!
//! One cumulative wall-time counter per disk, one per parity level, and
//! one for CPU/codec work, kept as separate accumulators rather than a
//! single per-disk figure. `Interrupt` is the one piece of process-global
//! mutable state the engine keeps, an `AtomicBool` polled at `pos`
//! boundaries — everything else is passed explicitly rather than hidden
//! behind a global.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::model::DiskIndex;

/// Cooperative, bounded cancellation: set once (e.g. by a signal handler)
/// and polled at each `pos` boundary. The engine finishes the current
/// `pos` plus one autosave after observing it set.
#[derive(Clone, Default)]
pub struct Interrupt(Arc<AtomicBool>);

impl Interrupt {
    pub fn new() -> Self {
        Interrupt(Arc::new(AtomicBool::new(false)))
    }

    pub fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Per-disk and per-parity-level wall-time accumulators, plus one bucket
/// for CPU-bound hash/codec work. Used to report the slowest resource —
/// typically the disk a scrub or sync run is bottlenecked on.
#[derive(Debug, Default)]
pub struct Scheduler {
    disk_ticks: HashMap<DiskIndex, Duration>,
    parity_ticks: HashMap<u8, Duration>,
    cpu_tick: Duration,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_disk(&mut self, disk: DiskIndex, elapsed: Duration) {
        *self.disk_ticks.entry(disk).or_default() += elapsed;
    }

    pub fn record_parity(&mut self, level: u8, elapsed: Duration) {
        *self.parity_ticks.entry(level).or_default() += elapsed;
    }

    pub fn record_cpu(&mut self, elapsed: Duration) {
        self.cpu_tick += elapsed;
    }

    pub fn slowest_disk(&self) -> Option<(DiskIndex, Duration)> {
        self.disk_ticks.iter().max_by_key(|(_, d)| **d).map(|(k, v)| (*k, *v))
    }

    pub fn slowest_parity(&self) -> Option<(u8, Duration)> {
        self.parity_ticks.iter().max_by_key(|(_, d)| **d).map(|(k, v)| (*k, *v))
    }

    pub fn cpu_tick(&self) -> Duration {
        self.cpu_tick
    }
}

/// Times a closure and records it against the right bucket. Callers time
/// each disk read individually, then time the codec call once after the
/// last read completes, so disk reads are always accounted ahead of the
/// codec invocation they feed.
pub fn timed<T>(f: impl FnOnce() -> T) -> (T, Duration) {
    let start = std::time::Instant::now();
    let result = f();
    (result, start.elapsed())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interrupt_is_observed_across_clones() {
        let flag = Interrupt::new();
        let clone = flag.clone();
        assert!(!clone.is_set());
        flag.set();
        assert!(clone.is_set());
    }

    #[test]
    fn scheduler_reports_slowest_disk() {
        let mut sched = Scheduler::new();
        sched.record_disk(0, Duration::from_millis(5));
        sched.record_disk(1, Duration::from_millis(50));
        let (slowest, _) = sched.slowest_disk().unwrap();
        assert_eq!(slowest, 1);
    }

    #[test]
    fn ticks_accumulate_across_calls() {
        let mut sched = Scheduler::new();
        sched.record_parity(1, Duration::from_millis(10));
        sched.record_parity(1, Duration::from_millis(15));
        let (level, total) = sched.slowest_parity().unwrap();
        assert_eq!(level, 1);
        assert_eq!(total, Duration::from_millis(25));
    }
}
