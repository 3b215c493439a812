//! Counters kept alongside the dispatch/pass-through core. Not part of
//! the request-handling contract itself, but every code path that
//! changes request disposition touches them, kept as plain
//! per-partition counters next to the cache logic rather than behind a
//! separate metrics crate.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

#[derive(Debug, Default)]
struct DirectionCounters {
    reads: AtomicU64,
    writes: AtomicU64,
}

/// Cache-wide and per-partition request counters.
#[derive(Default)]
pub struct Stats {
    total: DirectionCounters,
    pass_through: DirectionCounters,
    core_errors: AtomicU64,
    clean_errors: AtomicU64,
    by_partition: Mutex<HashMap<u32, DirectionCounters>>,
    pass_through_by_partition: Mutex<HashMap<u32, DirectionCounters>>,
}

impl Stats {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_dispatch(&self, part_id: u32, write: bool) {
        bump(&self.total, write);
        let mut by_part = self.by_partition.lock().unwrap();
        bump(by_part.entry(part_id).or_default(), write);
    }

    /// Called after a pass-through request's core I/O has actually
    /// completed (not on dispatch), keyed by partition and direction
    /// like [`Stats::record_dispatch`].
    pub fn record_pass_through(&self, part_id: u32, write: bool) {
        bump(&self.pass_through, write);
        let mut by_part = self.pass_through_by_partition.lock().unwrap();
        bump(by_part.entry(part_id).or_default(), write);
    }

    pub fn record_core_error(&self) {
        self.core_errors.fetch_add(1, Ordering::AcqRel);
    }

    pub fn record_clean_error(&self) {
        self.clean_errors.fetch_add(1, Ordering::AcqRel);
    }

    #[must_use]
    pub fn total_reads(&self) -> u64 {
        self.total.reads.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn total_writes(&self) -> u64 {
        self.total.writes.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn pass_through_reads(&self) -> u64 {
        self.pass_through.reads.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn pass_through_writes(&self) -> u64 {
        self.pass_through.writes.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn core_error_count(&self) -> u64 {
        self.core_errors.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn clean_error_count(&self) -> u64 {
        self.clean_errors.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn partition_reads(&self, part_id: u32) -> u64 {
        self.by_partition
            .lock()
            .unwrap()
            .get(&part_id)
            .map_or(0, |c| c.reads.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn partition_writes(&self, part_id: u32) -> u64 {
        self.by_partition
            .lock()
            .unwrap()
            .get(&part_id)
            .map_or(0, |c| c.writes.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn pass_through_partition_reads(&self, part_id: u32) -> u64 {
        self.pass_through_by_partition
            .lock()
            .unwrap()
            .get(&part_id)
            .map_or(0, |c| c.reads.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn pass_through_partition_writes(&self, part_id: u32) -> u64 {
        self.pass_through_by_partition
            .lock()
            .unwrap()
            .get(&part_id)
            .map_or(0, |c| c.writes.load(Ordering::Acquire))
    }
}

fn bump(counters: &DirectionCounters, write: bool) {
    if write {
        counters.writes.fetch_add(1, Ordering::AcqRel);
    } else {
        counters.reads.fetch_add(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_counts_accumulate_per_partition_and_total() {
        let stats = Stats::new();
        stats.record_dispatch(1, false);
        stats.record_dispatch(1, true);
        stats.record_dispatch(2, false);
        assert_eq!(stats.total_reads(), 2);
        assert_eq!(stats.total_writes(), 1);
        assert_eq!(stats.partition_reads(1), 1);
        assert_eq!(stats.partition_writes(1), 1);
        assert_eq!(stats.partition_reads(2), 1);
    }

    #[test]
    fn pass_through_counts_are_keyed_by_partition_and_direction() {
        let stats = Stats::new();
        stats.record_pass_through(1, false);
        stats.record_pass_through(2, true);
        assert_eq!(stats.pass_through_reads(), 1);
        assert_eq!(stats.pass_through_writes(), 1);
        assert_eq!(stats.pass_through_partition_reads(1), 1);
        assert_eq!(stats.pass_through_partition_writes(2), 1);
        assert_eq!(stats.pass_through_partition_reads(2), 0);
    }

    #[test]
    fn error_counters_increment_independently() {
        let stats = Stats::new();
        stats.record_core_error();
        stats.record_core_error();
        stats.record_clean_error();
        assert_eq!(stats.core_error_count(), 2);
        assert_eq!(stats.clean_error_count(), 1);
    }
}
