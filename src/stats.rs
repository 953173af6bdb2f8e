//! Counters for duplicate packets, missed/skipped packets, PLC-concealed
//! frames, and queue drops. Plain atomics, cheap to update from hot paths
//! and read-only from outside the owning session.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct Stats {
    pub duplicate_count: AtomicU64,
    pub missed_count: AtomicU64,
    pub plc_count: AtomicU64,
    pub queue_drop_count: AtomicU64,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_duplicate(&self) {
        self.duplicate_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_missed(&self) {
        self.missed_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_plc(&self) {
        self.plc_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_queue_drop(&self) {
        self.queue_drop_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            duplicate_count: self.duplicate_count.load(Ordering::Relaxed),
            missed_count: self.missed_count.load(Ordering::Relaxed),
            plc_count: self.plc_count.load(Ordering::Relaxed),
            queue_drop_count: self.queue_drop_count.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    pub duplicate_count: u64,
    pub missed_count: u64,
    pub plc_count: u64,
    pub queue_drop_count: u64,
}
