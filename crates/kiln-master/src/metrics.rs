//! Per-thread performance counters.
//!
//! Each thread that touches the master registers one counter block in a
//! process-wide list the first time it records anything; [`collect`] sums
//! every registered block into a snapshot. Individual counters are relaxed
//! atomics: aggregation does not need to be atomic across counters, only
//! eventually complete.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

static REGISTRY: Mutex<Vec<Arc<PerfStats>>> = Mutex::new(Vec::new());

thread_local! {
    static THREAD_STATS: Arc<PerfStats> = register_new();
}

fn register_new() -> Arc<PerfStats> {
    let stats = Arc::new(PerfStats::default());
    REGISTRY.lock().push(Arc::clone(&stats));
    stats
}

#[derive(Default)]
pub struct PerfStats {
    pub read_count: AtomicU64,
    pub write_count: AtomicU64,
    pub create_count: AtomicU64,
    pub remove_count: AtomicU64,
    pub multi_read_count: AtomicU64,
    pub replayed_segments: AtomicU64,
    pub replayed_entries: AtomicU64,
}

impl PerfStats {
    #[inline]
    pub fn bump(counter: impl Fn(&PerfStats) -> &AtomicU64) {
        THREAD_STATS.with(|stats| counter(stats).fetch_add(1, Ordering::Relaxed));
    }
}

/// Sum of every thread's counters at one point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PerfStatsSnapshot {
    pub read_count: u64,
    pub write_count: u64,
    pub create_count: u64,
    pub remove_count: u64,
    pub multi_read_count: u64,
    pub replayed_segments: u64,
    pub replayed_entries: u64,
}

pub fn collect() -> PerfStatsSnapshot {
    let registry = REGISTRY.lock();
    let mut total = PerfStatsSnapshot::default();
    for stats in registry.iter() {
        total.read_count += stats.read_count.load(Ordering::Relaxed);
        total.write_count += stats.write_count.load(Ordering::Relaxed);
        total.create_count += stats.create_count.load(Ordering::Relaxed);
        total.remove_count += stats.remove_count.load(Ordering::Relaxed);
        total.multi_read_count += stats.multi_read_count.load(Ordering::Relaxed);
        total.replayed_segments += stats.replayed_segments.load(Ordering::Relaxed);
        total.replayed_entries += stats.replayed_entries.load(Ordering::Relaxed);
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_from_multiple_threads_are_summed() {
        let before = collect();
        PerfStats::bump(|s| &s.read_count);
        std::thread::spawn(|| {
            PerfStats::bump(|s| &s.read_count);
            PerfStats::bump(|s| &s.write_count);
        })
        .join()
        .unwrap();

        let after = collect();
        assert!(after.read_count >= before.read_count + 2);
        assert!(after.write_count >= before.write_count + 1);
    }
}
