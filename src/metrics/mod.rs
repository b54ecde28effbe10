//! Single-writer/multi-reader cells shared between a worker and the status reporter.
//!
//! Both cells are lock-free: the owning worker is the only writer, the reporter and the
//! runner only ever read. A reader never sees a torn value.

use hdrhistogram::Histogram;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tracing::debug;

/// f64 cell stored as raw bits in an `AtomicU64`
#[derive(Debug, Default)]
pub struct AtomicFloat {
    bits: AtomicU64,
}

impl AtomicFloat {
    pub fn new(value: f64) -> Self {
        Self {
            bits: AtomicU64::new(value.to_bits()),
        }
    }

    #[inline]
    pub fn get(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::Acquire))
    }

    #[inline]
    pub fn set(&self, value: f64) {
        self.bits.store(value.to_bits(), Ordering::Release);
    }
}

/// Operation counter incremented once per completed iteration
#[derive(Debug, Default)]
pub struct OpCounter {
    count: AtomicU64,
}

impl OpCounter {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn get(&self) -> u64 {
        self.count.load(Ordering::Acquire)
    }

    #[inline]
    pub fn incr(&self) {
        self.count.fetch_add(1, Ordering::AcqRel);
    }

    pub fn set(&self, value: u64) {
        self.count.store(value, Ordering::Release);
    }
}

/// Per-operation latency, recorded by the owning worker during measurement
pub struct LatencyHistogram {
    histogram: Mutex<Histogram<u64>>,
}

impl LatencyHistogram {
    pub fn new() -> Self {
        // 1 microsecond to 60 seconds with 3 significant figures
        let histogram = Histogram::new_with_bounds(1, 60_000_000, 3)
            .expect("Failed to create histogram");
        Self {
            histogram: Mutex::new(histogram),
        }
    }

    #[inline]
    pub fn record(&self, duration: Duration) {
        let micros = duration.as_micros().min(u64::MAX as u128) as u64;
        if let Ok(mut hist) = self.histogram.lock() {
            hist.saturating_record(micros);
        }
    }

    pub fn count(&self) -> u64 {
        self.histogram.lock().map(|h| h.len()).unwrap_or(0)
    }

    /// Fold this histogram into `target`
    pub fn merge_into(&self, target: &mut Histogram<u64>) {
        if let Ok(hist) = self.histogram.lock() {
            if let Err(e) = target.add(&*hist) {
                debug!("Dropping latency samples on merge: {:?}", e);
            }
        }
    }

    pub fn empty_histogram() -> Histogram<u64> {
        Histogram::new_with_bounds(1, 60_000_000, 3).expect("Failed to create histogram")
    }
}

impl Default for LatencyHistogram {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for LatencyHistogram {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LatencyHistogram")
            .field("count", &self.count())
            .finish()
    }
}

/// Snapshot of latency statistics
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LatencySnapshot {
    pub count: u64,
    pub min: Duration,
    pub max: Duration,
    pub mean: Duration,
    pub p50: Duration,
    pub p90: Duration,
    pub p99: Duration,
}

impl LatencySnapshot {
    pub fn from_histogram(hist: &Histogram<u64>) -> Self {
        if hist.len() == 0 {
            return Self::default();
        }
        Self {
            count: hist.len(),
            min: Duration::from_micros(hist.min()),
            max: Duration::from_micros(hist.max()),
            mean: Duration::from_micros(hist.mean() as u64),
            p50: Duration::from_micros(hist.value_at_percentile(50.0)),
            p90: Duration::from_micros(hist.value_at_percentile(90.0)),
            p99: Duration::from_micros(hist.value_at_percentile(99.0)),
        }
    }

    /// Merge every worker's histogram into one snapshot
    pub fn merged<'a>(histograms: impl IntoIterator<Item = &'a LatencyHistogram>) -> Self {
        let mut merged = LatencyHistogram::empty_histogram();
        for hist in histograms {
            hist.merge_into(&mut merged);
        }
        Self::from_histogram(&merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn atomic_float_reads_only_stored_values() {
        let cell = Arc::new(AtomicFloat::new(0.0));
        let writers: Vec<_> = (0..4)
            .map(|w| {
                let cell = Arc::clone(&cell);
                thread::spawn(move || {
                    for i in 0..10_000u32 {
                        cell.set(f64::from(w * 100_000 + i) + 0.5);
                    }
                })
            })
            .collect();

        let stored: HashSet<u64> = (0..4u32)
            .flat_map(|w| (0..10_000u32).map(move |i| (f64::from(w * 100_000 + i) + 0.5).to_bits()))
            .chain(std::iter::once(0.0f64.to_bits()))
            .collect();

        for _ in 0..50_000 {
            let seen = cell.get();
            assert!(stored.contains(&seen.to_bits()), "torn read: {}", seen);
        }

        for w in writers {
            w.join().unwrap();
        }
    }

    #[test]
    fn op_counter_counts_increments() {
        let counter = OpCounter::new();
        for _ in 0..42 {
            counter.incr();
        }
        assert_eq!(counter.get(), 42);
        counter.set(0);
        assert_eq!(counter.get(), 0);
    }

    #[test]
    fn merged_latency_covers_all_workers() {
        let a = LatencyHistogram::new();
        let b = LatencyHistogram::new();
        a.record(Duration::from_millis(1));
        a.record(Duration::from_millis(2));
        b.record(Duration::from_millis(10));

        let snapshot = LatencySnapshot::merged([&a, &b]);
        assert_eq!(snapshot.count, 3);
        assert!(snapshot.max >= Duration::from_millis(9));
        assert!(snapshot.min <= Duration::from_millis(1));
    }

    #[test]
    fn empty_latency_snapshot_is_zeroed() {
        let snapshot = LatencySnapshot::merged(std::iter::empty());
        assert_eq!(snapshot, LatencySnapshot::default());
    }
}
