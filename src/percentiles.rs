//! Percentile latency tracking using HDR Histogram.
//!
//! The mutex aggregator in [`crate::metrics`] keeps counters and extrema;
//! this tracker adds accurate p50–p99.9 latency percentiles on top.

use hdrhistogram::Histogram;
use std::sync::Mutex;
use tracing::warn;

/// Longest latency the histogram can record: two minutes in microseconds.
/// Anything slower has already blown any deadline the engine hands out.
const MAX_TRACKABLE_US: u64 = 120 * 1_000_000;

/// Significant digits kept per recorded value.
const PRECISION_DIGITS: u8 = 3;

/// Percentile statistics for a set of latency measurements, in microseconds.
#[derive(Debug, Clone)]
pub struct PercentileStats {
    pub count: u64,
    pub min: u64,
    pub max: u64,
    pub mean: f64,
    pub p50: u64,
    pub p90: u64,
    pub p95: u64,
    pub p99: u64,
    pub p99_9: u64,
}

fn as_ms(us: u64) -> f64 {
    us as f64 / 1000.0
}

impl PercentileStats {
    /// Render the distribution as one line, in milliseconds.
    pub fn format(&self) -> String {
        format!(
            "p50/p90/p95/p99/p99.9 = {:.1}/{:.1}/{:.1}/{:.1}/{:.1} ms over {} samples (mean {:.1} ms, range {:.1}-{:.1} ms)",
            as_ms(self.p50),
            as_ms(self.p90),
            as_ms(self.p95),
            as_ms(self.p99),
            as_ms(self.p99_9),
            self.count,
            self.mean / 1000.0,
            as_ms(self.min),
            as_ms(self.max),
        )
    }
}

/// Thread-safe percentile tracker over a single histogram.
///
/// Values are clamped into `[1, MAX_TRACKABLE_US]` microseconds.
pub struct PercentileTracker {
    histogram: Mutex<Histogram<u64>>,
}

impl PercentileTracker {
    pub fn new() -> Self {
        // The bounds are compile-time constants; construction cannot fail
        // for any sigfig in 0..=5.
        let histogram = match Histogram::new_with_bounds(1, MAX_TRACKABLE_US, PRECISION_DIGITS) {
            Ok(h) => h,
            Err(e) => unreachable!("histogram bounds rejected: {e:?}"),
        };
        Self {
            histogram: Mutex::new(histogram),
        }
    }

    /// Record a latency measurement in microseconds.
    pub fn record_us(&self, latency_us: u64) {
        let clamped = latency_us.clamp(1, MAX_TRACKABLE_US);
        let mut hist = self.histogram.lock().unwrap();
        if let Err(e) = hist.record(clamped) {
            warn!(latency_us, error = ?e, "Failed to record latency sample");
        }
    }

    /// Current percentile statistics.
    pub fn stats(&self) -> PercentileStats {
        let hist = self.histogram.lock().unwrap();
        PercentileStats {
            count: hist.len(),
            min: if hist.is_empty() { 0 } else { hist.min() },
            max: hist.max(),
            mean: hist.mean(),
            p50: hist.value_at_quantile(0.50),
            p90: hist.value_at_quantile(0.90),
            p95: hist.value_at_quantile(0.95),
            p99: hist.value_at_quantile(0.99),
            p99_9: hist.value_at_quantile(0.999),
        }
    }

    /// Clear all recorded samples.
    pub fn reset(&self) {
        self.histogram.lock().unwrap().reset();
    }
}

impl Default for PercentileTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_tracker() {
        let tracker = PercentileTracker::new();
        let stats = tracker.stats();
        assert_eq!(stats.count, 0);
        assert_eq!(stats.min, 0);
    }

    #[test]
    fn test_percentile_ordering() {
        let tracker = PercentileTracker::new();
        for us in 1..=10_000u64 {
            tracker.record_us(us);
        }

        let stats = tracker.stats();
        assert_eq!(stats.count, 10_000);
        assert!(stats.p50 <= stats.p90);
        assert!(stats.p90 <= stats.p95);
        assert!(stats.p95 <= stats.p99);
        assert!(stats.p99 <= stats.p99_9);
        assert!(stats.p99_9 <= stats.max);
    }

    #[test]
    fn test_median_near_expected() {
        let tracker = PercentileTracker::new();
        for us in 1..=1_000u64 {
            tracker.record_us(us);
        }

        let stats = tracker.stats();
        // 3 significant digits of precision around 500
        assert!(stats.p50 >= 495 && stats.p50 <= 505, "p50={}", stats.p50);
    }

    #[test]
    fn test_reset_clears_samples() {
        let tracker = PercentileTracker::new();
        tracker.record_us(123);
        tracker.reset();
        assert_eq!(tracker.stats().count, 0);
    }

    #[test]
    fn test_samples_clamped_into_bounds() {
        let tracker = PercentileTracker::new();
        tracker.record_us(0);
        tracker.record_us(u64::MAX);

        let stats = tracker.stats();
        assert_eq!(stats.count, 2);
        assert_eq!(stats.min, 1);
        assert!(stats.max <= MAX_TRACKABLE_US + MAX_TRACKABLE_US / 1000);
    }

    #[test]
    fn test_format_mentions_sample_count() {
        let tracker = PercentileTracker::new();
        for _ in 0..5 {
            tracker.record_us(2_000);
        }
        let line = tracker.stats().format();
        assert!(line.contains("over 5 samples"), "{line}");
    }
}
