//! Shared metrics aggregation.
//!
//! One mutex-protected accumulator of counters and latency extrema. All
//! operations are safe under concurrent callers; a snapshot is a consistent
//! copy taken under the lock, never a live view.

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tracing::debug;

#[derive(Debug, Default)]
struct MetricsInner {
    total_requests: u64,
    successful_requests: u64,
    failed_requests: u64,
    total_response_time_us: u64,
    /// 0 means "unset"; the first sample overrides.
    min_response_time_us: u64,
    max_response_time_us: u64,
}

/// Consistent copy of the aggregator state with derived fields.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub total_response_time_us: u64,
    pub min_response_time_us: u64,
    pub max_response_time_us: u64,

    /// Throughput aggregated per worker-second:
    /// `succeeded / (total_response_time_us / 1e6 / worker_count)`.
    pub requests_per_second: f64,

    /// `total_response_time_us / total_requests / 1000`.
    pub avg_response_time_ms: f64,
}

impl MetricsSnapshot {
    /// Failed requests as a percentage of the total.
    pub fn error_rate_percent(&self) -> f64 {
        if self.total_requests == 0 {
            return 0.0;
        }
        self.failed_requests as f64 / self.total_requests as f64 * 100.0
    }

    /// Successful requests as a percentage of the total.
    pub fn success_rate_percent(&self) -> f64 {
        if self.total_requests == 0 {
            return 0.0;
        }
        self.successful_requests as f64 / self.total_requests as f64 * 100.0
    }

    /// Format as a human-readable one-liner.
    pub fn format(&self) -> String {
        format!(
            "total={}, ok={}, failed={}, avg={:.2}ms, min={:.2}ms, max={:.2}ms, rps={:.2}",
            self.total_requests,
            self.successful_requests,
            self.failed_requests,
            self.avg_response_time_ms,
            self.min_response_time_us as f64 / 1000.0,
            self.max_response_time_us as f64 / 1000.0,
            self.requests_per_second,
        )
    }
}

/// Thread-safe counter/extrema accumulator.
///
/// Cheap to clone; clones share the same underlying state.
#[derive(Clone)]
pub struct MetricsAggregator {
    inner: Arc<Mutex<MetricsInner>>,
    worker_count: usize,
}

impl MetricsAggregator {
    /// Create an aggregator. `worker_count` scales the derived
    /// per-worker-second throughput in snapshots.
    pub fn new(worker_count: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(MetricsInner::default())),
            worker_count: worker_count.max(1),
        }
    }

    /// Record one completed operation.
    pub fn record(&self, response_time_us: u64, success: bool) {
        let mut inner = self.inner.lock().unwrap();

        inner.total_requests += 1;
        if success {
            inner.successful_requests += 1;
        } else {
            inner.failed_requests += 1;
        }
        inner.total_response_time_us += response_time_us;

        if inner.min_response_time_us == 0 || response_time_us < inner.min_response_time_us {
            inner.min_response_time_us = response_time_us;
        }
        if response_time_us > inner.max_response_time_us {
            inner.max_response_time_us = response_time_us;
        }

        debug!(
            response_time_us,
            success,
            total = inner.total_requests,
            "Recorded request"
        );
    }

    /// Take a consistent snapshot with derived fields.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let inner = self.inner.lock().unwrap();

        let avg_response_time_ms = if inner.total_requests > 0 {
            inner.total_response_time_us as f64 / inner.total_requests as f64 / 1000.0
        } else {
            0.0
        };

        let busy_seconds =
            inner.total_response_time_us as f64 / 1_000_000.0 / self.worker_count as f64;
        let requests_per_second = if busy_seconds > 0.0 {
            inner.successful_requests as f64 / busy_seconds
        } else {
            0.0
        };

        MetricsSnapshot {
            total_requests: inner.total_requests,
            successful_requests: inner.successful_requests,
            failed_requests: inner.failed_requests,
            total_response_time_us: inner.total_response_time_us,
            min_response_time_us: inner.min_response_time_us,
            max_response_time_us: inner.max_response_time_us,
            requests_per_second,
            avg_response_time_ms,
        }
    }

    /// Zero all fields.
    pub fn reset(&self) {
        let mut inner = self.inner.lock().unwrap();
        *inner = MetricsInner::default();
    }
}
