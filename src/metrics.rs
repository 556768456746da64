//! Evaluation metrics: counters and a bucketed latency histogram.
//!
//! All hot-path updates are relaxed atomics; the histogram uses power-of-two
//! nanosecond buckets, so percentile reads are approximate (within one
//! bucket) but recording is a single fetch-add. Snapshots are cheap and
//! consistent enough for monitoring.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

const BUCKETS: usize = 64;

/// Power-of-two bucketed latency histogram.
#[derive(Debug)]
pub struct LatencyHistogram {
    buckets: [AtomicU64; BUCKETS],
}

impl LatencyHistogram {
    fn new() -> Self {
        LatencyHistogram {
            buckets: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    pub fn record(&self, nanos: u64) {
        let idx = (64 - nanos.max(1).leading_zeros() as usize - 1).min(BUCKETS - 1);
        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
    }

    /// Approximate percentile in nanoseconds (`q` in `[0, 1]`).
    pub fn percentile(&self, q: f64) -> u64 {
        let counts: Vec<u64> = self
            .buckets
            .iter()
            .map(|b| b.load(Ordering::Relaxed))
            .collect();
        let total: u64 = counts.iter().sum();
        if total == 0 {
            return 0;
        }
        let rank = ((total as f64) * q.clamp(0.0, 1.0)).ceil() as u64;
        let mut seen = 0u64;
        for (idx, &count) in counts.iter().enumerate() {
            seen += count;
            if seen >= rank.max(1) {
                // Bucket midpoint: between 2^idx and 2^(idx+1).
                return (1u64 << idx) + (1u64 << idx) / 2;
            }
        }
        1u64 << (BUCKETS - 1)
    }
}

/// Shared evaluation metrics. One instance per evaluator.
#[derive(Debug)]
pub struct EngineMetrics {
    total_evaluations: AtomicU64,
    total_matches: AtomicU64,
    predicates_evaluated: AtomicU64,
    evaluation_errors: AtomicU64,
    base_cache_hits: AtomicU64,
    base_cache_misses: AtomicU64,
    latency: LatencyHistogram,

    // Fixed at construction, from the model.
    base_condition_sets: usize,
    avg_reuse_per_set: f64,
    unique_predicates: usize,
}

/// Point-in-time view of [`EngineMetrics`], shaped for monitoring exports.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub total_evaluations: u64,
    pub total_matches: u64,
    pub evaluation_errors: u64,
    pub cache_hit_rate: f64,
    pub avg_predicates_evaluated: f64,
    pub p50_latency_nanos: u64,
    pub p95_latency_nanos: u64,
    pub p99_latency_nanos: u64,
    pub base_condition_sets: usize,
    pub base_condition_reduction_percent: f64,
    pub avg_reuse_per_set: f64,
}

impl EngineMetrics {
    pub fn new(base_condition_sets: usize, avg_reuse_per_set: f64, unique_predicates: usize) -> Self {
        EngineMetrics {
            total_evaluations: AtomicU64::new(0),
            total_matches: AtomicU64::new(0),
            predicates_evaluated: AtomicU64::new(0),
            evaluation_errors: AtomicU64::new(0),
            base_cache_hits: AtomicU64::new(0),
            base_cache_misses: AtomicU64::new(0),
            latency: LatencyHistogram::new(),
            base_condition_sets,
            avg_reuse_per_set,
            unique_predicates,
        }
    }

    pub fn record_evaluation(
        &self,
        predicates_evaluated: u32,
        matches: usize,
        nanos: u64,
        base_from_cache: bool,
    ) {
        self.total_evaluations.fetch_add(1, Ordering::Relaxed);
        self.total_matches
            .fetch_add(matches as u64, Ordering::Relaxed);
        self.predicates_evaluated
            .fetch_add(u64::from(predicates_evaluated), Ordering::Relaxed);
        if base_from_cache {
            self.base_cache_hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.base_cache_misses.fetch_add(1, Ordering::Relaxed);
        }
        self.latency.record(nanos);
    }

    pub fn record_error(&self) {
        self.evaluation_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let evals = self.total_evaluations.load(Ordering::Relaxed);
        let hits = self.base_cache_hits.load(Ordering::Relaxed);
        let misses = self.base_cache_misses.load(Ordering::Relaxed);
        let preds = self.predicates_evaluated.load(Ordering::Relaxed);

        let avg_predicates = if evals == 0 {
            0.0
        } else {
            preds as f64 / evals as f64
        };
        let reduction = if self.unique_predicates == 0 {
            0.0
        } else {
            (100.0 * (1.0 - avg_predicates / self.unique_predicates as f64)).max(0.0)
        };

        MetricsSnapshot {
            total_evaluations: evals,
            total_matches: self.total_matches.load(Ordering::Relaxed),
            evaluation_errors: self.evaluation_errors.load(Ordering::Relaxed),
            cache_hit_rate: if hits + misses == 0 {
                0.0
            } else {
                hits as f64 / (hits + misses) as f64
            },
            avg_predicates_evaluated: avg_predicates,
            p50_latency_nanos: self.latency.percentile(0.50),
            p95_latency_nanos: self.latency.percentile(0.95),
            p99_latency_nanos: self.latency.percentile(0.99),
            base_condition_sets: self.base_condition_sets,
            base_condition_reduction_percent: reduction,
            avg_reuse_per_set: self.avg_reuse_per_set,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn histogram_percentiles_track_magnitude() {
        let histogram = LatencyHistogram::new();
        for _ in 0..99 {
            histogram.record(1_000);
        }
        histogram.record(1_000_000);
        let p50 = histogram.percentile(0.50);
        let p99 = histogram.percentile(0.99);
        assert!(p50 >= 512 && p50 <= 2_048, "p50 = {p50}");
        assert!(histogram.percentile(1.0) >= 524_288);
        assert!(p99 <= 2_048, "p99 = {p99}");
    }

    #[test]
    fn empty_histogram_reports_zero() {
        let histogram = LatencyHistogram::new();
        assert_eq!(histogram.percentile(0.5), 0);
    }

    #[test]
    fn snapshot_aggregates_counters() {
        let metrics = EngineMetrics::new(3, 2.5, 100);
        metrics.record_evaluation(10, 1, 5_000, false);
        metrics.record_evaluation(0, 0, 2_000, true);
        metrics.record_error();

        let snap = metrics.snapshot();
        assert_eq!(snap.total_evaluations, 2);
        assert_eq!(snap.total_matches, 1);
        assert_eq!(snap.evaluation_errors, 1);
        assert!((snap.cache_hit_rate - 0.5).abs() < 1e-9);
        assert!((snap.avg_predicates_evaluated - 5.0).abs() < 1e-9);
        assert_eq!(snap.base_condition_sets, 3);
        assert!((snap.avg_reuse_per_set - 2.5).abs() < 1e-9);
        assert!((snap.base_condition_reduction_percent - 95.0).abs() < 1e-9);
    }
}
