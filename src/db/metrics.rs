//! SQL latency metrics and slow-statement tracking.
//!
//! Counters are per-field atomics; the max-cost update is a compare-and-swap
//! loop. The slow-statement top-N is a small min-heap behind a mutex, touched
//! only when a statement crosses the slow threshold.

use crate::models::SqlValue;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::cmp::{Ordering as CmpOrdering, Reverse};
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{debug, warn};

/// Upper bounds (inclusive, ms) of the histogram buckets. One overflow bucket follows.
pub const BUCKET_BOUNDS_MS: [u64; 12] = [1, 5, 10, 20, 50, 100, 200, 500, 1000, 2000, 5000, 10000];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MetricsOptions {
    #[serde(rename = "sqlMetricsEnabled")]
    pub enabled: bool,
    /// Size of the slow-statement set; 0 disables tracking
    #[serde(rename = "slowSqlTopN")]
    pub slow_top_n: usize,
    /// Minimum cost for a statement to be considered slow
    #[serde(rename = "slowSqlMs")]
    pub slow_threshold_ms: u64,
    /// Serialize parameters into slow entries
    pub log_params: bool,
}

impl Default for MetricsOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            slow_top_n: 10,
            slow_threshold_ms: 0,
            log_params: false,
        }
    }
}

/// One retained slow statement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SlowEntry {
    pub sql: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<String>,
    pub cost_ms: u64,
    pub timestamp_ms: i64,
}

impl Ord for SlowEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.cost_ms
            .cmp(&other.cost_ms)
            .then_with(|| other.timestamp_ms.cmp(&self.timestamp_ms))
    }
}

impl PartialOrd for SlowEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

/// Read-only copy of the metrics at one instant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub total_count: u64,
    pub total_cost_ms: u64,
    pub max_cost_ms: u64,
    /// One count per bound in [`BUCKET_BOUNDS_MS`], then the overflow bucket.
    pub buckets: Vec<u64>,
    /// Slowest first.
    pub slow: Vec<SlowEntry>,
}

#[derive(Debug)]
pub struct SqlMetrics {
    enabled: AtomicBool,
    options: MetricsOptions,
    total_count: AtomicU64,
    total_cost: AtomicU64,
    max_cost: AtomicU64,
    buckets: [AtomicU64; BUCKET_BOUNDS_MS.len() + 1],
    slow: Mutex<BinaryHeap<Reverse<SlowEntry>>>,
}

impl Default for SqlMetrics {
    fn default() -> Self {
        Self::new(MetricsOptions::default())
    }
}

fn bucket_index(cost_ms: u64) -> usize {
    BUCKET_BOUNDS_MS
        .iter()
        .position(|&bound| cost_ms <= bound)
        .unwrap_or(BUCKET_BOUNDS_MS.len())
}

impl SqlMetrics {
    pub fn new(options: MetricsOptions) -> Self {
        Self {
            enabled: AtomicBool::new(options.enabled),
            options,
            total_count: AtomicU64::new(0),
            total_cost: AtomicU64::new(0),
            max_cost: AtomicU64::new(0),
            buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            slow: Mutex::new(BinaryHeap::new()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn options(&self) -> &MetricsOptions {
        &self.options
    }

    /// Record one statement execution. No-op while disabled.
    pub fn record(&self, sql: &str, params: &[SqlValue], cost_ms: u64) {
        if !self.is_enabled() {
            return;
        }

        self.total_count.fetch_add(1, Ordering::Relaxed);
        self.total_cost.fetch_add(cost_ms, Ordering::Relaxed);
        self.buckets[bucket_index(cost_ms)].fetch_add(1, Ordering::Relaxed);

        let mut current = self.max_cost.load(Ordering::Relaxed);
        while cost_ms > current {
            match self.max_cost.compare_exchange_weak(
                current,
                cost_ms,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }

        self.track_slow(sql, params, cost_ms);
    }

    fn track_slow(&self, sql: &str, params: &[SqlValue], cost_ms: u64) {
        let top_n = self.options.slow_top_n;
        if top_n == 0 || cost_ms < self.options.slow_threshold_ms {
            return;
        }

        if !Self::admits(&self.slow.lock(), top_n, cost_ms) {
            return;
        }

        let entry = SlowEntry {
            sql: sql.to_string(),
            params: self.render_params(params),
            cost_ms,
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
        };

        // another recorder may have filled the heap while the entry was built
        let mut heap = self.slow.lock();
        if !Self::admits(&heap, top_n, cost_ms) {
            return;
        }
        if heap.len() >= top_n {
            heap.pop();
        }
        heap.push(Reverse(entry));
        drop(heap);

        if self.options.slow_threshold_ms > 0 {
            debug!(cost_ms, sql = %sql, "Slow statement recorded");
        }
    }

    /// Whether a statement costing `cost_ms` earns a place among the `top_n` slowest.
    fn admits(heap: &BinaryHeap<Reverse<SlowEntry>>, top_n: usize, cost_ms: u64) -> bool {
        heap.len() < top_n || heap.peek().is_some_and(|Reverse(min)| cost_ms > min.cost_ms)
    }

    fn render_params(&self, params: &[SqlValue]) -> Option<String> {
        if !self.options.log_params {
            return None;
        }
        serde_json::to_string(params)
            .inspect_err(|e| warn!(error = %e, "Failed to serialize slow statement params"))
            .ok()
    }

    pub fn total_count(&self) -> u64 {
        self.total_count.load(Ordering::Relaxed)
    }

    pub fn total_cost_ms(&self) -> u64 {
        self.total_cost.load(Ordering::Relaxed)
    }

    pub fn max_cost_ms(&self) -> u64 {
        self.max_cost.load(Ordering::Relaxed)
    }

    pub fn buckets(&self) -> Vec<u64> {
        self.buckets.iter().map(|b| b.load(Ordering::Relaxed)).collect()
    }

    /// Slow entries, slowest first. The live heap is left untouched.
    pub fn slow_entries(&self) -> Vec<SlowEntry> {
        let mut entries: Vec<SlowEntry> =
            self.slow.lock().iter().map(|Reverse(e)| e.clone()).collect();
        entries.sort_by(|a, b| b.cmp(a));
        entries
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_count: self.total_count(),
            total_cost_ms: self.total_cost_ms(),
            max_cost_ms: self.max_cost_ms(),
            buckets: self.buckets(),
            slow: self.slow_entries(),
        }
    }

    pub fn reset(&self) {
        self.total_count.store(0, Ordering::Relaxed);
        self.total_cost.store(0, Ordering::Relaxed);
        self.max_cost.store(0, Ordering::Relaxed);
        for bucket in &self.buckets {
            bucket.store(0, Ordering::Relaxed);
        }
        self.slow.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics(top_n: usize, threshold: u64) -> SqlMetrics {
        SqlMetrics::new(MetricsOptions {
            enabled: true,
            slow_top_n: top_n,
            slow_threshold_ms: threshold,
            log_params: false,
        })
    }

    #[test]
    fn test_bucket_boundaries() {
        assert_eq!(bucket_index(0), 0);
        assert_eq!(bucket_index(1), 0);
        assert_eq!(bucket_index(2), 1);
        assert_eq!(bucket_index(10000), 11);
        assert_eq!(bucket_index(10001), 12);
    }

    #[test]
    fn test_buckets_sum_to_count() {
        let m = metrics(0, 0);
        for cost in [0, 3, 7, 7, 150, 99999] {
            m.record("SELECT 1", &[], cost);
        }
        assert_eq!(m.buckets().iter().sum::<u64>(), m.total_count());
        assert_eq!(m.total_count(), 6);
        assert_eq!(m.max_cost_ms(), 99999);
        assert_eq!(m.total_cost_ms(), 3 + 7 + 7 + 150 + 99999);
    }

    #[test]
    fn test_disabled_is_noop() {
        let m = SqlMetrics::new(MetricsOptions {
            enabled: false,
            ..Default::default()
        });
        m.record("SELECT 1", &[], 50);
        assert_eq!(m.total_count(), 0);
        assert!(m.slow_entries().is_empty());
    }

    #[test]
    fn test_top_n_keeps_highest() {
        let m = metrics(3, 10);
        for cost in [12, 50, 5, 30, 11, 40] {
            m.record(&format!("q{cost}"), &[], cost);
        }
        let costs: Vec<u64> = m.slow_entries().iter().map(|e| e.cost_ms).collect();
        assert_eq!(costs, vec![50, 40, 30]);
    }

    #[test]
    fn test_params_only_when_enabled() {
        let m = SqlMetrics::new(MetricsOptions {
            enabled: true,
            slow_top_n: 2,
            slow_threshold_ms: 0,
            log_params: true,
        });
        m.record("SELECT ?", &[SqlValue::Int(5)], 3);
        assert_eq!(m.slow_entries()[0].params.as_deref(), Some("[5]"));

        let quiet = metrics(2, 0);
        quiet.record("SELECT ?", &[SqlValue::Int(5)], 3);
        assert_eq!(quiet.slow_entries()[0].params, None);
    }

    #[test]
    fn test_concurrent_recorders_keep_exact_top_n() {
        let m = std::sync::Arc::new(SqlMetrics::new(MetricsOptions {
            enabled: true,
            slow_top_n: 5,
            slow_threshold_ms: 0,
            log_params: true,
        }));

        let workers: Vec<_> = (0..8u64)
            .map(|t| {
                let m = std::sync::Arc::clone(&m);
                std::thread::spawn(move || {
                    for i in 0..200u64 {
                        let cost = i * 8 + t;
                        m.record("SELECT ?", &[SqlValue::Int(cost as i64)], cost);
                        assert!(m.slow_entries().len() <= 5);
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        let slow = m.slow_entries();
        let costs: Vec<u64> = slow.iter().map(|e| e.cost_ms).collect();
        assert_eq!(costs, vec![1599, 1598, 1597, 1596, 1595]);
        for entry in &slow {
            assert_eq!(entry.params, Some(format!("[{}]", entry.cost_ms)));
        }
        assert_eq!(m.total_count(), 1600);
    }

    #[test]
    fn test_snapshot_does_not_drain() {
        let m = metrics(2, 0);
        m.record("a", &[], 1);
        m.record("b", &[], 2);
        assert_eq!(m.snapshot().slow.len(), 2);
        assert_eq!(m.snapshot().slow.len(), 2);
        m.reset();
        assert_eq!(m.snapshot().total_count, 0);
    }
}
