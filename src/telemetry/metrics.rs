// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Metrics collection for performance monitoring.
//!
//! Provides lightweight metrics collection without external dependencies.
//! The guard sits on the critical path of every agent command, so verdict
//! counters are plain atomics and latency goes into fixed-bucket histograms.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;

/// Global metrics instance.
pub static GLOBAL_METRICS: Lazy<Metrics> = Lazy::new(Metrics::new);

/// Kind of guard verdict, for counting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerdictKind {
    Allow,
    Deny,
    Rewrite,
    Confirm,
}

/// Central metrics collection.
#[derive(Debug)]
pub struct Metrics {
    /// General operation metrics.
    operations: RwLock<HashMap<String, OperationMetrics>>,

    /// Guard verdict counters.
    verdicts: VerdictCounters,

    /// Start time for calculating uptime.
    start_time: Instant,
}

impl Metrics {
    /// Create a new metrics collector.
    pub fn new() -> Self {
        Self {
            operations: RwLock::new(HashMap::new()),
            verdicts: VerdictCounters::default(),
            start_time: Instant::now(),
        }
    }

    /// Record a generic operation.
    pub fn record_operation(&self, name: &str, duration: Duration) {
        // A poisoned lock only means another thread panicked mid-record.
        let mut ops = match self.operations.write() {
            Ok(ops) => ops,
            Err(poisoned) => poisoned.into_inner(),
        };
        let metrics = ops.entry(name.to_string()).or_insert_with(OperationMetrics::new);
        metrics.record(duration);
    }

    /// Record a guard verdict.
    pub fn record_verdict(&self, kind: VerdictKind) {
        self.verdicts.counter(kind).fetch_add(1, Ordering::Relaxed);
    }

    /// Get metrics for a specific operation.
    pub fn operation_metrics(&self, name: &str) -> Option<OperationMetrics> {
        match self.operations.read() {
            Ok(ops) => ops.get(name).cloned(),
            Err(poisoned) => poisoned.into_inner().get(name).cloned(),
        }
    }

    /// Number of verdicts of the given kind recorded so far.
    pub fn verdict_count(&self, kind: VerdictKind) -> u64 {
        self.verdicts.counter(kind).load(Ordering::Relaxed)
    }

    /// Get uptime since metrics were initialized.
    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Take a snapshot of all metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let operations = match self.operations.read() {
            Ok(ops) => ops.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };

        MetricsSnapshot {
            operations,
            allowed: self.verdict_count(VerdictKind::Allow),
            denied: self.verdict_count(VerdictKind::Deny),
            rewritten: self.verdict_count(VerdictKind::Rewrite),
            confirmed: self.verdict_count(VerdictKind::Confirm),
            uptime: self.uptime(),
        }
    }

    /// Reset all metrics.
    pub fn reset(&self) {
        match self.operations.write() {
            Ok(mut ops) => ops.clear(),
            Err(poisoned) => poisoned.into_inner().clear(),
        }
        self.verdicts.reset();
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default)]
struct VerdictCounters {
    allow: AtomicU64,
    deny: AtomicU64,
    rewrite: AtomicU64,
    confirm: AtomicU64,
}

impl VerdictCounters {
    fn counter(&self, kind: VerdictKind) -> &AtomicU64 {
        match kind {
            VerdictKind::Allow => &self.allow,
            VerdictKind::Deny => &self.deny,
            VerdictKind::Rewrite => &self.rewrite,
            VerdictKind::Confirm => &self.confirm,
        }
    }

    fn reset(&self) {
        for counter in [&self.allow, &self.deny, &self.rewrite, &self.confirm] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

/// Generic operation metrics with histogram.
#[derive(Debug, Clone)]
pub struct OperationMetrics {
    /// Number of operations.
    pub count: u64,

    /// Total duration.
    pub total_duration: Duration,

    /// Minimum duration.
    pub min_duration: Duration,

    /// Maximum duration.
    pub max_duration: Duration,

    /// Histogram buckets for latency distribution.
    pub histogram: Histogram,
}

impl OperationMetrics {
    /// Create new operation metrics.
    pub fn new() -> Self {
        Self {
            count: 0,
            total_duration: Duration::ZERO,
            min_duration: Duration::MAX,
            max_duration: Duration::ZERO,
            histogram: Histogram::default(),
        }
    }

    /// Record an operation.
    pub fn record(&mut self, duration: Duration) {
        self.count += 1;
        self.total_duration += duration;
        self.min_duration = self.min_duration.min(duration);
        self.max_duration = self.max_duration.max(duration);
        self.histogram.record(duration);
    }

    /// Calculate average duration.
    pub fn avg_duration(&self) -> Duration {
        if self.count == 0 {
            Duration::ZERO
        } else {
            self.total_duration / self.count as u32
        }
    }
}

impl Default for OperationMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Simple histogram with fixed buckets for latency tracking.
#[derive(Debug, Clone)]
pub struct Histogram {
    /// Bucket boundaries in microseconds.
    buckets: Vec<u64>,

    /// Count per bucket.
    counts: Vec<u64>,
}

impl Histogram {
    /// Create a histogram with custom bucket boundaries (in microseconds).
    pub fn with_buckets(buckets: Vec<u64>) -> Self {
        let counts = vec![0; buckets.len() + 1];
        Self { buckets, counts }
    }

    /// Record a duration value.
    pub fn record(&mut self, duration: Duration) {
        let micros = duration.as_micros() as u64;
        let bucket_idx = self
            .buckets
            .iter()
            .position(|&b| micros <= b)
            .unwrap_or(self.buckets.len());
        self.counts[bucket_idx] += 1;
    }

    /// Get counts for each bucket.
    pub fn counts(&self) -> &[u64] {
        &self.counts
    }

    /// Calculate approximate percentile (p50, p90, p99, etc.).
    pub fn percentile(&self, p: f64) -> Duration {
        let total: u64 = self.counts.iter().sum();
        if total == 0 {
            return Duration::ZERO;
        }

        let target = (total as f64 * p / 100.0).ceil() as u64;
        let mut cumulative = 0u64;

        for (i, &count) in self.counts.iter().enumerate() {
            cumulative += count;
            if cumulative >= target {
                let micros = if i < self.buckets.len() {
                    self.buckets[i]
                } else {
                    self.buckets.last().copied().unwrap_or(0) * 10
                };
                return Duration::from_micros(micros);
            }
        }

        Duration::ZERO
    }

    /// Get p99 latency.
    pub fn p99(&self) -> Duration {
        self.percentile(99.0)
    }
}

impl Default for Histogram {
    fn default() -> Self {
        // 10us, 100us, 1ms, 10ms, 100ms, 1s, 10s
        Self::with_buckets(vec![10, 100, 1_000, 10_000, 100_000, 1_000_000, 10_000_000])
    }
}

/// A snapshot of all metrics at a point in time.
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    /// Operation metrics by name.
    pub operations: HashMap<String, OperationMetrics>,

    pub allowed: u64,
    pub denied: u64,
    pub rewritten: u64,
    pub confirmed: u64,

    /// Uptime when snapshot was taken.
    pub uptime: Duration,
}

impl MetricsSnapshot {
    /// Format as a human-readable report.
    pub fn format_report(&self) -> String {
        let mut report = String::new();

        report.push_str("=== Metrics Report ===\n\n");
        report.push_str(&format!("Uptime: {:.2?}\n", self.uptime));
        report.push_str(&format!(
            "Verdicts: {} allow, {} deny, {} rewrite, {} confirm\n\n",
            self.allowed, self.denied, self.rewritten, self.confirmed
        ));

        if !self.operations.is_empty() {
            report.push_str("Operation Metrics:\n");
            let mut names: Vec<_> = self.operations.keys().collect();
            names.sort();
            for name in names {
                let metrics = &self.operations[name];
                report.push_str(&format!(
                    "  {}: {} ops, avg {:.2?}, p99 {:.2?}\n",
                    name,
                    metrics.count,
                    metrics.avg_duration(),
                    metrics.histogram.p99()
                ));
            }
        }

        report
    }
}

/// Convenience function to record an operation to global metrics.
pub fn record_operation(name: &str, duration: Duration) {
    GLOBAL_METRICS.record_operation(name, duration);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_metrics() {
        let mut metrics = OperationMetrics::new();
        metrics.record(Duration::from_millis(10));
        metrics.record(Duration::from_millis(20));
        metrics.record(Duration::from_millis(30));

        assert_eq!(metrics.count, 3);
        assert_eq!(metrics.avg_duration(), Duration::from_millis(20));
    }

    #[test]
    fn test_histogram_buckets() {
        let mut hist = Histogram::default();
        hist.record(Duration::from_micros(5));
        hist.record(Duration::from_micros(50));
        hist.record(Duration::from_micros(500));

        assert_eq!(hist.counts()[0], 1);
        assert_eq!(hist.counts()[1], 1);
        assert_eq!(hist.counts()[2], 1);
    }

    #[test]
    fn test_histogram_percentiles() {
        let mut hist = Histogram::default();
        for _ in 0..100 {
            hist.record(Duration::from_micros(500));
        }
        assert_eq!(hist.p99(), Duration::from_micros(1_000));
    }

    #[test]
    fn test_verdict_counters() {
        let metrics = Metrics::new();
        metrics.record_verdict(VerdictKind::Deny);
        metrics.record_verdict(VerdictKind::Deny);
        metrics.record_verdict(VerdictKind::Rewrite);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.denied, 2);
        assert_eq!(snapshot.rewritten, 1);
        assert_eq!(snapshot.allowed, 0);
    }

    #[test]
    fn test_metrics_reset() {
        let metrics = Metrics::new();
        metrics.record_operation("guard.classify", Duration::from_micros(20));
        metrics.record_verdict(VerdictKind::Allow);

        metrics.reset();

        assert!(metrics.operation_metrics("guard.classify").is_none());
        assert_eq!(metrics.verdict_count(VerdictKind::Allow), 0);
    }

    #[test]
    fn test_report_lists_operations() {
        let metrics = Metrics::new();
        metrics.record_operation("reconcile", Duration::from_millis(3));
        let report = metrics.snapshot().format_report();
        assert!(report.contains("reconcile: 1 ops"));
    }
}
