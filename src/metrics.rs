//! In-process federation counters.
//!
//! Plans are counted per execution order, staging is counted in tables and
//! rows written to the scratch store, and combination queries keep their own
//! timing apart from the end-to-end plan time.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

use serde::Serialize;

use crate::federation::ExecutionOrder;

#[derive(Default)]
struct Timing {
    count: AtomicU64,
    total_ms: AtomicU64,
    max_ms: AtomicU64,
}

impl Timing {
    fn record(&self, duration_ms: f64) {
        let duration_ms = duration_ms.max(0.0) as u64;
        self.count.fetch_add(1, Ordering::Relaxed);
        self.total_ms.fetch_add(duration_ms, Ordering::Relaxed);
        self.max_ms.fetch_max(duration_ms, Ordering::Relaxed);
    }

    fn snapshot(&self) -> TimingSnapshot {
        let count = self.count.load(Ordering::Relaxed);
        let total = self.total_ms.load(Ordering::Relaxed);
        let max_ms = self.max_ms.load(Ordering::Relaxed);
        TimingSnapshot {
            count,
            avg_ms: (count > 0).then(|| total as f64 / count as f64),
            max_ms: (max_ms > 0).then_some(max_ms),
        }
    }
}

#[derive(Default)]
struct FederationMetrics {
    plans: Timing,
    failed_plans: AtomicU64,
    parallel_plans: AtomicU64,
    sequential_plans: AtomicU64,
    tables_staged: AtomicU64,
    rows_staged: AtomicU64,
    combinations: Timing,
    failed_combinations: AtomicU64,
    source_failures: AtomicU64,
}

static METRICS: OnceLock<FederationMetrics> = OnceLock::new();

fn metrics() -> &'static FederationMetrics {
    METRICS.get_or_init(FederationMetrics::default)
}

/// Records one finished plan run, end to end.
pub fn record_plan(duration_ms: f64, success: bool) {
    let metrics = metrics();
    metrics.plans.record(duration_ms);
    if !success {
        metrics.failed_plans.fetch_add(1, Ordering::Relaxed);
    }
}

/// Records a plan whose sources were all staged.
pub fn record_staging(order: ExecutionOrder, tables: usize, rows: u64) {
    let metrics = metrics();
    let counter = match order {
        ExecutionOrder::Parallel => &metrics.parallel_plans,
        ExecutionOrder::Sequential => &metrics.sequential_plans,
    };
    counter.fetch_add(1, Ordering::Relaxed);
    metrics.tables_staged.fetch_add(tables as u64, Ordering::Relaxed);
    metrics.rows_staged.fetch_add(rows, Ordering::Relaxed);
}

/// Records one combination query against the scratch store.
pub fn record_combination(duration_ms: f64, success: bool) {
    let metrics = metrics();
    metrics.combinations.record(duration_ms);
    if !success {
        metrics.failed_combinations.fetch_add(1, Ordering::Relaxed);
    }
}

/// Records one failed source call.
pub fn record_source_failure() {
    metrics().source_failures.fetch_add(1, Ordering::Relaxed);
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct TimingSnapshot {
    pub count: u64,
    pub avg_ms: Option<f64>,
    pub max_ms: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct FederationMetricsSnapshot {
    pub plans: TimingSnapshot,
    pub failed_plans: u64,
    pub parallel_plans: u64,
    pub sequential_plans: u64,
    pub tables_staged: u64,
    pub rows_staged: u64,
    pub combinations: TimingSnapshot,
    pub failed_combinations: u64,
    pub source_failures: u64,
}

pub fn snapshot() -> FederationMetricsSnapshot {
    let metrics = metrics();
    FederationMetricsSnapshot {
        plans: metrics.plans.snapshot(),
        failed_plans: metrics.failed_plans.load(Ordering::Relaxed),
        parallel_plans: metrics.parallel_plans.load(Ordering::Relaxed),
        sequential_plans: metrics.sequential_plans.load(Ordering::Relaxed),
        tables_staged: metrics.tables_staged.load(Ordering::Relaxed),
        rows_staged: metrics.rows_staged.load(Ordering::Relaxed),
        combinations: metrics.combinations.snapshot(),
        failed_combinations: metrics.failed_combinations.load(Ordering::Relaxed),
        source_failures: metrics.source_failures.load(Ordering::Relaxed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Other tests record into the same counters concurrently, so every
    // comparison here is a lower bound.

    #[test]
    fn staging_is_broken_down_by_order() {
        let before = snapshot();
        record_staging(ExecutionOrder::Sequential, 3, 120);
        record_staging(ExecutionOrder::Parallel, 1, 5);
        record_staging(ExecutionOrder::Sequential, 2, 0);

        let after = snapshot();
        assert!(after.sequential_plans >= before.sequential_plans + 2);
        assert!(after.parallel_plans >= before.parallel_plans + 1);
        assert!(after.tables_staged >= before.tables_staged + 6);
        assert!(after.rows_staged >= before.rows_staged + 125);
    }

    #[test]
    fn combination_time_is_kept_apart_from_plan_time() {
        let before = snapshot();
        record_combination(40.0, true);
        record_combination(77_777.0, false);

        let after = snapshot();
        assert!(after.combinations.count >= before.combinations.count + 2);
        assert!(after.failed_combinations >= before.failed_combinations + 1);
        assert!(after.combinations.max_ms.unwrap() >= 77_777);
        assert!(after.combinations.avg_ms.is_some());
        assert!(after.plans.count >= before.plans.count);
    }

    #[test]
    fn plan_and_source_failures_are_counted() {
        let before = snapshot();
        record_plan(120.0, true);
        record_plan(-5.0, false);
        record_source_failure();

        let after = snapshot();
        assert!(after.plans.count >= before.plans.count + 2);
        assert!(after.failed_plans >= before.failed_plans + 1);
        assert!(after.source_failures >= before.source_failures + 1);
        assert!(after.plans.avg_ms.is_some());
    }
}
