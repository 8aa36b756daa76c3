//! # Processing Metrics
//!
//! Metrics for work done outside the reconcile return path: scheduled snapshots,
//! retention pruning, and masking runs.

use crate::observability::metrics::registry::REGISTRY;
use anyhow::Result;
use prometheus::{Histogram, IntCounter, IntCounterVec, IntGauge};
use std::sync::LazyLock;

// Duration and schedule parsing errors
static DURATION_PARSING_ERRORS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "vandal_duration_parsing_errors_total",
        "Total number of TTL duration parsing errors",
    )
    .expect("Failed to create DURATION_PARSING_ERRORS_TOTAL metric - this should never happen")
});

static SCHEDULE_ERRORS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "vandal_schedule_errors_total",
        "Total number of invalid profile schedule expressions",
    )
    .expect("Failed to create SCHEDULE_ERRORS_TOTAL metric - this should never happen")
});

static SCHEDULED_TRIGGERS: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new(
        "vandal_scheduled_triggers",
        "Current number of registered snapshot triggers",
    )
    .expect("Failed to create SCHEDULED_TRIGGERS metric - this should never happen")
});

// Snapshot metrics
static SNAPSHOTS_CREATED_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "vandal_snapshots_created_total",
        "Total number of snapshots created by profile triggers",
    )
    .expect("Failed to create SNAPSHOTS_CREATED_TOTAL metric - this should never happen")
});

static SNAPSHOT_ERRORS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "vandal_snapshot_errors_total",
            "Total number of snapshot operation errors by operation",
        ),
        &["operation"],
    )
    .expect("Failed to create SNAPSHOT_ERRORS_TOTAL metric - this should never happen")
});

static SNAPSHOTS_PRUNED_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "vandal_snapshots_pruned_total",
        "Total number of snapshots deleted by retention",
    )
    .expect("Failed to create SNAPSHOTS_PRUNED_TOTAL metric - this should never happen")
});

// Masking metrics
static MASKED_ROWS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "vandal_masked_rows_total",
        "Total number of rows written by masking runs",
    )
    .expect("Failed to create MASKED_ROWS_TOTAL metric - this should never happen")
});

static MASKING_FAILURES_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "vandal_masking_failures_total",
        "Total number of failed masking runs",
    )
    .expect("Failed to create MASKING_FAILURES_TOTAL metric - this should never happen")
});

static MASKING_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        prometheus::HistogramOpts::new(
            "vandal_masking_duration_seconds",
            "Duration of successful masking runs in seconds",
        )
        .buckets(vec![1.0, 5.0, 15.0, 60.0, 300.0, 900.0, 3600.0]),
    )
    .expect("Failed to create MASKING_DURATION metric - this should never happen")
});

/// Register processing metrics with the registry
pub(crate) fn register_processing_metrics() -> Result<()> {
    REGISTRY.register(Box::new(DURATION_PARSING_ERRORS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(SCHEDULE_ERRORS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(SCHEDULED_TRIGGERS.clone()))?;
    REGISTRY.register(Box::new(SNAPSHOTS_CREATED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(SNAPSHOT_ERRORS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(SNAPSHOTS_PRUNED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(MASKED_ROWS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(MASKING_FAILURES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(MASKING_DURATION.clone()))?;
    Ok(())
}

pub fn increment_duration_parsing_errors() {
    DURATION_PARSING_ERRORS_TOTAL.inc();
}

pub fn increment_schedule_errors() {
    SCHEDULE_ERRORS_TOTAL.inc();
}

pub fn set_scheduled_triggers(count: usize) {
    #[allow(clippy::cast_possible_wrap, reason = "trigger count never approaches i64::MAX")]
    SCHEDULED_TRIGGERS.set(count as i64);
}

pub fn increment_snapshots_created() {
    SNAPSHOTS_CREATED_TOTAL.inc();
}

pub fn increment_snapshot_errors(operation: &str) {
    SNAPSHOT_ERRORS_TOTAL.with_label_values(&[operation]).inc();
}

pub fn increment_snapshots_pruned(count: usize) {
    SNAPSHOTS_PRUNED_TOTAL.inc_by(count as u64);
}

pub fn increment_masked_rows_total(rows: u64) {
    MASKED_ROWS_TOTAL.inc_by(rows);
}

pub fn increment_masking_failures_total() {
    MASKING_FAILURES_TOTAL.inc();
}

pub fn observe_masking_duration(duration: f64) {
    MASKING_DURATION.observe(duration);
}
