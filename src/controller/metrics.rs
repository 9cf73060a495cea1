//! Prometheus metrics for steward controllers
//!
//! # Exported metrics
//! The `/metrics` endpoint (when built with `--features metrics`) exports the following metrics:
//! - `steward_reconcile_duration_seconds` (histogram): reconcile duration labeled by controller.
//! - `steward_reconcile_errors_total` (counter): reconcile errors labeled by controller and kind.
//! - `steward_step_results_total` (counter): step results labeled by controller, step and result.
//! - `steward_queue_depth` (gauge): items waiting in the work queue labeled by controller.
//! - `steward_queue_tracked_items` (gauge): correlation side-table entries labeled by controller.
//! - `steward_watches_registered_total` (counter): watches started labeled by controller, kind and purpose.

use std::sync::atomic::{AtomicI64, AtomicU64};

use once_cell::sync::Lazy;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

/// Labels for operator reconcile metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ReconcileLabels {
    /// Controller name, e.g. "bundle"
    pub controller: String,
}

/// Labels for operator error metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ErrorLabels {
    pub controller: String,
    /// Error kind, see `Error::metric_label`
    pub kind: String,
}

/// Labels for per-step results
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct StepLabels {
    pub controller: String,
    pub step: String,
    pub result: String,
}

/// Labels for watch registrations
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct WatchLabels {
    pub controller: String,
    pub kind: String,
    pub purpose: String,
}

/// Histogram tracking reconcile duration (seconds)
pub static RECONCILE_DURATION_SECONDS: Lazy<Family<ReconcileLabels, Histogram>> = Lazy::new(|| {
    fn reconcile_histogram() -> Histogram {
        // 1ms .. ~32s across 16 buckets.
        Histogram::new(exponential_buckets(0.001, 2.0, 16))
    }

    Family::new_with_constructor(reconcile_histogram)
});

/// Counter tracking reconcile errors
pub static RECONCILE_ERRORS_TOTAL: Lazy<Family<ErrorLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

/// Counter tracking step results
pub static STEP_RESULTS_TOTAL: Lazy<Family<StepLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

/// Gauge tracking queued items
pub static QUEUE_DEPTH: Lazy<Family<ReconcileLabels, Gauge<i64, AtomicI64>>> =
    Lazy::new(Family::default);

/// Gauge tracking correlation side-table entries
pub static QUEUE_TRACKED_ITEMS: Lazy<Family<ReconcileLabels, Gauge<i64, AtomicI64>>> =
    Lazy::new(Family::default);

/// Counter tracking started watches
pub static WATCHES_REGISTERED_TOTAL: Lazy<Family<WatchLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let mut registry = Registry::default();

    registry.register(
        "steward_reconcile_duration_seconds",
        "Duration of reconcile loops in seconds",
        RECONCILE_DURATION_SECONDS.clone(),
    );
    registry.register(
        "steward_reconcile_errors_total",
        "Total number of reconcile errors",
        RECONCILE_ERRORS_TOTAL.clone(),
    );
    registry.register(
        "steward_step_results_total",
        "Total number of pipeline step results by step and result",
        STEP_RESULTS_TOTAL.clone(),
    );
    registry.register(
        "steward_queue_depth",
        "Number of reconcile requests waiting in the work queue",
        QUEUE_DEPTH.clone(),
    );
    registry.register(
        "steward_queue_tracked_items",
        "Number of in-flight items with recorded correlation metadata",
        QUEUE_TRACKED_ITEMS.clone(),
    );
    registry.register(
        "steward_watches_registered_total",
        "Total number of watches started by kind and purpose",
        WATCHES_REGISTERED_TOTAL.clone(),
    );

    registry
});

/// Observe a reconcile duration in seconds.
pub fn observe_reconcile_duration_seconds(controller: &str, seconds: f64) {
    let labels = ReconcileLabels {
        controller: controller.to_string(),
    };
    RECONCILE_DURATION_SECONDS
        .get_or_create(&labels)
        .observe(seconds);
}

/// Increment the reconcile error counter.
pub fn inc_reconcile_error(controller: &str, kind: &str) {
    let labels = ErrorLabels {
        controller: controller.to_string(),
        kind: kind.to_string(),
    };
    RECONCILE_ERRORS_TOTAL.get_or_create(&labels).inc();
}

pub fn inc_step_result(controller: &str, step: &str, result: &str) {
    let labels = StepLabels {
        controller: controller.to_string(),
        step: step.to_string(),
        result: result.to_string(),
    };
    STEP_RESULTS_TOTAL.get_or_create(&labels).inc();
}

/// Record queue depth and side-table size after a dequeue
pub fn set_queue_gauges(controller: &str, depth: usize, tracked: usize) {
    let labels = ReconcileLabels {
        controller: controller.to_string(),
    };
    QUEUE_DEPTH
        .get_or_create(&labels)
        .set(i64::try_from(depth).unwrap_or(i64::MAX));
    QUEUE_TRACKED_ITEMS
        .get_or_create(&labels)
        .set(i64::try_from(tracked).unwrap_or(i64::MAX));
}

pub fn inc_watch_registered(controller: &str, kind: &str, purpose: &str) {
    let labels = WatchLabels {
        controller: controller.to_string(),
        kind: kind.to_string(),
        purpose: purpose.to_string(),
    };
    WATCHES_REGISTERED_TOTAL.get_or_create(&labels).inc();
}
