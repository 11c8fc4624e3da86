//! Prometheus metrics definitions.

use once_cell::sync::Lazy;
use prometheus::{
    register_histogram_vec, register_int_counter, register_int_counter_vec, register_int_gauge,
    Encoder, HistogramVec, IntCounter, IntCounterVec, IntGauge, TextEncoder,
};

/// Change batches received from the watcher.
pub static BATCHES_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "recheckd_watcher_batches_total",
        "Number of change batches received from the watcher"
    )
    .expect("metric definition is valid")
});

/// Changed paths submitted for incremental update.
pub static FILES_CHANGED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "recheckd_files_changed_total",
        "Number of changed paths submitted for incremental update"
    )
    .expect("metric definition is valid")
});

/// Completed rechecks.
pub static RECHECKS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!("recheckd_rechecks_total", "Number of completed rechecks")
        .expect("metric definition is valid")
});

/// Error snapshots pushed to subscribers.
pub static PUSHES_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "recheckd_subscription_pushes_total",
        "Number of error snapshots pushed to subscribers"
    )
    .expect("metric definition is valid")
});

/// Stops caused by critical file changes.
pub static CRITICAL_RESTARTS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "recheckd_critical_restarts_total",
        "Number of stops caused by critical file changes"
    )
    .expect("metric definition is valid")
});

/// Currently tracked modules.
pub static TRACKED_MODULES: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!("recheckd_tracked_modules", "Number of tracked modules")
        .expect("metric definition is valid")
});

/// Currently open subscriptions.
pub static ACTIVE_SUBSCRIPTIONS: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "recheckd_active_subscriptions",
        "Number of open client subscriptions"
    )
    .expect("metric definition is valid")
});

/// Request latency histogram.
pub static REQUEST_LATENCY: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "recheckd_request_duration_seconds",
        "Request latency in seconds",
        &["kind"],
        vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0]
    )
    .expect("metric definition is valid")
});

/// Request counter.
pub static REQUEST_COUNT: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "recheckd_requests_total",
        "Total number of requests",
        &["kind", "status"]
    )
    .expect("metric definition is valid")
});

/// Initialize all metrics (call once at startup).
pub fn init_metrics() {
    // Access lazy statics to register them
    let _ = &*BATCHES_TOTAL;
    let _ = &*FILES_CHANGED_TOTAL;
    let _ = &*RECHECKS_TOTAL;
    let _ = &*PUSHES_TOTAL;
    let _ = &*CRITICAL_RESTARTS_TOTAL;
    let _ = &*TRACKED_MODULES;
    let _ = &*ACTIVE_SUBSCRIPTIONS;
    let _ = &*REQUEST_LATENCY;
    let _ = &*REQUEST_COUNT;

    tracing::debug!("Prometheus metrics initialized");
}

/// Render every registered metric in the Prometheus text format.
#[must_use]
pub fn render() -> String {
    let mut buffer = Vec::new();
    if let Err(e) = TextEncoder::new().encode(&prometheus::gather(), &mut buffer) {
        tracing::warn!(error = %e, "Failed to encode metrics");
    }
    String::from_utf8_lossy(&buffer).into_owned()
}
