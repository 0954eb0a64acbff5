//! Prometheus metrics for checkout-service.

use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_histogram_vec, CounterVec, Encoder, HistogramVec, TextEncoder,
};

/// Histogram for database/store operation duration.
pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "checkout_db_query_duration_seconds",
        "Store operation duration in seconds",
        &["operation"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5]
    )
    .expect("Failed to register DB_QUERY_DURATION")
});

/// Counter for checkout operations by path and outcome.
pub static CHECKOUT_OPERATIONS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "checkout_operations_total",
        "Total number of checkout attempts",
        &["path", "status"]
    )
    .expect("Failed to register CHECKOUT_OPERATIONS")
});

/// Counter for webhook deliveries by terminal outcome.
pub static WEBHOOK_EVENTS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "checkout_webhook_events_total",
        "Total number of processed webhook deliveries",
        &["outcome"]
    )
    .expect("Failed to register WEBHOOK_EVENTS")
});

/// Counter for snapshot cache accesses.
pub static SNAPSHOT_CACHE: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "checkout_snapshot_cache_total",
        "Snapshot cache accesses by result",
        &["result"]
    )
    .expect("Failed to register SNAPSHOT_CACHE")
});

/// Counter for QR provider calls.
pub static QR_REQUESTS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "checkout_qr_requests_total",
        "Total number of QR provider calls",
        &["status"]
    )
    .expect("Failed to register QR_REQUESTS")
});

/// Initialize all metrics (forces lazy initialization).
pub fn init_metrics() {
    Lazy::force(&DB_QUERY_DURATION);
    Lazy::force(&CHECKOUT_OPERATIONS);
    Lazy::force(&WEBHOOK_EVENTS);
    Lazy::force(&SNAPSHOT_CACHE);
    Lazy::force(&QR_REQUESTS);
}

/// Render the default registry in the Prometheus text format.
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
