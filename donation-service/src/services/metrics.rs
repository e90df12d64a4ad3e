//! Prometheus metrics for donation-service.

use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_histogram_vec, CounterVec, HistogramVec, TextEncoder,
};

/// Storage round-trip duration by operation.
pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "donation_db_query_duration_seconds",
        "Storage operation duration in seconds",
        &["operation"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0]
    )
    .expect("Failed to register db_query_duration")
});

/// Donation outcomes (accepted, replayed, rejected).
pub static DONATIONS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "donation_donations_total",
        "Total number of donation attempts by outcome",
        &["status"]
    )
    .expect("Failed to register donations_total")
});

/// Optimistic-concurrency losses by entity kind.
pub static VERSION_CONFLICTS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "donation_version_conflicts_total",
        "Writes rejected because the row changed since it was read",
        &["kind"]
    )
    .expect("Failed to register version_conflicts_total")
});

/// Error counter for alerting.
pub static ERRORS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "donation_errors_total",
        "Total number of errors by type",
        &["error_type"]
    )
    .expect("Failed to register errors_total")
});

/// Campaign lifecycle transitions that changed state.
pub static CAMPAIGN_TRANSITIONS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "donation_campaign_transitions_total",
        "Total number of applied campaign transitions",
        &["action"]
    )
    .expect("Failed to register campaign_transitions_total")
});

/// Initialize all metrics (forces lazy initialization).
pub fn init_metrics() {
    Lazy::force(&DB_QUERY_DURATION);
    Lazy::force(&DONATIONS_TOTAL);
    Lazy::force(&VERSION_CONFLICTS_TOTAL);
    Lazy::force(&ERRORS_TOTAL);
    Lazy::force(&CAMPAIGN_TRANSITIONS_TOTAL);
}

/// Get metrics in Prometheus text format.
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    encoder
        .encode_to_string(&metric_families)
        .unwrap_or_default()
}
