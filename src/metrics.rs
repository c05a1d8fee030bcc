//! Prometheus metrics registry and instruments.
//!
//! Instruments can be used before `init_metrics` runs; they are simply not
//! exported until registered.

use std::sync::Once;

use lazy_static::lazy_static;
use prometheus::{HistogramOpts, IntCounterVec, Opts, Registry};

lazy_static! {
    /// Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    // HTTP Metrics
    pub static ref HTTP_REQUESTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("fedlink_http_requests_total", "Total number of HTTP requests"),
        &["method", "endpoint", "status"]
    ).expect("metric can be created");

    // Federation Metrics
    pub static ref ACTIVITIES_RECEIVED: IntCounterVec = IntCounterVec::new(
        Opts::new("fedlink_activities_received_total", "Total number of ActivityPub activities received"),
        &["activity_type"]
    ).expect("metric can be created");
    pub static ref INBOX_REQUESTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("fedlink_inbox_requests_total", "Total number of inbox POSTs by outcome"),
        &["outcome"]
    ).expect("metric can be created");
    pub static ref DELIVERIES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("fedlink_deliveries_total", "Total number of signed outbound deliveries"),
        &["activity_type", "status"]
    ).expect("metric can be created");
    pub static ref DELIVERY_DURATION_SECONDS: prometheus::HistogramVec = prometheus::HistogramVec::new(
        HistogramOpts::new(
            "fedlink_delivery_duration_seconds",
            "Outbound delivery duration in seconds"
        ).buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
        &["activity_type"]
    ).expect("metric can be created");
    pub static ref SIGNATURE_VERIFICATIONS: IntCounterVec = IntCounterVec::new(
        Opts::new("fedlink_signature_verifications_total", "HTTP signature verifications by result"),
        &["result"]
    ).expect("metric can be created");

    // Cache Metrics
    pub static ref CACHE_LOOKUPS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("fedlink_cache_lookups_total", "Cache lookups by cache and result"),
        &["cache_name", "result"]
    ).expect("metric can be created");

    // Background Tasks
    pub static ref BACKGROUND_TASKS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("fedlink_background_tasks_total", "Background tasks by name and outcome"),
        &["task", "outcome"]
    ).expect("metric can be created");

    // Error Metrics
    pub static ref ERRORS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("fedlink_errors_total", "Total number of errors surfaced at the HTTP boundary"),
        &["error_type"]
    ).expect("metric can be created");
}

static INIT: Once = Once::new();

/// Initialize metrics registry.
///
/// Safe to call more than once; only the first call registers.
pub fn init_metrics() {
    INIT.call_once(|| {
        let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
            Box::new(HTTP_REQUESTS_TOTAL.clone()),
            Box::new(ACTIVITIES_RECEIVED.clone()),
            Box::new(INBOX_REQUESTS_TOTAL.clone()),
            Box::new(DELIVERIES_TOTAL.clone()),
            Box::new(DELIVERY_DURATION_SECONDS.clone()),
            Box::new(SIGNATURE_VERIFICATIONS.clone()),
            Box::new(CACHE_LOOKUPS_TOTAL.clone()),
            Box::new(BACKGROUND_TASKS_TOTAL.clone()),
            Box::new(ERRORS_TOTAL.clone()),
        ];

        for collector in collectors {
            if let Err(error) = REGISTRY.register(collector) {
                tracing::error!(%error, "Failed to register metric");
            }
        }

        tracing::info!("Metrics registry initialized");
    });
}
