//! Prometheus metrics for the E2E runner
//!
//! Defines metrics for:
//! - HTTP requests by method and status
//! - HTTP request latency
//! - Retry attempts by operation
//! - Scenario outcomes

use lazy_static::lazy_static;
use prometheus::{Encoder, Histogram, HistogramOpts, IntCounterVec, Opts, Registry, TextEncoder};

lazy_static! {
    /// Registry for all metrics
    pub static ref REGISTRY: Registry = Registry::new();

    /// HTTP request counter by method and status ("network" when no response)
    pub static ref HTTP_REQUESTS: IntCounterVec = IntCounterVec::new(
        Opts::new("e2e_http_requests_total", "Total HTTP requests issued"),
        &["method", "status"]
    )
    .expect("Failed to create HTTP_REQUESTS metric");

    /// HTTP request latency histogram
    pub static ref HTTP_REQUEST_DURATION: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "e2e_http_request_duration_seconds",
            "HTTP request duration in seconds"
        )
        .buckets(vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0])
    )
    .expect("Failed to create HTTP_REQUEST_DURATION metric");

    /// Failed attempts that were retried, by operation label
    pub static ref RETRY_ATTEMPTS: IntCounterVec = IntCounterVec::new(
        Opts::new("e2e_retry_attempts_total", "Failed attempts followed by a retry"),
        &["operation"]
    )
    .expect("Failed to create RETRY_ATTEMPTS metric");

    /// Scenario outcomes by scenario name
    pub static ref SCENARIOS: IntCounterVec = IntCounterVec::new(
        Opts::new("e2e_scenarios_total", "Completed scenarios by outcome"),
        &["scenario", "outcome"]
    )
    .expect("Failed to create SCENARIOS metric");
}

/// Register all metrics with the global registry
pub fn init_metrics() -> Result<(), prometheus::Error> {
    REGISTRY.register(Box::new(HTTP_REQUESTS.clone()))?;
    REGISTRY.register(Box::new(HTTP_REQUEST_DURATION.clone()))?;
    REGISTRY.register(Box::new(RETRY_ATTEMPTS.clone()))?;
    REGISTRY.register(Box::new(SCENARIOS.clone()))?;
    Ok(())
}

/// Prometheus text exposition of the global registry
pub fn render() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}
