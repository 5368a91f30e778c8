//! Prometheus metrics for the mock server.
//!
//! Served as text from the `/_internal/server/stats` endpoint of every listener.
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_histogram_vec, register_int_counter, CounterVec, Encoder,
    HistogramVec, IntCounter, TextEncoder,
};

lazy_static! {
    /// Total number of requests answered, by listener
    pub static ref REQUESTS_TOTAL: CounterVec = register_counter_vec!(
        "mawk_requests_total",
        "Total number of requests answered",
        &["server", "method", "status"]
    )
    .unwrap();

    /// Request duration, delay included
    pub static ref REQUEST_DURATION_MS: HistogramVec = register_histogram_vec!(
        "mawk_request_duration_ms",
        "Histogram of request handling time in milliseconds",
        &["server", "method"],
        vec![1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0]
    )
    .unwrap();

    /// Configuration reloads
    pub static ref RELOADS_TOTAL: CounterVec = register_counter_vec!(
        "mawk_reloads_total",
        "Total number of configuration reloads",
        &["result"]  // result: success|failure
    )
    .unwrap();

    /// Inbound token decisions
    pub static ref JWT_OUTCOMES_TOTAL: CounterVec = register_counter_vec!(
        "mawk_jwt_outcomes_total",
        "Inbound JWT policy outcomes",
        &["outcome"]  // outcome: absent|valid|tolerated|mismatch|rejected
    )
    .unwrap();

    /// Upstream calls made for proxy responses
    pub static ref PROXY_REQUESTS_TOTAL: CounterVec = register_counter_vec!(
        "mawk_proxy_requests_total",
        "Total number of requests delegated to proxy targets",
        &["target", "status"]
    )
    .unwrap();

    pub static ref PROXY_REQUEST_DURATION_MS: HistogramVec = register_histogram_vec!(
        "mawk_proxy_request_duration_ms",
        "Duration of proxy target calls in milliseconds",
        &["target"],
        vec![1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0]
    )
    .unwrap();

    /// Panics recovered while serving
    pub static ref PANICS_TOTAL: IntCounter = register_int_counter!(
        "mawk_panics_total",
        "Total number of panics recovered while handling requests"
    )
    .unwrap();
}

/// Collect and return all metrics in Prometheus text format
pub fn collect_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::warn!(error = %e, "failed to encode metrics");
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

pub fn record_request(server: &str, method: &str, status: u16, duration_ms: f64) {
    REQUESTS_TOTAL
        .with_label_values(&[server, method, &status.to_string()])
        .inc();
    REQUEST_DURATION_MS
        .with_label_values(&[server, method])
        .observe(duration_ms);
}

pub fn record_reload(success: bool) {
    let result = if success { "success" } else { "failure" };
    RELOADS_TOTAL.with_label_values(&[result]).inc();
}

pub fn record_jwt_outcome(outcome: &str) {
    JWT_OUTCOMES_TOTAL.with_label_values(&[outcome]).inc();
}

pub fn record_proxy_call(target: &str, status: u16, duration_ms: f64) {
    PROXY_REQUESTS_TOTAL
        .with_label_values(&[target, &status.to_string()])
        .inc();
    PROXY_REQUEST_DURATION_MS
        .with_label_values(&[target])
        .observe(duration_ms);
}

pub fn record_panic() {
    PANICS_TOTAL.inc();
}
