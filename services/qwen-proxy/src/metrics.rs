//! Prometheus metrics exposition
//!
//! Metrics recorded by the service itself:
//!
//! - `proxy_requests_total` (counter): labels `route`, `status`
//! - `proxy_request_duration_seconds` (histogram): label `route`
//! - `proxy_upstream_errors_total` (counter): label `error_type`
//! - `proxy_credential_rotations_total` (counter): label `reason`
//!
//! `proxy_sessions_live` and `proxy_task_polls_total` are recorded by the
//! session pool and the task poller through the same global recorder.

use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

/// 5 ms up to 180 s; the top buckets cover requests that wait on task polling.
const DURATION_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 180.0,
];

fn builder() -> PrometheusBuilder {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full("proxy_request_duration_seconds".to_string()),
            DURATION_BUCKETS,
        )
        .expect("failed to set histogram buckets")
}

/// Install the Prometheus recorder and return a handle for rendering metrics.
pub fn install_recorder() -> PrometheusHandle {
    builder()
        .install_recorder()
        .expect("failed to install Prometheus recorder")
}

/// Record a completed API request.
pub fn record_request(route: &str, status: u16, duration_secs: f64) {
    metrics::counter!("proxy_requests_total", "route" => route.to_string(), "status" => status.to_string())
        .increment(1);
    metrics::histogram!("proxy_request_duration_seconds", "route" => route.to_string())
        .record(duration_secs);
}

/// Record an upstream error with a classification label.
pub fn record_upstream_error(error_type: &str) {
    metrics::counter!("proxy_upstream_errors_total", "error_type" => error_type.to_string())
        .increment(1);
}

/// Record a credential taken out of rotation (`invalid`, `rate_limited`).
pub fn record_credential_rotation(reason: &str) {
    metrics::counter!("proxy_credential_rotations_total", "reason" => reason.to_string())
        .increment(1);
}
