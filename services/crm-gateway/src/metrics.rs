//! Prometheus metrics exposition
//!
//! The library crates emit through the `metrics` facade:
//!
//! - `crm_auth_refresh_total` (counter): label `outcome`
//! - `crm_auth_store_persist_errors_total` (counter)
//! - `crm_auth_resolve_total` (counter): label `mode`
//! - `crm_auth_installs_total` (counter)
//!
//! This module owns the recorder and the proxy-side series:
//!
//! - `crm_proxy_requests_total` (counter): labels `status`, `method`
//! - `crm_proxy_request_duration_seconds` (histogram): label `status`
//! - `crm_proxy_upstream_errors_total` (counter): label `error_type`

use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

const DURATION_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
];

fn builder() -> PrometheusBuilder {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full("crm_proxy_request_duration_seconds".to_string()),
            DURATION_BUCKETS,
        )
        .expect("failed to set histogram buckets")
}

/// Install the Prometheus recorder and return a handle for rendering metrics.
///
/// `crm_proxy_request_duration_seconds` gets explicit buckets so it renders
/// as a histogram with `_bucket` lines rather than a summary. Buckets span
/// 5ms to 30s, covering the configurable CRM timeout.
pub fn install_recorder() -> PrometheusHandle {
    builder()
        .install_recorder()
        .expect("failed to install Prometheus recorder")
}

/// Record a completed proxied CRM request with status code and HTTP method labels.
pub fn record_request(status: u16, method: &str, duration_secs: f64) {
    let status_str = status.to_string();
    metrics::counter!("crm_proxy_requests_total", "status" => status_str.clone(), "method" => method.to_string())
        .increment(1);
    metrics::histogram!("crm_proxy_request_duration_seconds", "status" => status_str)
        .record(duration_secs);
}

/// Record a CRM upstream error with a classification label.
pub fn record_upstream_error(error_type: &str) {
    metrics::counter!("crm_proxy_upstream_errors_total", "error_type" => error_type.to_string())
        .increment(1);
}
