//! Prometheus metrics.
//!
//! Thin wrappers over the `metrics` facade so call sites stay one line.
//! Nothing is exported until [`install_recorder`] runs; before that every
//! call is a no-op.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::time::Instant;

/// Install the global Prometheus recorder. Call once, from `main`.
pub fn install_recorder() -> Result<PrometheusHandle, String> {
    PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| format!("failed to install Prometheus recorder: {}", e))
}

/// `outcome` is one of `hit`, `stale`, `miss`.
pub fn record_lookup(outcome: &'static str) {
    counter!("cache_lookups_total", "outcome" => outcome).increment(1);
}

pub fn record_backend_error(op: &'static str) {
    counter!("cache_backend_errors_total", "op" => op).increment(1);
}

pub fn record_refresh(ok: bool, start: Instant) {
    let outcome = if ok { "ok" } else { "error" };
    counter!("refreshes_total", "outcome" => outcome).increment(1);
    histogram!("refresh_duration_seconds").record(start.elapsed().as_secs_f64());
}

pub fn set_in_flight(count: usize) {
    gauge!("refreshes_in_flight").set(count as f64);
}

pub fn record_request(endpoint: &'static str, status: u16) {
    counter!(
        "http_requests_total",
        "endpoint" => endpoint,
        "status" => status.to_string()
    )
    .increment(1);
}

pub fn record_duration(endpoint: &'static str, start: Instant) {
    histogram!("http_request_duration_seconds", "endpoint" => endpoint)
        .record(start.elapsed().as_secs_f64());
}
