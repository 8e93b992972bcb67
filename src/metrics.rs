//! Prometheus metrics for the request gates.
//!
//! Metrics are exposed via a dedicated HTTP listener (default: `0.0.0.0:9090`).
//!
//! # Available Metrics
//!
//! ## Counters
//! - `gateway_blocked_requests_total` - Requests rejected by a gate (labels: reason)
//! - `gateway_admitted_requests_total` - Requests admitted by the rate gate (labels: route_class)
//! - `gateway_store_failures_total` - Store errors and timeouts (labels: gate, mode)
//! - `gateway_upstream_requests_total` - Forwarded requests (labels: status)
//!
//! ## Histograms
//! - `gateway_gate_duration_seconds` - Time spent deciding (labels: gate)
//!
//! ## Gauges
//! - `gateway_purged_entries` - Entries removed by the last background purge (labels: store)

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::{error, info};

/// Metric names as constants for consistency.
pub mod names {
    pub const BLOCKED_REQUESTS_TOTAL: &str = "gateway_blocked_requests_total";
    pub const ADMITTED_REQUESTS_TOTAL: &str = "gateway_admitted_requests_total";
    pub const STORE_FAILURES_TOTAL: &str = "gateway_store_failures_total";
    pub const UPSTREAM_REQUESTS_TOTAL: &str = "gateway_upstream_requests_total";
    pub const GATE_DURATION_SECONDS: &str = "gateway_gate_duration_seconds";
    pub const PURGED_ENTRIES: &str = "gateway_purged_entries";
}

/// Initialize the Prometheus metrics exporter.
///
/// Installs the global recorder, starts the HTTP listener on `metrics_addr`
/// and registers metric descriptions.
pub fn init_metrics(metrics_addr: SocketAddr) -> Result<(), String> {
    PrometheusBuilder::new()
        .with_http_listener(metrics_addr)
        .install()
        .map_err(|e| format!("Failed to install Prometheus exporter: {e}"))?;

    describe_counter!(
        names::BLOCKED_REQUESTS_TOTAL,
        "Total number of requests rejected by a gate"
    );
    describe_counter!(
        names::ADMITTED_REQUESTS_TOTAL,
        "Total number of requests admitted by the rate limit gate"
    );
    describe_counter!(
        names::STORE_FAILURES_TOTAL,
        "Total number of block-list or quota store failures"
    );
    describe_counter!(
        names::UPSTREAM_REQUESTS_TOTAL,
        "Total number of requests forwarded to the platform backend"
    );
    describe_histogram!(
        names::GATE_DURATION_SECONDS,
        "Time spent evaluating a gate in seconds"
    );
    describe_gauge!(
        names::PURGED_ENTRIES,
        "Entries removed by the most recent background purge"
    );

    info!(addr = %metrics_addr, "Prometheus metrics endpoint started");
    Ok(())
}

/// Try to initialize metrics, logging any errors but not failing.
pub fn try_init_metrics(metrics_addr: SocketAddr) {
    if let Err(e) = init_metrics(metrics_addr) {
        error!(error = %e, "Failed to initialize metrics, continuing without metrics");
    }
}

/// Record a request rejected by a gate.
pub fn record_blocked_request(reason: &'static str) {
    counter!(names::BLOCKED_REQUESTS_TOTAL, "reason" => reason).increment(1);
}

/// Record a request admitted by the rate gate.
pub fn record_admitted_request(route_class: &'static str) {
    counter!(names::ADMITTED_REQUESTS_TOTAL, "route_class" => route_class).increment(1);
}

/// Record a store failure and the fail mode that handled it.
pub fn record_store_failure(gate: &'static str, mode: &'static str) {
    counter!(names::STORE_FAILURES_TOTAL, "gate" => gate, "mode" => mode).increment(1);
}

/// Record a forwarded request by upstream status (or "error").
pub fn record_upstream_request(status: &str) {
    counter!(names::UPSTREAM_REQUESTS_TOTAL, "status" => status.to_string()).increment(1);
}

/// Record how long a gate took to decide.
pub fn record_gate_duration(gate: &'static str, duration_secs: f64) {
    histogram!(names::GATE_DURATION_SECONDS, "gate" => gate).record(duration_secs);
}

/// Update the purged-entries gauge for a store.
pub fn set_purged_entries(store: &'static str, count: usize) {
    gauge!(names::PURGED_ENTRIES, "store" => store).set(count as f64);
}

#[cfg(test)]
mod tests {
    use super::*;

    // These only check the recorders don't panic without an installed exporter.

    #[test]
    fn test_record_blocked_request() {
        record_blocked_request("IP_FILTERED");
        record_blocked_request("RATE_LIMITED");
    }

    #[test]
    fn test_record_gate_duration() {
        record_gate_duration("rate_limit", 0.0002);
    }

    #[test]
    fn test_record_store_failure() {
        record_store_failure("ip_filter", "open");
    }

    #[test]
    fn test_set_purged_entries() {
        set_purged_entries("quota", 0);
        set_purged_entries("block_list", 12);
    }
}
