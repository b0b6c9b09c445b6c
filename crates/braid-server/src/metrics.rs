//! Metrics collection and export for braid.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const SOCKETS_TOTAL: &str = "braid_sockets_total";
    pub const SOCKETS_ACTIVE: &str = "braid_sockets_active";
    pub const PEERS_ACTIVE: &str = "braid_peers_active";
    pub const MESSAGES_TOTAL: &str = "braid_messages_total";
    pub const MESSAGES_BYTES: &str = "braid_messages_bytes";
    pub const SUBSCRIPTIONS_TOTAL: &str = "braid_subscriptions_total";
    pub const DATA_KEYS: &str = "braid_data_keys";
    pub const DEDUP_DROPS_TOTAL: &str = "braid_dedup_drops_total";
    pub const HANDLER_SECONDS: &str = "braid_handler_seconds";
    pub const ERRORS_TOTAL: &str = "braid_errors_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::SOCKETS_TOTAL,
        "Total number of sockets since server start"
    );
    metrics::describe_gauge!(names::SOCKETS_ACTIVE, "Current number of open sockets");
    metrics::describe_gauge!(names::PEERS_ACTIVE, "Current number of directly linked peers");
    metrics::describe_counter!(names::MESSAGES_TOTAL, "Total number of frames by direction");
    metrics::describe_counter!(names::MESSAGES_BYTES, "Total bytes of frames by direction");
    metrics::describe_counter!(
        names::SUBSCRIPTIONS_TOTAL,
        "Total number of key subscriptions"
    );
    metrics::describe_gauge!(names::DATA_KEYS, "Current number of replicated keys");
    metrics::describe_counter!(
        names::DEDUP_DROPS_TOTAL,
        "Flooded messages dropped as already seen"
    );
    metrics::describe_histogram!(
        names::HANDLER_SECONDS,
        "Request handler latency in seconds"
    );
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record a new socket.
pub fn record_socket() {
    counter!(names::SOCKETS_TOTAL).increment(1);
    gauge!(names::SOCKETS_ACTIVE).increment(1.0);
}

/// Record a closed socket.
pub fn record_socket_closed() {
    gauge!(names::SOCKETS_ACTIVE).decrement(1.0);
}

/// Update the directly linked peer count.
pub fn set_active_peers(count: usize) {
    gauge!(names::PEERS_ACTIVE).set(count as f64);
}

/// Record a frame.
pub fn record_message(bytes: usize, direction: &'static str) {
    counter!(names::MESSAGES_TOTAL, "direction" => direction).increment(1);
    counter!(names::MESSAGES_BYTES, "direction" => direction).increment(bytes as u64);
}

/// Record a subscription.
pub fn record_subscription() {
    counter!(names::SUBSCRIPTIONS_TOTAL).increment(1);
}

/// Update the replicated key count.
pub fn set_data_keys(count: usize) {
    gauge!(names::DATA_KEYS).set(count as f64);
}

/// Record a flooded message dropped as a repeat.
pub fn record_dedup_drop() {
    counter!(names::DEDUP_DROPS_TOTAL).increment(1);
}

/// Record request handler latency.
pub fn record_handler_latency(handler: &'static str, seconds: f64) {
    histogram!(names::HANDLER_SECONDS, "handler" => handler).record(seconds);
}

/// Record an error.
pub fn record_error(error_type: &'static str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type).increment(1);
}

/// Metrics guard that records the socket closing on drop.
pub struct SocketMetricsGuard;

impl SocketMetricsGuard {
    /// Create a new metrics guard, recording a socket.
    #[must_use]
    pub fn new() -> Self {
        record_socket();
        Self
    }
}

impl Default for SocketMetricsGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SocketMetricsGuard {
    fn drop(&mut self) {
        record_socket_closed();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_guard() {
        // Just test that it doesn't panic
        let _guard = SocketMetricsGuard::new();
        record_message(10, "inbound");
        record_handler_latency("Credentials", 0.001);
    }
}
