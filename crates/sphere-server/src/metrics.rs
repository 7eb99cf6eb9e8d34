//! Metrics collection and export.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "sphere_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "sphere_connections_active";
    pub const ONLINE_USERS: &str = "sphere_online_users";
    pub const EVENTS_TOTAL: &str = "sphere_events_total";
    pub const EVENTS_BYTES: &str = "sphere_events_bytes";
    pub const DELIVERIES_TOTAL: &str = "sphere_deliveries_total";
    pub const AUTH_FAILURES_TOTAL: &str = "sphere_auth_failures_total";
    pub const LATENCY_SECONDS: &str = "sphere_latency_seconds";
    pub const ERRORS_TOTAL: &str = "sphere_errors_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of gateway connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of open gateway connections"
    );
    metrics::describe_gauge!(names::ONLINE_USERS, "Identities currently in presence");
    metrics::describe_counter!(names::EVENTS_TOTAL, "Gateway events by name and direction");
    metrics::describe_counter!(names::EVENTS_BYTES, "Bytes of gateway frames");
    metrics::describe_counter!(names::DELIVERIES_TOTAL, "Push attempts by outcome");
    metrics::describe_counter!(
        names::AUTH_FAILURES_TOTAL,
        "Rejected gateway handshakes and HTTP credentials"
    );
    metrics::describe_histogram!(
        names::LATENCY_SECONDS,
        "Inbound event handling latency in seconds"
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
    let addr: SocketAddr = format!("0.0.0.0:{port}").parse()?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record a new connection.
pub fn record_connection() {
    counter!(names::CONNECTIONS_TOTAL).increment(1);
    gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
}

/// Record a disconnection.
pub fn record_disconnection() {
    gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
}

/// Update the number of online identities.
pub fn set_online_users(count: usize) {
    gauge!(names::ONLINE_USERS).set(count as f64);
}

/// Record a gateway event.
pub fn record_event(event: &'static str, direction: &'static str, bytes: usize) {
    counter!(names::EVENTS_TOTAL, "event" => event, "direction" => direction).increment(1);
    counter!(names::EVENTS_BYTES, "direction" => direction).increment(bytes as u64);
}

/// Record a push attempt.
pub fn record_delivery(outcome: &'static str) {
    counter!(names::DELIVERIES_TOTAL, "outcome" => outcome).increment(1);
}

/// Record a rejected credential.
pub fn record_auth_failure(surface: &'static str) {
    counter!(names::AUTH_FAILURES_TOTAL, "surface" => surface).increment(1);
}

/// Record event handling latency.
pub fn record_latency(seconds: f64) {
    histogram!(names::LATENCY_SECONDS).record(seconds);
}

/// Record an error.
pub fn record_error(error_type: &'static str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type).increment(1);
}

/// Metrics guard that records disconnection on drop.
pub struct ConnectionMetricsGuard;

impl ConnectionMetricsGuard {
    /// Create a new metrics guard, recording a connection.
    #[must_use]
    pub fn new() -> Self {
        record_connection();
        Self
    }
}

impl Default for ConnectionMetricsGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ConnectionMetricsGuard {
    fn drop(&mut self) {
        record_disconnection();
    }
}
