//! Prometheus metrics recording and endpoint.

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

use crate::governor::{GovernorError, Permit};

/// Install the Prometheus metrics recorder and return the handle for rendering.
///
/// Fails if a recorder is already installed in this process.
pub fn install_prometheus_recorder() -> Result<PrometheusHandle, BuildError> {
    PrometheusBuilder::new().install_recorder()
}

/// Record a new WebSocket connection.
pub fn record_ws_connect() {
    metrics::gauge!("ws_connections_active").increment(1.0);
}

/// Record a WebSocket disconnection.
pub fn record_ws_disconnect() {
    metrics::gauge!("ws_connections_active").decrement(1.0);
}

/// Record a WS method request with its duration.
pub fn record_request(method: &str, duration_secs: f64) {
    let labels = [("method", method.to_string())];
    metrics::counter!("ws_requests_total", &labels).increment(1);
    metrics::histogram!("ws_request_duration_seconds", &labels).record(duration_secs);
}

/// Record a rate limiter denial.
pub fn record_denial(class: &str) {
    let labels = [("class", class.to_string())];
    metrics::counter!("rate_limit_denials_total", &labels).increment(1);
}

pub fn record_auth_failure() {
    metrics::counter!("auth_failures_total").increment(1);
}

/// Record how a governor acquisition ended.
pub fn record_governor_outcome(governor: &str, outcome: &Result<Permit, GovernorError>) {
    let result = match outcome {
        Ok(_) => "granted",
        Err(GovernorError::QueueTimeout { .. }) => "timeout",
        Err(GovernorError::Saturated { .. }) => "saturated",
        Err(GovernorError::Closed(_)) => "closed",
    };
    let labels = [
        ("governor", governor.to_string()),
        ("result", result.to_string()),
    ];
    metrics::counter!("governor_acquisitions_total", &labels).increment(1);
}

/// Record an interrupt lifecycle event (`interrupt.requested`, `.resumed`, `.expired`).
pub fn record_interrupt(event: &str) {
    let labels = [("event", event.to_string())];
    metrics::counter!("interrupts_total", &labels).increment(1);
}
