//! Metrics collection and exposition.
//!
//! # Metrics
//! - `http_server_requests_total` (counter): inbound requests by method, route, status class
//! - `http_server_request_duration_seconds` (histogram): inbound latency
//! - `http_client_requests_total` (counter): outbound calls by target, method, status
//! - `http_client_request_duration_seconds` (histogram): outbound latency incl. retries
//! - `http_client_errors_total` (counter): outbound calls that ended in an error
//! - `http_client_retries_total` (counter): retry attempts scheduled
//! - `circuit_breaker_state` (gauge): 0=closed, 1=half_open, 2=open
//! - `circuit_breaker_transitions_total` (counter): state changes
//! - `circuit_breaker_rejections_total` (counter): calls short-circuited
//!
//! Without an installed recorder every update is a no-op.

use std::net::SocketAddr;
use std::time::Duration;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder};

use crate::resilience::circuit_breaker::BreakerState;

const LATENCY_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
];

/// Install the Prometheus recorder and its scrape listener.
pub fn init_metrics(addr: SocketAddr, upkeep: Duration) -> Result<(), BuildError> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .upkeep_timeout(upkeep)
        .set_buckets_for_metric(
            Matcher::Suffix("duration_seconds".to_string()),
            LATENCY_BUCKETS,
        )?
        .install()?;
    tracing::info!(address = %addr, "Prometheus metrics endpoint listening");
    Ok(())
}

/// Status class label ("2xx", "5xx", ...).
pub fn status_bucket(status: u16) -> &'static str {
    match status {
        100..=199 => "1xx",
        200..=299 => "2xx",
        300..=399 => "3xx",
        400..=499 => "4xx",
        500..=599 => "5xx",
        _ => "unknown",
    }
}

/// Record a completed inbound request.
pub fn record_http_request(method: &str, route: &str, status: u16, duration: Duration) {
    let labels = [
        ("method", method.to_string()),
        ("route", route.to_string()),
        ("status_code", status_bucket(status).to_string()),
    ];
    counter!("http_server_requests_total", &labels).increment(1);
    histogram!("http_server_request_duration_seconds", &labels).record(duration.as_secs_f64());
}

/// Record the final outcome of an outbound call.
///
/// `status` is the final HTTP status, or a failure label ("timeout",
/// "network", "circuit_open") when no response was received.
pub fn record_outbound_call(target: &str, method: &str, status: &str, duration: Duration, failed: bool) {
    let labels = [
        ("target", target.to_string()),
        ("method", method.to_string()),
        ("status_code", status.to_string()),
    ];
    counter!("http_client_requests_total", &labels).increment(1);
    histogram!("http_client_request_duration_seconds", &labels).record(duration.as_secs_f64());
    if failed {
        counter!("http_client_errors_total", &labels).increment(1);
    }
}

pub fn record_retry(target: &str) {
    counter!("http_client_retries_total", "target" => target.to_string()).increment(1);
}

pub fn record_breaker_state(target: &str, state: BreakerState) {
    let value = match state {
        BreakerState::Closed => 0.0,
        BreakerState::HalfOpen => 1.0,
        BreakerState::Open => 2.0,
    };
    gauge!("circuit_breaker_state", "target" => target.to_string()).set(value);
}

pub fn record_breaker_transition(target: &str, from: BreakerState, to: BreakerState) {
    counter!(
        "circuit_breaker_transitions_total",
        "target" => target.to_string(),
        "from" => from.as_str(),
        "to" => to.as_str()
    )
    .increment(1);
    record_breaker_state(target, to);
}

pub fn record_breaker_rejection(target: &str) {
    counter!("circuit_breaker_rejections_total", "target" => target.to_string()).increment(1);
}
