//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the service.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};

/// Root configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Identifies the process in all telemetry. Required.
    pub service_name: String,

    /// Deployment environment (e.g., "production", "staging").
    pub environment: String,

    /// Listener configuration for the service binary.
    pub listener: ListenerConfig,

    /// Logging and exporter settings.
    pub observability: ObservabilityConfig,

    /// Inbound request instrumentation.
    pub instrumentation: InstrumentationConfig,

    /// Retry settings applied to targets that do not override them.
    pub retries: RetryConfig,

    /// Circuit breaker settings applied to targets that do not override them.
    pub circuit_breaker: CircuitBreakerConfig,

    /// Downstream targets reachable through the resilient call engine.
    pub targets: Vec<TargetConfig>,
}

impl TelemetryConfig {
    /// Effective retry configuration for a target.
    pub fn retry_for(&self, target: &TargetConfig) -> RetryConfig {
        target.retry.clone().unwrap_or_else(|| self.retries.clone())
    }

    /// Effective circuit breaker configuration for a target.
    pub fn breaker_for(&self, target: &TargetConfig) -> CircuitBreakerConfig {
        target
            .circuit_breaker
            .clone()
            .unwrap_or_else(|| self.circuit_breaker.clone())
    }
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    pub bind_address: String,

    /// Inbound request timeout in seconds.
    pub request_timeout_secs: u64,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            request_timeout_secs: 60,
        }
    }
}

/// Output format for log lines.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Log line format.
    pub log_format: LogFormat,

    /// Endpoint finished spans are POSTed to. Spans are logged when unset.
    pub exporter_endpoint: Option<String>,

    /// Flush interval for exporters in seconds.
    pub metrics_export_interval_secs: u64,

    /// Prometheus scrape endpoint bind address. Disabled when unset.
    pub metrics_address: Option<String>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Json,
            exporter_endpoint: None,
            metrics_export_interval_secs: 10,
            metrics_address: None,
        }
    }
}

/// Inbound instrumentation configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct InstrumentationConfig {
    /// Path prefixes that skip span creation and metric recording.
    pub exclude_paths: Vec<String>,
}

impl Default for InstrumentationConfig {
    fn default() -> Self {
        Self {
            exclude_paths: vec!["/health".to_string(), "/metrics".to_string()],
        }
    }
}

/// Retry configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts including the first one.
    pub max_attempts: u32,

    /// Base delay for exponential backoff in milliseconds.
    pub base_delay_ms: u64,

    /// Maximum delay for exponential backoff in milliseconds.
    pub max_delay_ms: u64,

    /// Response statuses that are retried.
    pub retryable_status_codes: Vec<u16>,

    /// Add up to 10% random jitter to each delay.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 100,
            max_delay_ms: 30_000,
            retryable_status_codes: vec![408, 429, 500, 502, 503, 504],
            jitter: false,
        }
    }
}

/// Circuit breaker configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Failure percentage at or above which the breaker opens.
    pub error_threshold_percentage: u8,

    /// Minimum samples in the window before the breaker may open.
    pub volume_threshold: u32,

    /// Time spent open before a half-open probe is allowed.
    pub reset_timeout_ms: u64,

    /// Length of the rolling statistics window.
    pub rolling_window_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            error_threshold_percentage: 50,
            volume_threshold: 10,
            reset_timeout_ms: 30_000,
            rolling_window_ms: 10_000,
        }
    }
}

/// A downstream target.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TargetConfig {
    /// Service name used in logs, metrics and breaker keys.
    pub name: String,

    /// Base address (e.g., "http://inventory:8080").
    pub base_url: String,

    /// Per-attempt timeout in milliseconds.
    #[serde(default = "default_target_timeout_ms")]
    pub timeout_ms: u64,

    /// Overrides the top-level retry settings.
    #[serde(default)]
    pub retry: Option<RetryConfig>,

    /// Overrides the top-level circuit breaker settings.
    #[serde(default)]
    pub circuit_breaker: Option<CircuitBreakerConfig>,
}

fn default_target_timeout_ms() -> u64 {
    10_000
}

impl TargetConfig {
    /// Target with default timeout and no overrides.
    pub fn new(name: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into(),
            timeout_ms: default_target_timeout_ms(),
            retry: None,
            circuit_breaker: None,
        }
    }
}
