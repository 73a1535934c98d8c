//! Configuration validation.
//!
//! Serde handles syntax; this module checks value ranges and referential
//! integrity, returning every problem found rather than stopping at the first.

use std::collections::HashSet;
use std::fmt;

use url::Url;

use crate::config::schema::{CircuitBreakerConfig, RetryConfig, TelemetryConfig};

/// A single semantic problem in a configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Validate a configuration.
pub fn validate_config(config: &TelemetryConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.service_name.trim().is_empty() {
        errors.push(ValidationError::new("service_name", "must not be empty"));
    }

    if let Some(endpoint) = &config.observability.exporter_endpoint {
        if Url::parse(endpoint).is_err() {
            errors.push(ValidationError::new(
                "observability.exporter_endpoint",
                format!("invalid URL `{endpoint}`"),
            ));
        }
    }

    if let Some(addr) = &config.observability.metrics_address {
        if addr.parse::<std::net::SocketAddr>().is_err() {
            errors.push(ValidationError::new(
                "observability.metrics_address",
                format!("invalid socket address `{addr}`"),
            ));
        }
    }

    if config.observability.metrics_export_interval_secs == 0 {
        errors.push(ValidationError::new(
            "observability.metrics_export_interval_secs",
            "must be greater than zero",
        ));
    }

    for (i, prefix) in config.instrumentation.exclude_paths.iter().enumerate() {
        if !prefix.starts_with('/') {
            errors.push(ValidationError::new(
                format!("instrumentation.exclude_paths[{i}]"),
                "must start with `/`",
            ));
        }
    }

    check_retry("retries", &config.retries, &mut errors);
    check_breaker("circuit_breaker", &config.circuit_breaker, &mut errors);

    let mut seen = HashSet::new();
    for (i, target) in config.targets.iter().enumerate() {
        let prefix = format!("targets[{i}]");
        if target.name.trim().is_empty() {
            errors.push(ValidationError::new(format!("{prefix}.name"), "must not be empty"));
        } else if !seen.insert(target.name.as_str()) {
            errors.push(ValidationError::new(
                format!("{prefix}.name"),
                format!("duplicate target `{}`", target.name),
            ));
        }

        match Url::parse(&target.base_url) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => {}
            Ok(url) => errors.push(ValidationError::new(
                format!("{prefix}.base_url"),
                format!("unsupported scheme `{}`", url.scheme()),
            )),
            Err(e) => errors.push(ValidationError::new(
                format!("{prefix}.base_url"),
                format!("invalid URL `{}`: {e}", target.base_url),
            )),
        }

        if target.timeout_ms == 0 {
            errors.push(ValidationError::new(
                format!("{prefix}.timeout_ms"),
                "must be greater than zero",
            ));
        }
        if let Some(retry) = &target.retry {
            check_retry(&format!("{prefix}.retry"), retry, &mut errors);
        }
        if let Some(breaker) = &target.circuit_breaker {
            check_breaker(&format!("{prefix}.circuit_breaker"), breaker, &mut errors);
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn check_retry(prefix: &str, retry: &RetryConfig, errors: &mut Vec<ValidationError>) {
    if retry.max_attempts == 0 {
        errors.push(ValidationError::new(
            format!("{prefix}.max_attempts"),
            "must be at least 1",
        ));
    }
    if retry.max_delay_ms < retry.base_delay_ms {
        errors.push(ValidationError::new(
            format!("{prefix}.max_delay_ms"),
            "must not be smaller than base_delay_ms",
        ));
    }
    for code in &retry.retryable_status_codes {
        if !(100..=599).contains(code) {
            errors.push(ValidationError::new(
                format!("{prefix}.retryable_status_codes"),
                format!("`{code}` is not an HTTP status code"),
            ));
        }
    }
}

fn check_breaker(prefix: &str, breaker: &CircuitBreakerConfig, errors: &mut Vec<ValidationError>) {
    if breaker.error_threshold_percentage == 0 || breaker.error_threshold_percentage > 100 {
        errors.push(ValidationError::new(
            format!("{prefix}.error_threshold_percentage"),
            "must be within 1..=100",
        ));
    }
    if breaker.reset_timeout_ms == 0 {
        errors.push(ValidationError::new(
            format!("{prefix}.reset_timeout_ms"),
            "must be greater than zero",
        ));
    }
    if breaker.rolling_window_ms == 0 {
        errors.push(ValidationError::new(
            format!("{prefix}.rolling_window_ms"),
            "must be greater than zero",
        ));
    }
}
