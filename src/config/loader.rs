//! Configuration loading from disk and environment.

use std::fs;
use std::path::Path;

use crate::config::schema::TelemetryConfig;
use crate::config::validation::{validate_config, ValidationError};

/// Error type for configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Validation failed: {}", join_errors(.0))]
    Validation(Vec<ValidationError>),
}

fn join_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Environment variables that override file values.
pub const ENV_SERVICE_NAME: &str = "OTEL_SERVICE_NAME";
pub const ENV_ENVIRONMENT: &str = "APP_ENV";
pub const ENV_EXPORTER_ENDPOINT: &str = "OTEL_EXPORTER_OTLP_ENDPOINT";
pub const ENV_LOG_LEVEL: &str = "LOG_LEVEL";

/// Load, apply environment overrides, and validate configuration from a TOML file.
pub fn load_config(path: &Path) -> Result<TelemetryConfig, ConfigError> {
    let content = fs::read_to_string(path)?;
    parse_config(&content, |key| std::env::var(key).ok())
}

/// Parse and validate configuration from TOML text.
pub fn parse_config(
    content: &str,
    env: impl Fn(&str) -> Option<String>,
) -> Result<TelemetryConfig, ConfigError> {
    let mut config: TelemetryConfig = toml::from_str(content)?;
    apply_env_overrides(&mut config, env);
    validate_config(&config).map_err(ConfigError::Validation)?;
    Ok(config)
}

/// Overwrite fields with non-empty values from `env`.
pub fn apply_env_overrides(config: &mut TelemetryConfig, env: impl Fn(&str) -> Option<String>) {
    let env = |key: &str| env(key).filter(|v| !v.trim().is_empty());

    if let Some(name) = env(ENV_SERVICE_NAME) {
        config.service_name = name;
    }
    if let Some(environment) = env(ENV_ENVIRONMENT) {
        config.environment = environment;
    }
    if let Some(endpoint) = env(ENV_EXPORTER_ENDPOINT) {
        config.observability.exporter_endpoint = Some(endpoint);
    }
    if let Some(level) = env(ENV_LOG_LEVEL) {
        config.observability.log_level = level;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::LogFormat;

    const SAMPLE: &str = r#"
        service_name = "checkout"
        environment = "staging"

        [observability]
        log_level = "debug"
        log_format = "pretty"

        [instrumentation]
        exclude_paths = ["/health", "/ready"]

        [retries]
        max_attempts = 4
        base_delay_ms = 250

        [[targets]]
        name = "payments"
        base_url = "http://payments:8080"
        timeout_ms = 2000

        [targets.circuit_breaker]
        error_threshold_percentage = 25
        volume_threshold = 20
        reset_timeout_ms = 5000
    "#;

    #[test]
    fn parses_full_file() {
        let config = parse_config(SAMPLE, |_| None).unwrap();
        assert_eq!(config.service_name, "checkout");
        assert_eq!(config.observability.log_format, LogFormat::Pretty);
        assert_eq!(config.instrumentation.exclude_paths, vec!["/health", "/ready"]);
        assert_eq!(config.retries.max_attempts, 4);
        assert_eq!(config.retries.max_delay_ms, 30_000);

        let target = &config.targets[0];
        assert_eq!(target.timeout_ms, 2000);
        let breaker = config.breaker_for(target);
        assert_eq!(breaker.error_threshold_percentage, 25);
        // Unset fields fall back to defaults.
        assert_eq!(breaker.rolling_window_ms, 10_000);
        assert_eq!(config.retry_for(target).max_attempts, 4);
    }

    #[test]
    fn environment_overrides_file() {
        let config = parse_config(SAMPLE, |key| match key {
            ENV_SERVICE_NAME => Some("checkout-canary".into()),
            ENV_LOG_LEVEL => Some("warn".into()),
            ENV_ENVIRONMENT => Some(String::new()),
            _ => None,
        })
        .unwrap();
        assert_eq!(config.service_name, "checkout-canary");
        assert_eq!(config.observability.log_level, "warn");
        assert_eq!(config.environment, "staging");
    }

    #[test]
    fn missing_service_name_fails_validation() {
        let err = parse_config("", |_| None).unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
        assert!(err.to_string().contains("service_name"));
    }
}
