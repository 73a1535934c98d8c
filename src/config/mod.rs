//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse, deserialize, environment overrides)
//!     → validation.rs (semantic checks)
//!     → TelemetryConfig (validated, immutable)
//!     → shared with bootstrap, lifecycle interceptor and call engine
//! ```
//!
//! # Design Decisions
//! - Config is validated once at load; use sites never re-check it
//! - All fields except `service_name` have defaults
//! - Per-target retry and breaker settings fall back to the top-level ones

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_config, parse_config, ConfigError};
pub use schema::{
    CircuitBreakerConfig, InstrumentationConfig, ListenerConfig, LogFormat, ObservabilityConfig,
    RetryConfig, TargetConfig, TelemetryConfig,
};
