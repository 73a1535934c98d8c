//! Request-scoped observability and resilient outbound calls.
//!
//! Carries a correlation id and a W3C trace identity through every inbound
//! request and the outbound calls it makes, and wraps those calls with retries
//! and per-target circuit breakers.

pub mod config;
pub mod context;
pub mod http;
pub mod lifecycle;
pub mod observability;
pub mod resilience;

pub use config::schema::TelemetryConfig;
pub use context::RequestContext;
pub use http::HttpServer;
pub use lifecycle::{init_telemetry, Shutdown, TelemetryGuard};
pub use resilience::{CallError, ClientRegistry, ResilientClient};
