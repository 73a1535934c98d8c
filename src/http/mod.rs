//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP connection
//!     → server.rs (Axum setup, layers)
//!     → middleware.rs (drives the lifecycle hooks around the handler)
//!     → request.rs (correlation id, route template)
//!     → lifecycle.rs (context + span open, logs/metrics, span close)
//!     → handler (relay through the resilient client, admin, health)
//!     → response carries x-request-id
//! ```

pub mod lifecycle;
pub mod middleware;
pub mod request;
pub mod server;

pub use lifecycle::{install_panic_hook, HandlerFailure, InFlightRequest, RequestLifecycle, RequestPhase};
pub use request::{extract_or_generate_correlation_id, InboundRequest, X_REQUEST_ID};
pub use server::{build_router, AppState, HttpServer};
