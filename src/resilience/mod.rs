//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Outbound call:
//!     → client.rs (header injection, attempt loop, outcome recording)
//!     → circuit_breaker.rs (admission per attempt, rolling failure stats)
//!     → timeouts.rs (deadline per attempt)
//!     → On failure: retries.rs (retry predicate) + backoff.rs (delay)
//! ```
//!
//! # Design Decisions
//! - Retries are invisible to the caller; only the final outcome surfaces
//! - An open breaker rejects before any attempt or backoff
//! - Circuit-open and call failure are distinct error kinds

pub mod backoff;
pub mod circuit_breaker;
pub mod client;
pub mod error;
pub mod retries;
pub mod timeouts;

pub use circuit_breaker::{BreakerRegistry, BreakerSnapshot, BreakerState, CircuitBreaker};
pub use client::{ClientRegistry, OutboundRequest, OutboundResponse, ResilientClient};
pub use error::{CallError, ClientBuildError};
pub use retries::{AttemptFailure, RetryPolicy};
