//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (startup.rs):
//!     Load config → Install logging → Install metrics → Build tracer + exporter
//!
//! Shutdown (shutdown.rs):
//!     Signal received → Stop accepting → Drain requests → Flush spans → Exit
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Trigger graceful shutdown
//! ```
//!
//! # Design Decisions
//! - Ordered startup: logging first so later steps can report
//! - Ordered shutdown: stop accept, drain, flush telemetry last
//! - Telemetry owns no request state, only process lifetime

pub mod shutdown;
pub mod signals;
pub mod startup;

pub use shutdown::Shutdown;
pub use startup::{init_telemetry, BootstrapError, TelemetryGuard};
