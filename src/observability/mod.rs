//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → logging.rs (structured log events)
//!     → metrics.rs (counters, gauges, histograms)
//!     → trace.rs (spans carrying trace/span ids)
//!
//! Spans leave through:
//!     → exporter.rs (log, in-memory, or batched HTTP)
//!
//! Trace identity crosses process boundaries through:
//!     → propagation.rs (W3C traceparent/tracestate headers)
//! ```
//!
//! # Design Decisions
//! - Structured logging (JSON) for machine parsing
//! - Correlation and trace ids flow through all subsystems
//! - Metrics are cheap (atomic increments)
//! - Export is fire-and-forget; a broken collector never fails a request

pub mod exporter;
pub mod logging;
pub mod metrics;
pub mod propagation;
pub mod trace;

pub use exporter::{HttpExporter, InMemoryExporter, LogExporter, NoopExporter, Resource, SpanExporter};
pub use trace::{FinishedSpan, Span, Tracer};
