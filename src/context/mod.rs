//! Request-scoped context.
//!
//! # Data Flow
//! ```text
//! lifecycle interceptor builds RequestContext
//!     → store.rs installs it for the handler future (task-local)
//!     → any code in that task reads it via current()
//!     → call engine reads it to inject traceparent / x-request-id
//! ```
//!
//! # Design Decisions
//! - Contexts are immutable; narrowing produces a new value
//! - Storage is per tokio task, not per thread, so it survives every `.await`
//! - Task hand-off (`tokio::spawn`) does not inherit the context; use
//!   [`spawn`] or [`ContextExt::in_current_context`] at those points

mod store;

use std::sync::Arc;
use std::time::{Duration, Instant};

use opentelemetry::trace::{SpanContext, SpanId, TraceId};

pub use store::{
    correlation_id, current, run_with_context, spawn, with_context_sync, ContextExt, InContext,
};

/// Identity of one inbound request, visible to all code handling it.
#[derive(Debug, Clone)]
pub struct RequestContext {
    correlation_id: Arc<str>,
    span_context: SpanContext,
    started_at: Instant,
}

impl RequestContext {
    /// Create a context starting now.
    pub fn new(correlation_id: impl Into<Arc<str>>, span_context: SpanContext) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            span_context,
            started_at: Instant::now(),
        }
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub fn span_context(&self) -> &SpanContext {
        &self.span_context
    }

    pub fn trace_id(&self) -> TraceId {
        self.span_context.trace_id()
    }

    pub fn span_id(&self) -> SpanId {
        self.span_context.span_id()
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    /// Time since the request was received.
    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// A narrower context for a child span. Correlation id and start time carry over.
    pub fn with_span(&self, span_context: SpanContext) -> Self {
        Self {
            correlation_id: Arc::clone(&self.correlation_id),
            span_context,
            started_at: self.started_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opentelemetry::trace::{TraceFlags, TraceState};

    fn span(trace: u128, span: u64) -> SpanContext {
        SpanContext::new(
            TraceId::from_bytes(trace.to_be_bytes()),
            SpanId::from_bytes(span.to_be_bytes()),
            TraceFlags::SAMPLED,
            false,
            TraceState::default(),
        )
    }

    #[test]
    fn with_span_keeps_correlation_and_start() {
        let outer = RequestContext::new("req-1", span(1, 1));
        let inner = outer.with_span(span(1, 2));

        assert_eq!(inner.correlation_id(), "req-1");
        assert_eq!(inner.started_at(), outer.started_at());
        assert_eq!(inner.span_id(), SpanId::from_bytes(2u64.to_be_bytes()));
        assert_eq!(outer.span_id(), SpanId::from_bytes(1u64.to_be_bytes()));
    }
}
