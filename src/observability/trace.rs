//! Span lifecycle.
//!
//! # Responsibilities
//! - Allocate trace/span ids through the SDK id generator
//! - Continue a remote parent or start a new root trace
//! - Guarantee every opened span is exported exactly once
//!
//! # Design Decisions
//! - `Span::end` consumes the span; dropping an un-ended span ends it, so
//!   early returns and unwinding still close it
//! - Export is synchronous and infallible from the caller's point of view;
//!   exporters isolate their own failures

use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use opentelemetry::trace::{
    SpanContext, SpanId, SpanKind, Status, TraceFlags, TraceId, TraceState,
};
use opentelemetry::KeyValue;
use opentelemetry_sdk::trace::{IdGenerator, RandomIdGenerator};

use crate::observability::exporter::{NoopExporter, SpanExporter};

/// A timestamped annotation on a span.
#[derive(Debug, Clone)]
pub struct SpanEvent {
    pub name: Cow<'static, str>,
    pub timestamp: SystemTime,
    pub attributes: Vec<KeyValue>,
}

/// A closed span, as handed to exporters.
#[derive(Debug, Clone)]
pub struct FinishedSpan {
    pub name: String,
    pub kind: SpanKind,
    pub span_context: SpanContext,
    /// `SpanId::INVALID` for root spans.
    pub parent_span_id: SpanId,
    pub start_time: SystemTime,
    pub end_time: SystemTime,
    pub duration: Duration,
    pub attributes: Vec<KeyValue>,
    pub events: Vec<SpanEvent>,
    pub status: Status,
}

impl FinishedSpan {
    pub fn attribute(&self, key: &str) -> Option<&opentelemetry::Value> {
        self.attributes
            .iter()
            .find(|kv| kv.key.as_str() == key)
            .map(|kv| &kv.value)
    }
}

struct SpanData {
    name: String,
    kind: SpanKind,
    parent_span_id: SpanId,
    start_time: SystemTime,
    attributes: Vec<KeyValue>,
    events: Vec<SpanEvent>,
    status: Status,
}

/// An open unit of traced work.
pub struct Span {
    span_context: SpanContext,
    started: Instant,
    data: Option<SpanData>,
    exporter: Arc<dyn SpanExporter>,
}

impl Span {
    pub fn span_context(&self) -> &SpanContext {
        &self.span_context
    }

    /// False once the span has been ended.
    pub fn is_recording(&self) -> bool {
        self.data.is_some()
    }

    pub fn set_attribute(&mut self, attribute: KeyValue) {
        if let Some(data) = self.data.as_mut() {
            match data.attributes.iter_mut().find(|kv| kv.key == attribute.key) {
                Some(existing) => *existing = attribute,
                None => data.attributes.push(attribute),
            }
        }
    }

    pub fn set_status(&mut self, status: Status) {
        if let Some(data) = self.data.as_mut() {
            data.status = status;
        }
    }

    pub fn add_event(&mut self, name: impl Into<Cow<'static, str>>, attributes: Vec<KeyValue>) {
        if let Some(data) = self.data.as_mut() {
            data.events.push(SpanEvent {
                name: name.into(),
                timestamp: SystemTime::now(),
                attributes,
            });
        }
    }

    /// Record an `exception` event following the semantic conventions.
    pub fn record_exception(&mut self, message: &str, detail: Option<&str>) {
        let mut attributes = vec![KeyValue::new("exception.message", message.to_owned())];
        if let Some(detail) = detail {
            attributes.push(KeyValue::new("exception.stacktrace", detail.to_owned()));
        }
        self.add_event("exception", attributes);
    }

    /// Close the span and hand it to the exporter.
    pub fn end(mut self) {
        self.finish();
    }

    fn finish(&mut self) {
        let Some(data) = self.data.take() else {
            return;
        };
        let duration = self.started.elapsed();
        self.exporter.export(FinishedSpan {
            name: data.name,
            kind: data.kind,
            span_context: self.span_context.clone(),
            parent_span_id: data.parent_span_id,
            start_time: data.start_time,
            end_time: data.start_time + duration,
            duration,
            attributes: data.attributes,
            events: data.events,
            status: data.status,
        });
    }
}

impl Drop for Span {
    fn drop(&mut self) {
        self.finish();
    }
}

impl fmt::Debug for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Span")
            .field("trace_id", &self.span_context.trace_id())
            .field("span_id", &self.span_context.span_id())
            .field("recording", &self.is_recording())
            .finish()
    }
}

/// Opens spans and routes them to an exporter.
#[derive(Clone, Debug)]
pub struct Tracer {
    ids: Arc<dyn IdGenerator>,
    exporter: Arc<dyn SpanExporter>,
}

impl Tracer {
    pub fn new(exporter: Arc<dyn SpanExporter>) -> Self {
        Self {
            ids: Arc::new(RandomIdGenerator::default()),
            exporter,
        }
    }

    /// A tracer whose spans go nowhere.
    pub fn noop() -> Self {
        Self::new(Arc::new(NoopExporter))
    }

    pub fn with_id_generator(mut self, ids: impl IdGenerator + 'static) -> Self {
        self.ids = Arc::new(ids);
        self
    }

    /// Open a span. A valid `parent` is continued, otherwise a new trace starts.
    pub fn start(
        &self,
        name: impl Into<String>,
        kind: SpanKind,
        parent: Option<&SpanContext>,
    ) -> Span {
        let (trace_id, parent_span_id, flags, state) = match parent.filter(|p| p.is_valid()) {
            Some(parent) => (
                parent.trace_id(),
                parent.span_id(),
                parent.trace_flags(),
                parent.trace_state().clone(),
            ),
            None => (
                self.new_trace_id(),
                SpanId::INVALID,
                TraceFlags::SAMPLED,
                TraceState::default(),
            ),
        };

        let span_context =
            SpanContext::new(trace_id, self.ids.new_span_id(), flags, false, state);

        Span {
            span_context,
            started: Instant::now(),
            data: Some(SpanData {
                name: name.into(),
                kind,
                parent_span_id,
                start_time: SystemTime::now(),
                attributes: Vec::new(),
                events: Vec::new(),
                status: Status::Unset,
            }),
            exporter: Arc::clone(&self.exporter),
        }
    }

    fn new_trace_id(&self) -> TraceId {
        self.ids.new_trace_id()
    }
}
