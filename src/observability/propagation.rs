//! W3C Trace Context propagation over HTTP headers.
//!
//! Reads and writes the `traceparent` / `tracestate` pair through the SDK's
//! `TraceContextPropagator`, so the wire format matches every other W3C peer.

use axum::http::header::{HeaderMap, HeaderName, HeaderValue};
use opentelemetry::propagation::{Extractor, Injector, TextMapPropagator};
use opentelemetry::trace::{SpanContext, TraceContextExt};
use opentelemetry::Context;
use opentelemetry_sdk::propagation::TraceContextPropagator;

pub const TRACEPARENT: &str = "traceparent";
pub const TRACESTATE: &str = "tracestate";

/// Extracts a remote parent from inbound headers.
///
/// Returns `None` when the headers carry no valid `traceparent`.
pub fn extract(headers: &HeaderMap) -> Option<SpanContext> {
    let cx = TraceContextPropagator::new()
        .extract_with_context(&Context::new(), &HeaderExtractor(headers));
    let span_context = cx.span().span_context().clone();
    span_context.is_valid().then_some(span_context)
}

/// Writes `span_context` into outbound headers. Invalid contexts write nothing.
pub fn inject(span_context: &SpanContext, headers: &mut HeaderMap) {
    let cx = Context::new().with_remote_span_context(span_context.clone());
    TraceContextPropagator::new().inject_context(&cx, &mut HeaderInjector(headers));
}

/// Extractor for reading headers from an http HeaderMap.
struct HeaderExtractor<'a>(&'a HeaderMap);

impl Extractor for HeaderExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|v| v.to_str().ok())
    }

    fn keys(&self) -> Vec<&str> {
        self.0.keys().map(HeaderName::as_str).collect()
    }
}

/// Injector for writing headers to an http HeaderMap.
struct HeaderInjector<'a>(&'a mut HeaderMap);

impl Injector for HeaderInjector<'_> {
    fn set(&mut self, key: &str, value: String) {
        if value.is_empty() {
            return;
        }
        let name = match HeaderName::from_bytes(key.as_bytes()) {
            Ok(name) => name,
            Err(e) => {
                tracing::debug!("Failed to create header name for trace injection: {:?}", e);
                return;
            }
        };
        let value = match HeaderValue::from_str(&value) {
            Ok(value) => value,
            Err(e) => {
                tracing::debug!("Failed to create header value for trace injection: {:?}", e);
                return;
            }
        };
        self.0.insert(name, value);
    }
}
