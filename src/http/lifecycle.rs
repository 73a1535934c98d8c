//! Request lifecycle hooks.
//!
//! # State Machine
//! ```text
//! received → processing → completed
//!                       → failed
//! ```
//!
//! [`RequestLifecycle::on_request_start`] performs `received → processing` and
//! hands back an [`InFlightRequest`]. Its terminal hooks take `self`, so a
//! request can end only once, and either as completed or as failed.
//!
//! # Design Decisions
//! - Logs and metrics are recorded before the span closes, from one duration
//! - Excluded routes get no context, span or metrics but still complete
//! - An in-flight request dropped without a terminal hook (cancelled by a
//!   timeout or a disconnect) fails with a "cancelled" status

use std::backtrace::{Backtrace, BacktraceStatus};
use std::cell::RefCell;
use std::sync::{Arc, Once};
use std::time::{Duration, Instant};

use axum::http::{Method, StatusCode};
use opentelemetry::trace::{SpanKind, Status};
use opentelemetry::KeyValue;

use crate::context::RequestContext;
use crate::http::request::{extract_or_generate_correlation_id, InboundRequest};
use crate::observability::metrics;
use crate::observability::propagation;
use crate::observability::trace::{Span, Tracer};

/// Phase of one inbound request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestPhase {
    Processing,
    Completed,
    Failed,
}

/// An error raised by the handler before it produced a response.
#[derive(Debug, Clone)]
pub struct HandlerFailure {
    pub message: String,
    pub detail: Option<String>,
}

impl HandlerFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// Describe a caught panic payload.
    ///
    /// The detail is the panic location, plus a backtrace when
    /// `RUST_BACKTRACE` enables one, as recorded by [`install_panic_hook`] on
    /// the panicking thread.
    pub fn from_panic(payload: &(dyn std::any::Any + Send)) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "handler panicked".to_string()
        };
        let failure = Self::new(message);
        match LAST_PANIC.try_with(|slot| slot.borrow_mut().take()).ok().flatten() {
            Some(detail) => failure.with_detail(detail),
            None => failure,
        }
    }
}

thread_local! {
    static LAST_PANIC: RefCell<Option<String>> = const { RefCell::new(None) };
}

/// Record the location of every panic for [`HandlerFailure::from_panic`].
///
/// Chains to the previously installed hook. Installs once per process.
pub fn install_panic_hook() {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            let mut detail = match info.location() {
                Some(location) => format!("panicked at {location}"),
                None => "panicked".to_string(),
            };
            let backtrace = Backtrace::capture();
            if backtrace.status() == BacktraceStatus::Captured {
                detail.push('\n');
                detail.push_str(&backtrace.to_string());
            }
            let _ = LAST_PANIC.try_with(|slot| *slot.borrow_mut() = Some(detail));
            previous(info);
        }));
    });
}

/// Lifecycle hooks shared by every request of one service.
#[derive(Debug, Clone)]
pub struct RequestLifecycle {
    service: Arc<str>,
    tracer: Tracer,
    exclude: Arc<[String]>,
}

impl RequestLifecycle {
    /// Also installs the panic hook behind [`HandlerFailure::from_panic`].
    pub fn new(service: impl Into<Arc<str>>, tracer: Tracer, exclude: Vec<String>) -> Self {
        install_panic_hook();
        Self {
            service: service.into(),
            tracer,
            exclude: exclude.into(),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn tracer(&self) -> &Tracer {
        &self.tracer
    }

    /// Whether `path` falls under one of the excluded prefixes.
    pub fn is_excluded(&self, path: &str) -> bool {
        self.exclude.iter().any(|prefix| {
            path.strip_prefix(prefix.as_str()).is_some_and(|rest| {
                rest.is_empty() || rest.starts_with('/') || prefix.ends_with('/')
            })
        })
    }

    /// Begin handling a request: build its context and open its span.
    pub fn on_request_start(&self, request: &InboundRequest<'_>) -> InFlightRequest {
        let started = Instant::now();
        let method = request.method.clone();
        let route = request.route().to_owned();

        if self.is_excluded(request.path()) {
            return InFlightRequest {
                phase: RequestPhase::Processing,
                service: Arc::clone(&self.service),
                method,
                route,
                started,
                context: None,
                span: None,
            };
        }

        let correlation_id = extract_or_generate_correlation_id(request.headers);
        let parent = propagation::extract(request.headers);
        let url = request.uri.to_string();

        let mut span = self.tracer.start(
            format!("{method} {route}"),
            SpanKind::Server,
            parent.as_ref(),
        );
        span.set_attribute(KeyValue::new("http.method", method.to_string()));
        span.set_attribute(KeyValue::new("http.url", url.clone()));
        span.set_attribute(KeyValue::new("http.route", route.clone()));
        if let Some(user_agent) = request.user_agent() {
            span.set_attribute(KeyValue::new("http.user_agent", user_agent.to_owned()));
        }
        span.set_attribute(KeyValue::new("correlation_id", correlation_id.clone()));

        let context = Arc::new(RequestContext::new(correlation_id, span.span_context().clone()));

        tracing::info!(
            service = %self.service,
            correlation_id = %context.correlation_id(),
            trace_id = %context.trace_id(),
            span_id = %context.span_id(),
            method = %method,
            url = %url,
            "Request received"
        );

        InFlightRequest {
            phase: RequestPhase::Processing,
            service: Arc::clone(&self.service),
            method,
            route,
            started: context.started_at(),
            context: Some(context),
            span: Some(span),
        }
    }
}

/// A request between its start hook and its terminal hook.
#[derive(Debug)]
pub struct InFlightRequest {
    phase: RequestPhase,
    service: Arc<str>,
    method: Method,
    route: String,
    started: Instant,
    context: Option<Arc<RequestContext>>,
    span: Option<Span>,
}

impl InFlightRequest {
    pub fn phase(&self) -> RequestPhase {
        self.phase
    }

    /// Context to install for the handler; `None` for excluded routes.
    pub fn context(&self) -> Option<&Arc<RequestContext>> {
        self.context.as_ref()
    }

    pub fn is_excluded(&self) -> bool {
        self.context.is_none()
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.context.as_deref().map(RequestContext::correlation_id)
    }

    /// The handler produced a response (any status).
    pub fn on_request_end(mut self, status: StatusCode) -> RequestPhase {
        self.phase = RequestPhase::Completed;
        let duration = self.started.elapsed();
        let Some(context) = self.context.take() else {
            return self.phase;
        };

        tracing::info!(
            service = %self.service,
            correlation_id = %context.correlation_id(),
            trace_id = %context.trace_id(),
            span_id = %context.span_id(),
            status = status.as_u16(),
            duration_ms = millis(duration),
            "Request completed"
        );
        metrics::record_http_request(self.method.as_str(), &self.route, status.as_u16(), duration);

        if let Some(mut span) = self.span.take() {
            span.set_attribute(KeyValue::new("http.status_code", i64::from(status.as_u16())));
            span.set_attribute(KeyValue::new("http.duration_ms", millis(duration)));
            if status.as_u16() < 400 {
                span.set_status(Status::Ok);
            } else {
                span.set_status(Status::error(format!("HTTP {}", status.as_u16())));
            }
            span.end();
        }
        self.phase
    }

    /// The handler failed before producing a response.
    pub fn on_request_error(mut self, failure: &HandlerFailure) -> RequestPhase {
        self.phase = RequestPhase::Failed;
        self.fail(&failure.message, failure.detail.as_deref());
        self.phase
    }

    fn fail(&mut self, message: &str, detail: Option<&str>) {
        let duration = self.started.elapsed();
        let Some(context) = self.context.take() else {
            return;
        };

        tracing::error!(
            service = %self.service,
            correlation_id = %context.correlation_id(),
            trace_id = %context.trace_id(),
            span_id = %context.span_id(),
            method = %self.method,
            route = %self.route,
            duration_ms = millis(duration),
            error = %message,
            detail = detail.unwrap_or(""),
            "Request failed"
        );

        if let Some(mut span) = self.span.take() {
            span.set_attribute(KeyValue::new("http.duration_ms", millis(duration)));
            span.record_exception(message, detail);
            span.set_status(Status::error(message.to_owned()));
            span.end();
        }
    }
}

impl Drop for InFlightRequest {
    fn drop(&mut self) {
        if self.phase == RequestPhase::Processing {
            self.phase = RequestPhase::Failed;
            self.fail("request cancelled", None);
        }
    }
}

fn millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}
