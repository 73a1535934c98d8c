//! Axum middleware driving the lifecycle hooks.
//!
//! Runs the rest of the stack inside the request's context and a `tracing`
//! span carrying the request identifiers, so every log line emitted by the
//! handler is attributable to its request.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::HeaderValue;
use axum::middleware::Next;
use axum::response::Response;
use futures_util::FutureExt;
use tracing::Instrument;

use crate::context::run_with_context;
use crate::http::lifecycle::{HandlerFailure, RequestLifecycle};
use crate::http::request::{InboundRequest, X_REQUEST_ID};

/// Instrument one inbound request.
///
/// A handler panic is recorded as a failure and then resumed so outer panic
/// handling still produces the response.
pub async fn instrument(
    State(lifecycle): State<RequestLifecycle>,
    request: Request,
    next: Next,
) -> Response {
    let in_flight = lifecycle.on_request_start(&InboundRequest::from_request(&request));

    let Some(ctx) = in_flight.context().cloned() else {
        let response = next.run(request).await;
        in_flight.on_request_end(response.status());
        return response;
    };

    let span = tracing::info_span!(
        "request",
        service = %lifecycle.service(),
        correlation_id = %ctx.correlation_id(),
        trace_id = %ctx.trace_id(),
        span_id = %ctx.span_id(),
    );

    let outcome = run_with_context(Arc::clone(&ctx), AssertUnwindSafe(next.run(request)).catch_unwind())
        .instrument(span)
        .await;

    match outcome {
        Ok(mut response) => {
            if let Ok(value) = HeaderValue::from_str(ctx.correlation_id()) {
                response.headers_mut().insert(X_REQUEST_ID, value);
            }
            in_flight.on_request_end(response.status());
            response
        }
        Err(panic) => {
            in_flight.on_request_error(&HandlerFailure::from_panic(panic.as_ref()));
            std::panic::resume_unwind(panic)
        }
    }
}
