//! Inbound request identity.
//!
//! # Responsibilities
//! - Read the caller's correlation id, or generate one (UUID v4)
//! - Describe an inbound request to the lifecycle hooks independent of the framework
//!
//! # Design Decisions
//! - Correlation ids are opaque; anything printable is accepted
//! - Route template comes from the router when it matched, otherwise the raw path

use axum::extract::MatchedPath;
use axum::http::{HeaderMap, Method, Request, Uri};
use uuid::Uuid;

/// Correlation header, read inbound and set on responses and outbound calls.
pub const X_REQUEST_ID: &str = "x-request-id";

const MAX_CORRELATION_ID_LEN: usize = 128;

/// Use the inbound `x-request-id` when usable, otherwise mint a fresh one.
pub fn extract_or_generate_correlation_id(headers: &HeaderMap) -> String {
    headers
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty() && v.len() <= MAX_CORRELATION_ID_LEN)
        .map(str::to_owned)
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

/// What the lifecycle hooks need to know about an inbound request.
#[derive(Debug, Clone)]
pub struct InboundRequest<'a> {
    pub method: &'a Method,
    pub uri: &'a Uri,
    /// Route template, e.g. `/relay/{target}/{*path}`.
    pub route: Option<&'a str>,
    pub headers: &'a HeaderMap,
}

impl<'a> InboundRequest<'a> {
    pub fn from_request<B>(request: &'a Request<B>) -> Self {
        Self {
            method: request.method(),
            uri: request.uri(),
            route: request
                .extensions()
                .get::<MatchedPath>()
                .map(MatchedPath::as_str),
            headers: request.headers(),
        }
    }

    pub fn path(&self) -> &str {
        self.uri.path()
    }

    /// Route template, falling back to the raw path.
    pub fn route(&self) -> &str {
        self.route.unwrap_or_else(|| self.uri.path())
    }

    pub fn user_agent(&self) -> Option<&str> {
        self.headers
            .get(axum::http::header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
    }
}
