//! HTTP server setup and configuration.
//!
//! # Responsibilities
//! - Create Axum Router with all handlers
//! - Wire up middleware (lifecycle instrumentation, panic recovery, timeout, tracing)
//! - Bind server to listener and shut down gracefully
//! - Relay requests to configured targets through the resilient client
//! - Expose circuit breaker state for operators

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::{middleware, Json, Router};
use serde_json::json;
use tokio::net::TcpListener;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::config::TelemetryConfig;
use crate::http::lifecycle::RequestLifecycle;
use crate::http::middleware::instrument;
use crate::observability::trace::Tracer;
use crate::resilience::{CallError, ClientBuildError, ClientRegistry, OutboundRequest, OutboundResponse};

/// Inbound headers forwarded on relayed calls.
static RELAYED_HEADERS: [header::HeaderName; 3] = [header::ACCEPT, header::CONTENT_TYPE, header::AUTHORIZATION];

/// Application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<str>,
    pub clients: ClientRegistry,
}

/// The instrumented HTTP service.
pub struct HttpServer {
    router: Router,
    config: Arc<TelemetryConfig>,
}

impl HttpServer {
    /// Create a new HTTP server with the given configuration.
    pub fn new(config: TelemetryConfig, tracer: Tracer) -> Result<Self, ClientBuildError> {
        let clients = ClientRegistry::from_config(&config, tracer.clone())?;
        Ok(Self::with_clients(config, tracer, clients))
    }

    /// Create a server around an existing client registry.
    pub fn with_clients(config: TelemetryConfig, tracer: Tracer, clients: ClientRegistry) -> Self {
        let lifecycle = RequestLifecycle::new(
            config.service_name.as_str(),
            tracer,
            config.instrumentation.exclude_paths.clone(),
        );
        let state = AppState {
            service: Arc::from(config.service_name.as_str()),
            clients,
        };
        let router = build_router(&config, lifecycle, state);
        Self {
            router,
            config: Arc::new(config),
        }
    }

    /// The fully layered router.
    pub fn router(&self) -> Router {
        self.router.clone()
    }

    pub fn config(&self) -> &TelemetryConfig {
        &self.config
    }

    /// Serve on `listener` until `shutdown` resolves.
    pub async fn run<S>(self, listener: TcpListener, shutdown: S) -> Result<(), std::io::Error>
    where
        S: Future<Output = ()> + Send + 'static,
    {
        let addr = listener.local_addr()?;
        tracing::info!(
            address = %addr,
            service = %self.config.service_name,
            "HTTP server starting"
        );

        axum::serve(listener, self.router)
            .with_graceful_shutdown(shutdown)
            .await?;

        tracing::info!("HTTP server stopped");
        Ok(())
    }
}

/// Build the Axum router with all middleware layers.
///
/// Layers, outermost first: trace → catch panic → lifecycle → timeout → handler.
pub fn build_router(config: &TelemetryConfig, lifecycle: RequestLifecycle, state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/admin/circuit-breakers", get(circuit_breakers))
        .route("/relay/{target}/{*path}", any(relay))
        .with_state(state)
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(config.listener.request_timeout_secs),
        ))
        .layer(middleware::from_fn_with_state(lifecycle, instrument))
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({ "status": "ok", "service": &*state.service }))
}

async fn circuit_breakers(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.clients.breakers().snapshots())
}

/// Forward a request to a configured target.
async fn relay(
    State(state): State<AppState>,
    Path((target, path)): Path<(String, String)>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some(client) = state.clients.get(&target) else {
        tracing::warn!(target_service = %target, "Relay to unknown target");
        return (StatusCode::NOT_FOUND, format!("unknown target `{target}`")).into_response();
    };

    let path = match uri.query() {
        Some(query) => format!("{path}?{query}"),
        None => path,
    };
    let mut request = OutboundRequest::new(method, path);
    for name in &RELAYED_HEADERS {
        if let Some(value) = headers.get(name) {
            request.headers.insert(name.clone(), value.clone());
        }
    }
    if !body.is_empty() {
        request = request.body(body);
    }

    match client.send(request).await {
        Ok(response) => relayed(response),
        Err(CallError::NonRetryable { response, .. }) => relayed(*response),
        Err(e @ CallError::CircuitOpen { .. }) => {
            (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response()
        }
        Err(e @ CallError::InvalidRequest { .. }) => {
            (StatusCode::BAD_REQUEST, e.to_string()).into_response()
        }
        Err(e @ CallError::RetriesExhausted { .. }) => {
            (StatusCode::BAD_GATEWAY, e.to_string()).into_response()
        }
    }
}

fn relayed(response: OutboundResponse) -> Response {
    let mut builder = Response::builder().status(response.status);
    if let Some(content_type) = response.headers.get(header::CONTENT_TYPE) {
        builder = builder.header(header::CONTENT_TYPE, content_type);
    }
    builder
        .body(Body::from(response.body))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}
