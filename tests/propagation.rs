//! Correlation and trace propagation through the instrumented app.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::routing::get;
use axum::Router;
use opentelemetry::trace::{SpanKind, Status, TraceId};
use reqtrace::config::{RetryConfig, TargetConfig};
use reqtrace::context;
use reqtrace::http::middleware::instrument;
use reqtrace::http::RequestLifecycle;
use reqtrace::observability::Tracer;
use reqtrace::resilience::{CircuitBreaker, ResilientClient};
use tower::ServiceExt;
use tower_http::catch_panic::CatchPanicLayer;

mod common;

const TRACE_ID: &str = "4bf92f3577b34da6a3ce929d0e0e4736";
const PARENT_SPAN_ID: &str = "00f067aa0ba902b7";

#[tokio::test]
async fn test_headers_round_trip_to_outbound_call() {
    let backend = common::start_mock_backend(200, "stock").await;
    let (tracer, exporter) = common::test_tracer();
    let (addr, shutdown) = common::spawn_app(
        common::config_with_target("inventory", &backend.url()),
        tracer,
    )
    .await;

    let response = common::client()
        .get(format!("http://{addr}/relay/inventory/items/7"))
        .header("traceparent", format!("00-{TRACE_ID}-{PARENT_SPAN_ID}-01"))
        .header("x-request-id", "req-1")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-request-id"], "req-1");
    assert_eq!(response.text().await.unwrap(), "stock");

    let outbound = &backend.requests()[0];
    assert_eq!(outbound.path, "/items/7");
    assert_eq!(outbound.header("x-request-id"), Some("req-1"));
    let traceparent = outbound.header("traceparent").expect("traceparent injected");
    let parts: Vec<&str> = traceparent.split('-').collect();
    assert_eq!(parts.len(), 4);
    assert_eq!(parts[0], "00");
    assert_eq!(parts[1], TRACE_ID);
    assert_ne!(parts[2], PARENT_SPAN_ID);
    assert_eq!(parts[3], "01");

    let spans = exporter.finished();
    assert_eq!(spans.len(), 2);
    let server = spans.iter().find(|s| s.kind == SpanKind::Server).unwrap();
    let client = spans.iter().find(|s| s.kind == SpanKind::Client).unwrap();
    let trace_id = TraceId::from_hex(TRACE_ID).unwrap();
    assert_eq!(server.span_context.trace_id(), trace_id);
    assert_eq!(client.span_context.trace_id(), trace_id);
    assert_eq!(server.parent_span_id.to_string(), PARENT_SPAN_ID);
    assert_eq!(client.parent_span_id, server.span_context.span_id());
    assert_eq!(client.span_context.span_id().to_string(), parts[2]);
    assert_eq!(server.status, Status::Ok);

    shutdown.trigger();
}

#[tokio::test]
async fn test_new_trace_and_correlation_id_when_absent() {
    let backend = common::start_mock_backend(200, "ok").await;
    let (tracer, exporter) = common::test_tracer();
    let (addr, shutdown) = common::spawn_app(
        common::config_with_target("inventory", &backend.url()),
        tracer,
    )
    .await;

    let response = common::client()
        .get(format!("http://{addr}/relay/inventory/ping"))
        .send()
        .await
        .unwrap();

    let generated = response.headers()["x-request-id"].to_str().unwrap().to_string();
    assert!(!generated.is_empty());

    let outbound = &backend.requests()[0];
    assert_eq!(outbound.header("x-request-id"), Some(generated.as_str()));
    assert!(outbound.header("traceparent").is_some());

    let server = exporter
        .finished()
        .into_iter()
        .find(|s| s.kind == SpanKind::Server)
        .unwrap();
    assert!(!server.span_context.is_remote());
    assert_eq!(server.parent_span_id, opentelemetry::trace::SpanId::INVALID);

    shutdown.trigger();
}

#[tokio::test]
async fn test_call_without_context_sends_no_propagation_headers() {
    let backend = common::start_mock_backend(200, "ok").await;
    let target = TargetConfig::new("inventory", &backend.url());
    let client = ResilientClient::new(
        &target,
        &RetryConfig::default(),
        Arc::new(CircuitBreaker::new("inventory", Default::default())),
        Tracer::noop(),
        reqwest::Client::new(),
    )
    .unwrap();

    let response = client.get("/ping").await.unwrap();
    assert_eq!(response.status, 200);

    let outbound = &backend.requests()[0];
    assert!(outbound.header("traceparent").is_none());
    assert!(outbound.header("x-request-id").is_none());
}

#[tokio::test]
async fn test_excluded_route_produces_no_span() {
    let (tracer, exporter) = common::test_tracer();
    let mut config = common::config_with_target("inventory", "http://127.0.0.1:1");
    config.targets.clear();
    let (addr, shutdown) = common::spawn_app(config, tracer).await;

    let response = common::client()
        .get(format!("http://{addr}/health"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().get("x-request-id").is_none());
    assert!(exporter.finished().is_empty());

    shutdown.trigger();
}

#[tokio::test]
async fn test_concurrent_requests_keep_their_own_identity() {
    // Echo the correlation id seen by the backend, after a staggered delay so
    // requests overlap.
    let backend = common::start_programmable_backend(|n, request| async move {
        tokio::time::sleep(Duration::from_millis(u64::from(20 - n % 20) * 5)).await;
        let id = request.header("x-request-id").unwrap_or("none").to_string();
        (200, id)
    })
    .await;
    let (tracer, exporter) = common::test_tracer();
    let (addr, shutdown) = common::spawn_app(
        common::config_with_target("inventory", &backend.url()),
        tracer,
    )
    .await;

    let client = common::client();
    let calls = (0..20).map(|i| {
        let client = client.clone();
        async move {
            let id = format!("req-{i}");
            let response = client
                .get(format!("http://{addr}/relay/inventory/echo"))
                .header("x-request-id", &id)
                .send()
                .await
                .unwrap();
            let header = response.headers()["x-request-id"].to_str().unwrap().to_string();
            let body = response.text().await.unwrap();
            (id, header, body)
        }
    });

    for (id, header, body) in futures_util::future::join_all(calls).await {
        assert_eq!(header, id);
        assert_eq!(body, id);
    }

    // Every client span belongs to the trace of its own server span.
    let spans = exporter.finished();
    assert_eq!(spans.len(), 40);
    for client_span in spans.iter().filter(|s| s.kind == SpanKind::Client) {
        let parent = spans
            .iter()
            .find(|s| s.span_context.span_id() == client_span.parent_span_id)
            .unwrap();
        assert_eq!(parent.kind, SpanKind::Server);
        assert_eq!(parent.span_context.trace_id(), client_span.span_context.trace_id());
        assert_eq!(parent.attribute("correlation_id"), client_span.attribute("correlation_id"));
    }

    shutdown.trigger();
}

#[tokio::test]
async fn test_handler_panic_closes_span_once_with_error() {
    let (tracer, exporter) = common::test_tracer();
    let lifecycle = RequestLifecycle::new("orders", tracer, vec!["/health".to_string()]);

    let app = Router::new()
        .route(
            "/boom",
            get(|| async {
                if context::current().is_some() {
                    panic!("handler exploded");
                }
                "unreachable"
            }),
        )
        .layer(axum::middleware::from_fn_with_state(lifecycle, instrument))
        .layer(CatchPanicLayer::new());

    let response = app
        .oneshot(Request::builder().uri("/boom").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

    let spans = exporter.finished();
    assert_eq!(spans.len(), 1);
    assert_eq!(spans[0].name, "GET /boom");
    assert_eq!(spans[0].status, Status::error("handler exploded"));
    assert_eq!(spans[0].events.iter().filter(|e| e.name == "exception").count(), 1);

    // The recorded stack detail names the handler, not the middleware.
    let exception = spans[0].events.iter().find(|e| e.name == "exception").unwrap();
    let stacktrace = exception
        .attributes
        .iter()
        .find(|kv| kv.key.as_str() == "exception.stacktrace")
        .map(|kv| kv.value.to_string())
        .unwrap();
    assert!(stacktrace.starts_with("panicked at tests/propagation.rs:"), "{stacktrace}");
}

#[tokio::test]
async fn test_spawned_work_keeps_request_context() {
    let (tracer, _exporter) = common::test_tracer();
    let lifecycle = RequestLifecycle::new("orders", tracer, Vec::new());

    let app = Router::new()
        .route(
            "/work",
            get(|| async {
                let background = context::spawn(async {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    context::correlation_id()
                });
                background.await.unwrap().unwrap_or_default()
            }),
        )
        .layer(axum::middleware::from_fn_with_state(lifecycle, instrument));

    let response = app
        .oneshot(
            Request::builder()
                .uri("/work")
                .header("x-request-id", "req-bg")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    assert_eq!(&body[..], b"req-bg");
}
