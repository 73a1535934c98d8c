//! Resilient outbound HTTP client.
//!
//! # Per-call sequence
//! ```text
//! read RequestContext (optional)
//!     → open client span, inject traceparent/tracestate + x-request-id
//!     → per attempt: breaker admission → send with deadline → record outcome
//!     → retryable failure: backoff, next attempt
//!     → record metrics, log, close span → final outcome to caller
//! ```
//!
//! # Design Decisions
//! - Every attempt, retries included, is one breaker sample
//! - Only failures that indicate an unhealthy target count against the
//!   breaker: no response, 5xx, and retryable statuses. Other 4xx are the
//!   caller's problem and count as healthy samples
//! - Missing context never fails a call; it only drops the propagation headers

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Bytes;
use axum::http::header::{HeaderMap, HeaderName, HeaderValue};
use axum::http::{Method, StatusCode};
use opentelemetry::trace::{SpanKind, Status};
use opentelemetry::KeyValue;
use url::Url;

use crate::config::{CircuitBreakerConfig, RetryConfig, TargetConfig, TelemetryConfig};
use crate::context;
use crate::http::request::X_REQUEST_ID;
use crate::observability::trace::Tracer;
use crate::observability::{metrics, propagation};
use crate::resilience::circuit_breaker::{BreakerRegistry, CircuitBreaker};
use crate::resilience::error::{CallError, ClientBuildError};
use crate::resilience::retries::{AttemptFailure, RetryPolicy};
use crate::resilience::timeouts::with_deadline;

/// An outbound request relative to a target's base address.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub method: Method,
    /// Path (and query) appended to the target base URL.
    pub path: String,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
}

impl OutboundRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            headers: HeaderMap::new(),
            body: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self::new(Method::POST, path).body(body)
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }
}

/// A fully buffered response.
#[derive(Debug, Clone)]
pub struct OutboundResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// Attempts it took to get this response.
    pub attempts: u32,
}

/// Outbound client for one target.
#[derive(Debug, Clone)]
pub struct ResilientClient {
    target: Arc<str>,
    base_url: Url,
    timeout: Duration,
    http: reqwest::Client,
    retry: RetryPolicy,
    breaker: Arc<CircuitBreaker>,
    tracer: Tracer,
}

impl ResilientClient {
    pub fn new(
        target: &TargetConfig,
        retry: &RetryConfig,
        breaker: Arc<CircuitBreaker>,
        tracer: Tracer,
        http: reqwest::Client,
    ) -> Result<Self, ClientBuildError> {
        let base_url = Url::parse(&target.base_url).map_err(|source| ClientBuildError::InvalidBaseUrl {
            target: target.name.clone(),
            source,
        })?;
        Ok(Self {
            target: Arc::from(target.name.as_str()),
            base_url,
            timeout: Duration::from_millis(target.timeout_ms),
            http,
            retry: RetryPolicy::new(retry),
            breaker,
            tracer,
        })
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub async fn get(&self, path: &str) -> Result<OutboundResponse, CallError> {
        self.send(OutboundRequest::get(path)).await
    }

    /// Perform a call with propagation, retries and breaker protection.
    pub async fn send(&self, request: OutboundRequest) -> Result<OutboundResponse, CallError> {
        let url = self.url_for(&request.path)?;
        let ctx = context::current();
        let correlation_id = ctx.as_ref().map(|c| c.correlation_id().to_owned());

        let mut headers = request.headers.clone();
        let mut span = ctx.as_ref().map(|c| {
            let mut span = self.tracer.start(
                format!("{} {}", request.method, self.target),
                SpanKind::Client,
                Some(c.span_context()),
            );
            span.set_attribute(KeyValue::new("http.method", request.method.to_string()));
            span.set_attribute(KeyValue::new("http.url", url.to_string()));
            span.set_attribute(KeyValue::new("peer.service", self.target.to_string()));
            span.set_attribute(KeyValue::new("correlation_id", c.correlation_id().to_owned()));
            span
        });
        if let Some(span) = &span {
            propagation::inject(span.span_context(), &mut headers);
        }
        if let Some(id) = &correlation_id {
            match HeaderValue::from_str(id) {
                Ok(value) => {
                    headers.insert(X_REQUEST_ID, value);
                }
                Err(_) => tracing::debug!(correlation_id = %id, "Correlation id is not a valid header value"),
            }
        }

        let started = Instant::now();
        let outcome = self
            .execute(&request, &url, &headers, correlation_id.as_deref())
            .await;
        let duration = started.elapsed();

        let method = request.method.as_str();
        match &outcome {
            Ok(response) => {
                metrics::record_outbound_call(
                    &self.target,
                    method,
                    &response.status.as_u16().to_string(),
                    duration,
                    false,
                );
            }
            Err(e) => {
                metrics::record_outbound_call(&self.target, method, &e.status_label(), duration, true);
            }
        }

        if let Some(span) = span.as_mut() {
            span.set_attribute(KeyValue::new("http.duration_ms", duration.as_millis() as i64));
            match &outcome {
                Ok(response) => {
                    span.set_attribute(KeyValue::new(
                        "http.status_code",
                        i64::from(response.status.as_u16()),
                    ));
                    span.set_attribute(KeyValue::new("http.attempts", i64::from(response.attempts)));
                    span.set_status(Status::Ok);
                }
                Err(e) => {
                    if let CallError::NonRetryable { response, .. } = e {
                        span.set_attribute(KeyValue::new(
                            "http.status_code",
                            i64::from(response.status.as_u16()),
                        ));
                    }
                    span.set_attribute(KeyValue::new("http.attempts", i64::from(e.attempts())));
                    span.set_status(Status::error(e.to_string()));
                }
            }
        }
        if let Some(span) = span {
            span.end();
        }

        outcome
    }

    async fn execute(
        &self,
        request: &OutboundRequest,
        url: &Url,
        headers: &HeaderMap,
        correlation_id: Option<&str>,
    ) -> Result<OutboundResponse, CallError> {
        let correlation_id = correlation_id.unwrap_or("-");
        let mut attempt = 0;

        loop {
            let permit = match self.breaker.try_acquire() {
                Ok(permit) => permit,
                Err(_) => {
                    tracing::warn!(
                        target_service = %self.target,
                        correlation_id,
                        attempts = attempt,
                        "Circuit open, rejecting outbound call"
                    );
                    return Err(CallError::CircuitOpen {
                        target: self.target.to_string(),
                        attempts: attempt,
                    });
                }
            };
            attempt += 1;

            tracing::debug!(
                target_service = %self.target,
                correlation_id,
                method = %request.method,
                url = %url,
                attempt,
                probe = permit.is_probe(),
                "Sending outbound request"
            );

            let attempt_started = Instant::now();
            let result = self
                .attempt(&request.method, url, headers, request.body.clone())
                .await;

            let failure = match result {
                Ok(mut response) => {
                    let status = response.status;
                    response.attempts = attempt;
                    if self.counts_against_breaker(status) {
                        permit.failure();
                    } else {
                        permit.success();
                    }
                    tracing::info!(
                        target_service = %self.target,
                        correlation_id,
                        method = %request.method,
                        status = status.as_u16(),
                        attempt,
                        duration_ms = attempt_started.elapsed().as_millis() as u64,
                        "Outbound response received"
                    );

                    if status.as_u16() < 400 {
                        return Ok(response);
                    }
                    let failure = AttemptFailure::Status(status);
                    if !self.retry.is_retryable(&failure) {
                        return Err(CallError::NonRetryable {
                            target: self.target.to_string(),
                            response: Box::new(response),
                        });
                    }
                    failure
                }
                Err(failure) => {
                    permit.failure();
                    tracing::error!(
                        target_service = %self.target,
                        correlation_id,
                        method = %request.method,
                        attempt,
                        error = %failure,
                        "Outbound request failed"
                    );
                    failure
                }
            };

            if self.retry.should_retry(attempt, &failure) {
                let delay = self.retry.delay(attempt);
                tracing::info!(
                    target_service = %self.target,
                    correlation_id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    reason = %failure,
                    "Retrying outbound request"
                );
                metrics::record_retry(&self.target);
                tokio::time::sleep(delay).await;
                continue;
            }

            tracing::error!(
                target_service = %self.target,
                correlation_id,
                attempts = attempt,
                error = %failure,
                "Outbound call failed"
            );
            return Err(CallError::RetriesExhausted {
                target: self.target.to_string(),
                attempts: attempt,
                failure,
            });
        }
    }

    async fn attempt(
        &self,
        method: &Method,
        url: &Url,
        headers: &HeaderMap,
        body: Option<Bytes>,
    ) -> Result<OutboundResponse, AttemptFailure> {
        let mut builder = self
            .http
            .request(method.clone(), url.clone())
            .headers(headers.clone());
        if let Some(body) = body {
            builder = builder.body(body);
        }

        let exchange = async {
            let response = builder.send().await?;
            let status = response.status();
            let headers = response.headers().clone();
            let body = response.bytes().await?;
            Ok::<_, reqwest::Error>((status, headers, body))
        };

        match with_deadline(self.timeout, exchange).await {
            Ok(Ok((status, headers, body))) => Ok(OutboundResponse {
                status,
                headers,
                body,
                attempts: 0,
            }),
            Ok(Err(e)) if e.is_timeout() => Err(AttemptFailure::Timeout),
            Ok(Err(e)) => Err(AttemptFailure::Network(e.to_string())),
            Err(_) => Err(AttemptFailure::Timeout),
        }
    }

    fn counts_against_breaker(&self, status: StatusCode) -> bool {
        status.is_server_error() || self.retry.is_retryable_status(status)
    }

    fn url_for(&self, path: &str) -> Result<Url, CallError> {
        let base = self.base_url.as_str().trim_end_matches('/');
        let path = path.trim_start_matches('/');
        Url::parse(&format!("{base}/{path}")).map_err(|e| CallError::InvalidRequest {
            target: self.target.to_string(),
            reason: e.to_string(),
        })
    }
}

/// One client per configured target, sharing an HTTP pool and a breaker registry.
#[derive(Debug, Clone)]
pub struct ClientRegistry {
    clients: Arc<HashMap<String, ResilientClient>>,
    breakers: Arc<BreakerRegistry>,
}

impl ClientRegistry {
    pub fn from_config(config: &TelemetryConfig, tracer: Tracer) -> Result<Self, ClientBuildError> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("reqtrace/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Self::with_http(config, tracer, http, Arc::new(BreakerRegistry::new()))
    }

    /// Build with an explicit HTTP client and breaker registry.
    pub fn with_http(
        config: &TelemetryConfig,
        tracer: Tracer,
        http: reqwest::Client,
        breakers: Arc<BreakerRegistry>,
    ) -> Result<Self, ClientBuildError> {
        let mut clients = HashMap::with_capacity(config.targets.len());
        for target in &config.targets {
            let breaker_config: CircuitBreakerConfig = config.breaker_for(target);
            let breaker = breakers.get_or_create(&target.name, &breaker_config);
            let client = ResilientClient::new(
                target,
                &config.retry_for(target),
                breaker,
                tracer.clone(),
                http.clone(),
            )?;
            clients.insert(target.name.clone(), client);
        }
        tracing::info!(targets = clients.len(), "Outbound clients configured");
        Ok(Self {
            clients: Arc::new(clients),
            breakers,
        })
    }

    pub fn get(&self, target: &str) -> Option<&ResilientClient> {
        self.clients.get(target)
    }

    pub fn breakers(&self) -> &Arc<BreakerRegistry> {
        &self.breakers
    }
}
