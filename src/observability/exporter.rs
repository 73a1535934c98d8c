//! Span exporters.
//!
//! # Responsibilities
//! - Receive finished spans from the tracer
//! - Ship them to the trace backend (or the log, or memory for tests)
//!
//! # Design Decisions
//! - `export` never blocks and never fails the caller
//! - The HTTP exporter batches in a background task; delivery errors are
//!   logged and the batch is dropped
//! - A bounded queue sheds spans under backpressure instead of growing

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, UNIX_EPOCH};

use opentelemetry::trace::{SpanId, Status};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use url::Url;

use crate::observability::trace::FinishedSpan;

/// The trace backend.
pub trait SpanExporter: Send + Sync + fmt::Debug {
    fn export(&self, span: FinishedSpan);
}

/// Discards every span.
#[derive(Debug, Default)]
pub struct NoopExporter;

impl SpanExporter for NoopExporter {
    fn export(&self, _span: FinishedSpan) {}
}

/// Emits one debug log line per finished span.
#[derive(Debug, Default)]
pub struct LogExporter;

impl SpanExporter for LogExporter {
    fn export(&self, span: FinishedSpan) {
        tracing::debug!(
            target: "reqtrace::span",
            span_name = %span.name,
            trace_id = %span.span_context.trace_id(),
            span_id = %span.span_context.span_id(),
            parent_span_id = %span.parent_span_id,
            kind = ?span.kind,
            status = status_code(&span.status),
            duration_ms = span.duration.as_secs_f64() * 1000.0,
            "Span finished"
        );
    }
}

/// Keeps finished spans in memory.
#[derive(Debug, Default)]
pub struct InMemoryExporter {
    spans: Mutex<Vec<FinishedSpan>>,
}

impl InMemoryExporter {
    /// Snapshot of all spans exported so far.
    pub fn finished(&self) -> Vec<FinishedSpan> {
        self.spans
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn clear(&self) {
        self.spans
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
    }
}

impl SpanExporter for InMemoryExporter {
    fn export(&self, span: FinishedSpan) {
        self.spans
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(span);
    }
}

/// Process identity attached to every exported batch.
#[derive(Debug, Clone, Serialize)]
pub struct Resource {
    #[serde(rename = "service.name")]
    pub service_name: String,
    #[serde(rename = "deployment.environment")]
    pub environment: String,
}

const QUEUE_CAPACITY: usize = 2048;
const MAX_BATCH: usize = 256;

enum Command {
    Span(Box<FinishedSpan>),
    Flush(oneshot::Sender<()>),
    Shutdown(oneshot::Sender<()>),
}

/// Batches spans and POSTs them as JSON to a collector endpoint.
pub struct HttpExporter {
    tx: mpsc::Sender<Command>,
    dropped: AtomicU64,
}

impl HttpExporter {
    /// Start the background worker. Must be called inside a tokio runtime.
    pub fn spawn(
        endpoint: Url,
        resource: Resource,
        interval: Duration,
        client: reqwest::Client,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let worker = Worker {
            endpoint,
            resource,
            client,
            batch: Vec::with_capacity(MAX_BATCH),
        };
        let handle = tokio::spawn(worker.run(rx, interval));
        (
            Self {
                tx,
                dropped: AtomicU64::new(0),
            },
            handle,
        )
    }

    /// Spans discarded because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Deliver everything queued so far.
    pub async fn flush(&self) {
        let (ack, done) = oneshot::channel();
        if self.tx.send(Command::Flush(ack)).await.is_ok() {
            let _ = done.await;
        }
    }

    /// Flush and stop the worker.
    pub async fn shutdown(&self) {
        let (ack, done) = oneshot::channel();
        if self.tx.send(Command::Shutdown(ack)).await.is_ok() {
            let _ = done.await;
        }
    }
}

impl fmt::Debug for HttpExporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpExporter")
            .field("dropped", &self.dropped())
            .finish()
    }
}

impl SpanExporter for HttpExporter {
    fn export(&self, span: FinishedSpan) {
        if let Err(mpsc::error::TrySendError::Full(_)) = self.tx.try_send(Command::Span(Box::new(span))) {
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            if dropped.is_power_of_two() {
                tracing::warn!(dropped, "Span export queue full, dropping spans");
            }
        }
    }
}

struct Worker {
    endpoint: Url,
    resource: Resource,
    client: reqwest::Client,
    batch: Vec<FinishedSpan>,
}

impl Worker {
    async fn run(mut self, mut rx: mpsc::Receiver<Command>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = rx.recv() => match command {
                    Some(Command::Span(span)) => {
                        self.batch.push(*span);
                        if self.batch.len() >= MAX_BATCH {
                            self.send_batch().await;
                        }
                    }
                    Some(Command::Flush(ack)) => {
                        self.send_batch().await;
                        let _ = ack.send(());
                    }
                    Some(Command::Shutdown(ack)) => {
                        self.send_batch().await;
                        let _ = ack.send(());
                        break;
                    }
                    None => {
                        self.send_batch().await;
                        break;
                    }
                },
                _ = ticker.tick() => self.send_batch().await,
            }
        }
        tracing::debug!("Span exporter stopped");
    }

    async fn send_batch(&mut self) {
        if self.batch.is_empty() {
            return;
        }
        let spans: Vec<Value> = self.batch.drain(..).map(|s| span_to_json(&s)).collect();
        let count = spans.len();
        let payload = json!({ "resource": self.resource, "spans": spans });

        match self
            .client
            .post(self.endpoint.clone())
            .json(&payload)
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => {
                tracing::trace!(count, "Exported span batch");
            }
            Ok(response) => {
                tracing::warn!(count, status = %response.status(), "Span export rejected by collector");
            }
            Err(e) => {
                tracing::warn!(count, error = %e, "Span export failed");
            }
        }
    }
}

fn status_code(status: &Status) -> &'static str {
    match status {
        Status::Unset => "unset",
        Status::Ok => "ok",
        Status::Error { .. } => "error",
    }
}

fn unix_nanos(time: std::time::SystemTime) -> u128 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default()
}

/// JSON rendition of a finished span.
pub fn span_to_json(span: &FinishedSpan) -> Value {
    let attributes: serde_json::Map<String, Value> = span
        .attributes
        .iter()
        .map(|kv| (kv.key.as_str().to_owned(), Value::String(kv.value.to_string())))
        .collect();
    let events: Vec<Value> = span
        .events
        .iter()
        .map(|event| {
            let attributes: serde_json::Map<String, Value> = event
                .attributes
                .iter()
                .map(|kv| (kv.key.as_str().to_owned(), Value::String(kv.value.to_string())))
                .collect();
            json!({
                "name": event.name,
                "time_unix_nano": unix_nanos(event.timestamp).to_string(),
                "attributes": attributes,
            })
        })
        .collect();
    let parent = (span.parent_span_id != SpanId::INVALID).then(|| span.parent_span_id.to_string());
    let status_message = match &span.status {
        Status::Error { description } => Some(description.to_string()),
        _ => None,
    };

    json!({
        "name": span.name,
        "kind": format!("{:?}", span.kind).to_lowercase(),
        "trace_id": span.span_context.trace_id().to_string(),
        "span_id": span.span_context.span_id().to_string(),
        "parent_span_id": parent,
        "start_time_unix_nano": unix_nanos(span.start_time).to_string(),
        "end_time_unix_nano": unix_nanos(span.end_time).to_string(),
        "status": { "code": status_code(&span.status), "message": status_message },
        "attributes": attributes,
        "events": events,
    })
}
