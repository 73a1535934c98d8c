//! Shared utilities for integration testing.

#![allow(dead_code)]

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::http::StatusCode;
use reqtrace::config::{TargetConfig, TelemetryConfig};
use reqtrace::lifecycle::Shutdown;
use reqtrace::observability::logging::json_layer;
use reqtrace::observability::{InMemoryExporter, Tracer};
use reqtrace::HttpServer;
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::subscriber::DefaultGuard;
use tracing_subscriber::layer::SubscriberExt;

/// A request as seen by a mock backend.
#[derive(Debug, Clone)]
pub struct CapturedRequest {
    pub method: String,
    pub path: String,
    /// Lowercased header names.
    pub headers: HashMap<String, String>,
}

impl CapturedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }
}

/// Handle to a running mock backend.
#[derive(Clone)]
pub struct MockBackend {
    pub addr: SocketAddr,
    hits: Arc<AtomicU32>,
    requests: Arc<Mutex<Vec<CapturedRequest>>>,
}

impl MockBackend {
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Requests received so far.
    pub fn hits(&self) -> u32 {
        self.hits.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<CapturedRequest> {
        self.requests.lock().unwrap().clone()
    }
}

/// Start a mock backend that always answers with `status` and `body`.
pub async fn start_mock_backend(status: u16, body: &'static str) -> MockBackend {
    start_programmable_backend(move |_, _| async move { (status, body.to_string()) }).await
}

/// Start a programmable mock backend.
///
/// The responder receives the zero-based hit number and the captured request.
pub async fn start_programmable_backend<F, Fut>(f: F) -> MockBackend
where
    F: Fn(u32, CapturedRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = (u16, String)> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let backend = MockBackend {
        addr,
        hits: Arc::new(AtomicU32::new(0)),
        requests: Arc::new(Mutex::new(Vec::new())),
    };
    let f = Arc::new(f);
    let state = backend.clone();

    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((mut socket, _)) => {
                    let f = f.clone();
                    let state = state.clone();
                    tokio::spawn(async move {
                        let Some(request) = read_request(&mut socket).await else {
                            return;
                        };
                        let n = state.hits.fetch_add(1, Ordering::SeqCst);
                        state.requests.lock().unwrap().push(request.clone());

                        let (status, body) = f(n, request).await;
                        let reason = StatusCode::from_u16(status)
                            .ok()
                            .and_then(|s| s.canonical_reason())
                            .unwrap_or("Unknown");
                        let response = format!(
                            "HTTP/1.1 {} {}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                            status,
                            reason,
                            body.len(),
                            body
                        );
                        let _ = socket.write_all(response.as_bytes()).await;
                        let _ = socket.shutdown().await;
                    });
                }
                Err(_) => break,
            }
        }
    });

    backend
}

async fn read_request(socket: &mut tokio::net::TcpStream) -> Option<CapturedRequest> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = socket.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
    }

    let text = String::from_utf8_lossy(&buf);
    let head = text.split("\r\n\r\n").next()?;
    let mut lines = head.split("\r\n");
    let mut request_line = lines.next()?.split_whitespace();
    let method = request_line.next()?.to_string();
    let path = request_line.next()?.to_string();
    let headers = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(k, v)| (k.trim().to_ascii_lowercase(), v.trim().to_string()))
        .collect();

    Some(CapturedRequest {
        method,
        path,
        headers,
    })
}

/// Minimal valid config with one target pointing at `base_url`.
pub fn config_with_target(name: &str, base_url: &str) -> TelemetryConfig {
    let mut config = TelemetryConfig::default();
    config.service_name = "orders".to_string();
    config.environment = "test".to_string();
    config.retries.base_delay_ms = 10;
    config.retries.max_delay_ms = 100;
    let mut target = TargetConfig::new(name, base_url);
    target.timeout_ms = 2_000;
    config.targets.push(target);
    config
}

/// Tracer that keeps finished spans in memory.
pub fn test_tracer() -> (Tracer, Arc<InMemoryExporter>) {
    let exporter = Arc::new(InMemoryExporter::default());
    (Tracer::new(exporter.clone()), exporter)
}

/// Serve the app on an ephemeral port.
pub async fn spawn_app(config: TelemetryConfig, tracer: Tracer) -> (SocketAddr, Shutdown) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = HttpServer::new(config, tracer).unwrap();
    let shutdown = Shutdown::new();
    let signalled = shutdown.signalled();
    tokio::spawn(async move {
        let _ = server.run(listener, signalled).await;
    });
    (addr, shutdown)
}

/// HTTP client for driving the app under test.
pub fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .pool_max_idle_per_host(0)
        .no_proxy()
        .timeout(Duration::from_secs(10))
        .build()
        .unwrap()
}

/// JSON log lines written by the capturing subscriber.
#[derive(Clone, Default)]
pub struct LogBuffer(Arc<Mutex<Vec<u8>>>);

impl LogBuffer {
    pub fn lines(&self) -> Vec<Value> {
        let bytes = self.0.lock().unwrap().clone();
        String::from_utf8(bytes)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }
}

impl io::Write for LogBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Capture this thread's logs as production JSON lines until the guard drops.
///
/// Use with the current-thread runtime so spawned tasks log here too.
pub fn capture_logs(service: &str) -> (DefaultGuard, LogBuffer) {
    let buffer = LogBuffer::default();
    let writer = buffer.clone();
    let subscriber = tracing_subscriber::registry().with(json_layer(service, move || writer.clone()));
    (tracing::subscriber::set_default(subscriber), buffer)
}
