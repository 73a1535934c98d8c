//! Telemetry bootstrap.
//!
//! # Responsibilities
//! - Install the log subscriber
//! - Install the Prometheus recorder when a scrape address is configured
//! - Build the tracer and the span exporter it feeds
//!
//! # Design Decisions
//! - Fail fast: any bootstrap error is fatal
//! - The guard owns the exporter worker; shutting it down flushes pending spans

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use url::Url;

use crate::config::TelemetryConfig;
use crate::observability::exporter::{HttpExporter, LogExporter, Resource};
use crate::observability::logging::init_logging;
use crate::observability::metrics::init_metrics;
use crate::observability::trace::Tracer;

/// Errors raised while bringing telemetry up.
#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    #[error("failed to install log subscriber: {0}")]
    Logging(#[from] tracing_subscriber::util::TryInitError),

    #[error("failed to install metrics recorder: {0}")]
    Metrics(#[from] metrics_exporter_prometheus::BuildError),

    #[error("invalid metrics address `{address}`: {source}")]
    MetricsAddress {
        address: String,
        #[source]
        source: std::net::AddrParseError,
    },

    #[error("invalid exporter endpoint `{endpoint}`: {source}")]
    ExporterEndpoint {
        endpoint: String,
        #[source]
        source: url::ParseError,
    },

    #[error("failed to build exporter HTTP client: {0}")]
    Http(#[from] reqwest::Error),
}

/// Keeps process-wide telemetry alive.
///
/// Call [`shutdown`](Self::shutdown) before exit to flush spans.
#[derive(Debug)]
pub struct TelemetryGuard {
    tracer: Tracer,
    exporter: Option<Arc<HttpExporter>>,
    worker: Option<JoinHandle<()>>,
}

impl TelemetryGuard {
    pub fn tracer(&self) -> &Tracer {
        &self.tracer
    }

    /// Flush pending spans and stop the export worker.
    pub async fn shutdown(mut self) {
        if let Some(exporter) = self.exporter.take() {
            exporter.shutdown().await;
            let dropped = exporter.dropped();
            if dropped > 0 {
                tracing::warn!(dropped, "Spans dropped during this run");
            }
        }
        if let Some(worker) = self.worker.take() {
            if let Err(e) = worker.await {
                tracing::error!(error = %e, "Span export worker failed");
            }
        }
        tracing::info!("Telemetry shut down");
    }
}

/// Initialize logging, metrics and tracing. Must run inside a tokio runtime.
pub fn init_telemetry(config: &TelemetryConfig) -> Result<TelemetryGuard, BootstrapError> {
    let observability = &config.observability;
    init_logging(
        &config.service_name,
        &observability.log_level,
        observability.log_format,
    )?;

    let interval = Duration::from_secs(observability.metrics_export_interval_secs.max(1));

    if let Some(address) = &observability.metrics_address {
        let addr: SocketAddr = address
            .parse()
            .map_err(|source| BootstrapError::MetricsAddress {
                address: address.clone(),
                source,
            })?;
        init_metrics(addr, interval)?;
    }

    let guard = match &observability.exporter_endpoint {
        Some(endpoint) => {
            let url = Url::parse(endpoint).map_err(|source| BootstrapError::ExporterEndpoint {
                endpoint: endpoint.clone(),
                source,
            })?;
            let client = reqwest::Client::builder()
                .timeout(Duration::from_secs(5))
                .build()?;
            let resource = Resource {
                service_name: config.service_name.clone(),
                environment: config.environment.clone(),
            };
            let (exporter, worker) = HttpExporter::spawn(url, resource, interval, client);
            let exporter = Arc::new(exporter);
            TelemetryGuard {
                tracer: Tracer::new(exporter.clone()),
                exporter: Some(exporter),
                worker: Some(worker),
            }
        }
        None => TelemetryGuard {
            tracer: Tracer::new(Arc::new(LogExporter)),
            exporter: None,
            worker: None,
        },
    };

    tracing::info!(
        service = %config.service_name,
        environment = %config.environment,
        exporter = observability.exporter_endpoint.as_deref().unwrap_or("log"),
        metrics_address = observability.metrics_address.as_deref().unwrap_or("disabled"),
        "Telemetry initialized"
    );

    Ok(guard)
}
