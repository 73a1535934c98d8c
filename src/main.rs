//! reqtrace service binary.
//!
//! ```text
//!   inbound request ─▶ lifecycle middleware ─▶ handler ─▶ resilient client ─▶ target
//!                       (context + span)                   (retry + breaker)
//! ```
//!
//! Routes:
//! - `GET /health`
//! - `GET /admin/circuit-breakers`
//! - `ANY /relay/{target}/{*path}`

use std::path::PathBuf;

use clap::Parser;
use tokio::net::TcpListener;

use reqtrace::config::load_config;
use reqtrace::lifecycle::{init_telemetry, signals, Shutdown};
use reqtrace::HttpServer;

#[derive(Parser)]
#[command(name = "reqtrace")]
#[command(about = "Instrumented HTTP service with resilient outbound calls", long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "reqtrace.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = load_config(&cli.config)?;
    let telemetry = init_telemetry(&config)?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %cli.config.display(),
        bind_address = %config.listener.bind_address,
        targets = config.targets.len(),
        "reqtrace starting"
    );

    let listener = TcpListener::bind(&config.listener.bind_address).await?;
    let server = HttpServer::new(config, telemetry.tracer().clone())?;

    let shutdown = Shutdown::new();
    signals::spawn_signal_handler(shutdown.clone());

    server.run(listener, shutdown.signalled()).await?;

    telemetry.shutdown().await;
    tracing::info!("Shutdown complete");
    Ok(())
}
