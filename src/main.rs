use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use floodgate::admission::{AdmissionMiddleware, MetricsSink, NoopSink, OutcomeSink};
use floodgate::config::FloodgateConfig;
use floodgate::grpc::GrpcServer;

/// Admission control sidecar: rate limiting and circuit breaking over gRPC.
#[derive(Debug, Parser)]
#[command(name = "floodgate", version, about)]
struct Args {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address for the gRPC admission service, overrides the configuration
    #[arg(long)]
    grpc_addr: Option<SocketAddr>,

    /// Address for the Prometheus scrape endpoint, overrides the configuration
    #[arg(long)]
    metrics_addr: Option<SocketAddr>,

    /// Default log filter when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    if args.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .init();
    }

    info!("Starting Floodgate Admission Service");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = FloodgateConfig::load(args.config.as_deref())?;
    if let Some(addr) = args.grpc_addr {
        config.server.grpc_addr = addr;
    }
    if let Some(addr) = args.metrics_addr {
        config.server.metrics_addr = Some(addr);
    }

    let problems = config.admission.sanitize();
    if !problems.is_empty() {
        warn!(count = problems.len(), "Configuration had invalid values, using fallbacks");
    }
    info!(
        grpc_addr = %config.server.grpc_addr,
        enabled = config.admission.enabled,
        breaker_enabled = config.admission.breaker.enabled,
        "Configuration loaded"
    );

    let sink: Arc<dyn OutcomeSink> = match config.server.metrics_addr {
        Some(addr) => {
            PrometheusBuilder::new().with_http_listener(addr).install()?;
            info!(addr = %addr, "Prometheus exporter listening");
            Arc::new(MetricsSink)
        }
        None => Arc::new(NoopSink),
    };

    let admission = Arc::new(AdmissionMiddleware::new(&config.admission).with_sink(sink));
    info!("Admission middleware initialized");

    let grpc_server = GrpcServer::new(config.server.grpc_addr, admission);

    // Run the server with graceful shutdown on Ctrl+C
    grpc_server.serve_with_shutdown(shutdown_signal()).await?;

    info!("Floodgate Admission Service stopped");
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
