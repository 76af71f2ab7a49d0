use kokeilu::config::EngineConfig;
use kokeilu::controller::{
    ExperimentFacade, ExperimentRepository, HttpMetricsReader, InMemoryRepository, MetricsReader,
    NoOpMetricsReader, SystemClock,
};
use kokeilu::server::{
    build_router, create_metrics, run_server, shutdown_channel, wait_for_signal, ReadinessState,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Longest we wait for in-flight requests after the shutdown signal
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Pick the metrics reader from configuration
fn metrics_reader(config: &EngineConfig) -> Arc<dyn MetricsReader> {
    match &config.metrics_reader_address {
        Some(address) => {
            info!(address = %address, timeout = ?config.metrics_timeout, "Metrics reader configured");
            Arc::new(HttpMetricsReader::new(
                address.clone(),
                config.metrics_timeout,
            ))
        }
        None => {
            info!("Metrics reader address not configured - iteration results will report no data");
            Arc::new(NoOpMetricsReader)
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting kokeilu experiment engine");

    let config = match EngineConfig::from_env() {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "Invalid configuration");
            return Err(e.into());
        }
    };
    info!(
        port = config.port,
        default_page_size = config.limits.default_page_size,
        max_page_size = config.limits.max_page_size,
        max_batch_size = config.limits.max_batch_size,
        "Configuration loaded"
    );

    let (shutdown_controller, shutdown_signal) = shutdown_channel();

    // Not ready until the router is built
    let readiness = ReadinessState::new();

    let metrics = create_metrics()?;
    info!("Prometheus metrics registry initialized");

    let repository: Arc<dyn ExperimentRepository> = Arc::new(InMemoryRepository::new());
    let facade = Arc::new(ExperimentFacade::new(
        repository,
        metrics_reader(&config),
        Arc::new(SystemClock),
        &config,
        Some(metrics.clone()),
    ));

    let app = build_router(readiness.clone(), metrics, facade);
    let port = config.port;
    let mut server_handle = tokio::spawn(async move { run_server(port, app, shutdown_signal).await });

    readiness.set_ready();
    info!("Engine ready, serving experiment API");

    tokio::select! {
        result = &mut server_handle => {
            // Server exited on its own (bind failure or fatal I/O error)
            return match result {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => {
                    error!(error = %e, "Server failed");
                    Err(e.into())
                }
                Err(e) => {
                    error!(error = %e, "Server task panicked");
                    Err(e.into())
                }
            };
        }
        signal = wait_for_signal() => {
            info!(signal = signal, "Initiating graceful shutdown");
            // Stop advertising readiness before draining
            readiness.set_not_ready();
        }
    }

    shutdown_controller.shutdown();

    match tokio::time::timeout(DRAIN_TIMEOUT, &mut server_handle).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => warn!(error = %e, "Server error during shutdown"),
        Ok(Err(e)) => warn!(error = %e, "Server task failed during shutdown"),
        Err(_) => {
            warn!(timeout = ?DRAIN_TIMEOUT, "In-flight requests did not drain, aborting");
            server_handle.abort();
        }
    }

    info!("kokeilu shut down gracefully");
    Ok(())
}
