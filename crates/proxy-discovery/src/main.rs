use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::select;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use proxy_discovery::health::{run_health_server, HealthState};
use proxy_discovery::{DiscoveryConfig, DiscoveryRuntime, InMemoryRoutingTable, Orchestrator};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON formatting for production
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
                .with_current_span(false),
        )
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,proxy_discovery=debug")),
        )
        .init();

    info!("proxy-discovery starting");

    let config = DiscoveryConfig::from_env().context("Failed to load configuration")?;

    info!(
        namespace = %config.namespace,
        pod = %config.pod_name,
        selector = %config.label_selector(),
        prefix = %config.name_prefix,
        static_routes = config.static_routes.len(),
        "Loaded configuration"
    );

    let orchestrator = Orchestrator::in_cluster();
    let table = Arc::new(InMemoryRoutingTable::with_routes(config.static_routes.clone()));
    let health = Arc::new(HealthState::new(orchestrator.is_degraded()));

    // Setup signal handlers
    let mut sigterm = signal(SignalKind::terminate()).context("Failed to setup SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to setup SIGINT handler")?;

    let cancel = CancellationToken::new();
    let mut health_server = tokio::spawn(run_health_server(
        health.clone(),
        config.health_port,
        cancel.child_token(),
    ));

    let runtime = DiscoveryRuntime::start(&config, orchestrator, table.clone()).await;
    health.mark_started();

    info!(routes = table.len(), "Discovery running");

    select! {
        result = &mut health_server => {
            match result {
                Ok(Ok(())) => error!("Health server exited unexpectedly"),
                Ok(Err(e)) => error!(error = %e, "Health server failed"),
                Err(e) => error!(error = ?e, "Health server task failed"),
            }
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down gracefully");
        }
        _ = sigint.recv() => {
            info!("Received SIGINT, shutting down gracefully");
        }
    }

    cancel.cancel();
    runtime.shutdown().await;
    if !health_server.is_finished() {
        let _ = health_server.await;
    }
    info!("Shutdown complete");

    Ok(())
}
