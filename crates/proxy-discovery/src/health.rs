//! Health check HTTP server for Kubernetes probes.
//!
//! Provides `/healthz` (liveness) and `/readyz` (readiness) endpoints.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Shared state for health check endpoints.
pub struct HealthState {
    /// Whether the initial reconciliation pass has completed.
    started: AtomicBool,
    /// Whether the orchestrator client runs without credentials.
    degraded: bool,
}

impl HealthState {
    pub fn new(degraded: bool) -> Self {
        Self {
            started: AtomicBool::new(false),
            degraded,
        }
    }

    /// Mark startup as complete.
    pub fn mark_started(&self) {
        self.started.store(true, Ordering::SeqCst);
        info!("Health check: discovery marked as started");
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded
    }
}

/// Run the health check HTTP server until `cancel` fires.
pub async fn run_health_server(
    state: Arc<HealthState>,
    port: u16,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .with_state(state);

    // The kubelet probes the pod IP from the node
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;

    info!(port = port, "Health check server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await
}

/// Liveness probe endpoint.
async fn healthz() -> StatusCode {
    debug!("Liveness probe: OK");
    StatusCode::OK
}

/// Readiness probe endpoint.
///
/// Returns 503 Service Unavailable until the initial pass has completed. A
/// degraded orchestrator client keeps serving static routes, so it is
/// reported in the body and logs without failing the probe.
async fn readyz(State(state): State<Arc<HealthState>>) -> (StatusCode, &'static str) {
    if !state.is_started() {
        debug!("Readiness probe: NOT READY (startup incomplete)");
        return (StatusCode::SERVICE_UNAVAILABLE, "starting");
    }

    if state.is_degraded() {
        warn!("Readiness probe: OK (orchestrator client degraded, routes frozen)");
        return (StatusCode::OK, "degraded");
    }

    debug!("Readiness probe: OK");
    (StatusCode::OK, "ok")
}
