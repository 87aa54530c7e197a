//! Health check HTTP server for Kubernetes probes.
//!
//! Provides `/healthz` (liveness) and `/readyz` (readiness) endpoints.
//! Graph connections are minted per reconciliation pass, so readiness only
//! reflects operator startup; there is no persistent backend to probe.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tracing::{debug, info};

/// Default port for health check server.
pub const DEFAULT_HEALTH_PORT: u16 = 8081;

/// Shared state for health check endpoints.
#[derive(Default)]
pub struct HealthState {
    /// Whether the operator has completed startup.
    started: AtomicBool,
}

impl HealthState {
    pub fn new() -> Self {
        Self {
            started: AtomicBool::new(false),
        }
    }

    /// Mark the operator as started and ready.
    pub fn mark_started(&self) {
        self.started.store(true, Ordering::SeqCst);
        info!("Health check: operator marked as started");
    }

    /// Check if the operator has completed startup.
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }
}

/// Run the health check HTTP server.
///
/// This function runs until the server encounters a fatal error.
/// It should be spawned as a separate task alongside the controllers.
///
/// The operator is marked as started only after the server successfully binds,
/// eliminating any race condition between startup and probe availability.
pub async fn run_health_server(state: Arc<HealthState>, port: u16) -> std::io::Result<()> {
    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .with_state(state.clone());

    // Bind to localhost only - health endpoints should only be accessible
    // within the pod via the kubelet, not externally
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = TcpListener::bind(addr).await?;

    info!(port = port, "Health check server listening");

    // Mark as started only after successful bind - ensures readiness probes
    // can't succeed before the health server is actually listening
    state.mark_started();

    axum::serve(listener, app).await
}

/// Liveness probe endpoint.
///
/// Returns 200 OK if the process is alive.
/// Kubernetes will restart the pod if this endpoint stops responding.
async fn healthz() -> StatusCode {
    debug!("Liveness probe: OK");
    StatusCode::OK
}

/// Readiness probe endpoint.
///
/// Returns 200 OK once startup has completed, 503 Service Unavailable
/// before that.
async fn readyz(State(state): State<Arc<HealthState>>) -> StatusCode {
    if !state.is_started() {
        debug!("Readiness probe: NOT READY (startup incomplete)");
        return StatusCode::SERVICE_UNAVAILABLE;
    }

    debug!("Readiness probe: OK");
    StatusCode::OK
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_healthz_returns_ok() {
        let result = healthz().await;
        assert_eq!(result, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_readyz_returns_unavailable_before_startup() {
        let state = Arc::new(HealthState::new());

        let result = readyz(State(state)).await;
        assert_eq!(result, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_readyz_returns_ok_after_startup() {
        let state = Arc::new(HealthState::new());
        state.mark_started();

        let result = readyz(State(state)).await;
        assert_eq!(result, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_mark_started_is_idempotent() {
        let state = Arc::new(HealthState::new());

        // Initially not started
        assert!(!state.is_started());

        // First call marks as started
        state.mark_started();
        assert!(state.is_started());

        // Second call should be safe (idempotent)
        state.mark_started();
        assert!(state.is_started());
    }
}
