use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use kube::Client;
use tokio::select;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{error, info, warn};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use replyurl_operator::controllers::retry::RetryTracker;
use replyurl_operator::controllers::ControllerContext;
use replyurl_operator::graph::AzureGraphClientFactory;
use replyurl_operator::health::{self, HealthState, DEFAULT_HEALTH_PORT};
use replyurl_operator::registry::ClusterSpecSource;
use replyurl_operator::secrets::AzureSecretResolver;
use replyurl_operator::sweep;

const SHUTDOWN_GRACE_SECS: u64 = 30;

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
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    info!("replyurl-operator starting");

    // Create Kubernetes client
    let kube_client = Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;

    info!("Connected to Kubernetes cluster");

    // Create ControllerContext shared between the controller and the sweeper
    let ctx = Arc::new(ControllerContext {
        graph: Arc::new(AzureGraphClientFactory::new()),
        secrets: Arc::new(AzureSecretResolver::new()),
        specs: Arc::new(ClusterSpecSource::new(kube_client.clone())),
        kube_client: kube_client.clone(),
        retry_tracker: Arc::new(RetryTracker::new()),
    });

    let health_state = Arc::new(HealthState::new());
    let health_port = health_port_from_env();

    // Ingress deletions trigger an out-of-cycle sweep so stale reply URLs
    // are pruned promptly instead of waiting for the next interval
    let (sweep_tx, sweep_rx) = mpsc::channel::<()>(1);

    info!("Starting controllers");

    // Setup signal handlers
    let mut sigterm = signal(SignalKind::terminate()).context("Failed to setup SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to setup SIGINT handler")?;

    // Start the controller, sweeper, deletion watcher, and health server concurrently
    select! {
        result = run_controllers(kube_client.clone(), ctx.clone()) => {
            // Controller failure should trigger pod restart
            return result.context("Controller failure");
        }
        _ = sweep::run_sweeper(ctx.clone(), sweep_rx) => {
            // Sweep loop should never exit
            bail!("Sweep loop exited unexpectedly");
        }
        _ = sweep::watch_ingress_deletions(kube_client.clone(), sweep_tx) => {
            bail!("Ingress deletion watcher exited unexpectedly");
        }
        result = health::run_health_server(health_state.clone(), health_port) => {
            result.context("Health check server failed")?;
            bail!("Health check server exited unexpectedly");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down gracefully");
        }
        _ = sigint.recv() => {
            info!("Received SIGINT, shutting down gracefully");
        }
    }

    // Graceful shutdown
    info!(
        grace_seconds = SHUTDOWN_GRACE_SECS,
        "Starting graceful shutdown"
    );
    sleep(Duration::from_secs(SHUTDOWN_GRACE_SECS)).await;
    info!("Shutdown complete");

    Ok(())
}

/// Resolve the health server port from `HEALTH_PORT`, falling back to the default
fn health_port_from_env() -> u16 {
    match std::env::var("HEALTH_PORT") {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            warn!(value = %raw, "Invalid HEALTH_PORT, using default");
            DEFAULT_HEALTH_PORT
        }),
        Err(_) => DEFAULT_HEALTH_PORT,
    }
}

/// Run the Ingress controller
///
/// Returns an error if the controller exits unexpectedly, which should trigger
/// a pod restart by Kubernetes.
async fn run_controllers(client: Client, ctx: Arc<ControllerContext>) -> Result<()> {
    info!("Starting Ingress controller");
    let ingress = tokio::spawn(replyurl_operator::controllers::ingress::run(
        client.clone(),
        ctx.clone(),
    ));

    info!("All controllers spawned");

    // Wait for the controller to exit (it shouldn't under normal operation)
    let result = ingress.await;
    handle_controller_exit("Ingress", result)
}

/// Handle a controller task exit, returning an error to trigger pod restart
fn handle_controller_exit(
    name: &str,
    result: std::result::Result<(), tokio::task::JoinError>,
) -> Result<()> {
    match result {
        Ok(()) => {
            error!(controller = name, "Controller exited unexpectedly");
            bail!("{} controller exited unexpectedly", name)
        }
        Err(e) if e.is_panic() => {
            error!(controller = name, "Controller panicked");
            bail!("{} controller panicked: {:?}", name, e.into_panic())
        }
        Err(e) if e.is_cancelled() => {
            warn!(controller = name, "Controller was cancelled");
            bail!("{} controller was cancelled", name)
        }
        Err(e) => {
            error!(controller = name, error = ?e, "Controller task failed");
            bail!("{} controller task failed: {}", name, e)
        }
    }
}
