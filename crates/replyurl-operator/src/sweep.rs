//! Full-sweep reconciliation loop
//!
//! Runs on a periodic interval, and immediately after an ingress deletion,
//! re-deriving the desired reply URLs from every ingress in the cluster and
//! running a full-sweep pass for each ReplyURLSync spec. This is the only
//! path that prunes stale reply URLs; the ingress controller only adds.

use std::sync::Arc;
use std::time::Duration;

use futures::{pin_mut, StreamExt};
use k8s_openapi::api::networking::v1::Ingress;
use kube::api::ListParams;
use kube::runtime::watcher::{self, watcher, Event};
use kube::{Api, Client, ResourceExt};
use tokio::sync::mpsc;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use crate::controllers::{degraded_status, synced_status, update_sync_status, ControllerContext};
use crate::filter::{route_rules_from_ingress, RouteRule};
use crate::reconcile::{run_sync_pass, SyncMode};

/// Seconds between periodic full sweeps
const SWEEP_INTERVAL_SECS: u64 = 300;

/// Run the sweep loop until the process exits
pub async fn run_sweeper(ctx: Arc<ControllerContext>, mut trigger: mpsc::Receiver<()>) {
    let mut tick = interval(Duration::from_secs(SWEEP_INTERVAL_SECS));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    info!(
        interval_secs = SWEEP_INTERVAL_SECS,
        "Starting full-sweep loop"
    );

    loop {
        tokio::select! {
            _ = tick.tick() => {
                debug!("Periodic full sweep");
            }
            Some(_) = trigger.recv() => {
                debug!("Full sweep triggered by ingress deletion");
            }
        }

        if let Err(e) = run_sweep_cycle(&ctx).await {
            error!(error = %e, "Full-sweep cycle failed");
        }
    }
}

/// Run a single full-sweep cycle over every ReplyURLSync spec
pub async fn run_sweep_cycle(ctx: &ControllerContext) -> Result<(), kube::Error> {
    let ingress_api: Api<Ingress> = Api::all(ctx.kube_client.clone());
    let ingresses = ingress_api.list(&ListParams::default()).await?;

    let routes: Vec<RouteRule> = ingresses
        .items
        .iter()
        .flat_map(route_rules_from_ingress)
        .collect();

    // Drop retry state for ingresses that no longer exist
    let active_uids: Vec<String> = ingresses
        .items
        .into_iter()
        .filter_map(|ingress| ingress.metadata.uid)
        .collect();
    ctx.retry_tracker.cleanup(&active_uids);

    let registry = ctx.specs.load().await?;
    if registry.is_empty() {
        debug!("No ReplyURLSync specs in cluster");
        return Ok(());
    }

    debug!(
        routes = routes.len(),
        specs = registry.len(),
        "Starting full sweep"
    );

    let mut failed = 0usize;
    for sync in registry.find_by_route_class(None) {
        match run_sync_pass(
            ctx.graph.as_ref(),
            ctx.secrets.as_ref(),
            sync,
            &routes,
            SyncMode::FullSweep,
        )
        .await
        {
            Ok(delta) => {
                if !delta.is_noop() {
                    info!(
                        sync = %sync.name_any(),
                        added = delta.added.len(),
                        removed = delta.removed.len(),
                        "Full sweep converged reply URLs"
                    );
                }
                update_sync_status(&ctx.kube_client, sync, synced_status(delta.synced_urls()))
                    .await?;
            }
            Err(err) => {
                warn!(sync = %sync.name_any(), error = %err, "Full sweep failed for spec");
                update_sync_status(&ctx.kube_client, sync, degraded_status(sync, &err)).await?;
                failed += 1;
            }
        }
    }

    if failed > 0 {
        warn!(failed, "Full sweep completed with failing specs");
    }

    Ok(())
}

/// Feed the sweep trigger from ingress deletion events.
///
/// The trigger channel has capacity 1; try_send drops the event when a
/// sweep is already queued, coalescing deletion bursts into one sweep.
pub async fn watch_ingress_deletions(client: Client, trigger: mpsc::Sender<()>) {
    let ingresses: Api<Ingress> = Api::all(client);

    info!("Watching ingress deletions");

    let stream = watcher(ingresses, watcher::Config::default());
    pin_mut!(stream);

    while let Some(event) = stream.next().await {
        match event {
            Ok(Event::Deleted(ingress)) => {
                debug!(
                    namespace = %ingress.metadata.namespace.as_deref().unwrap_or("default"),
                    name = %ingress.metadata.name.as_deref().unwrap_or("unknown"),
                    "Ingress deleted, scheduling full sweep"
                );
                let _ = trigger.try_send(());
            }
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "Ingress watch error");
            }
        }
    }
}
