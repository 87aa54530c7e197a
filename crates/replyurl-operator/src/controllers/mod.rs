//! Kubernetes controllers for watched resources

pub mod ingress;
pub mod retry;

use std::sync::Arc;

use kube::api::{Patch, PatchParams};
use kube::{Api, Client, ResourceExt};

use crate::config::{Condition, ReplyURLSync, ReplyURLSyncStatus};
use crate::graph::GraphClientFactory;
use crate::reconcile::SyncError;
use crate::registry::SyncSpecSource;
use crate::secrets::SecretResolver;

use self::retry::RetryTracker;

/// Shared state for the controller and the sweeper
pub struct ControllerContext {
    /// Microsoft Graph client factory
    pub graph: Arc<dyn GraphClientFactory>,
    /// Client-secret resolution strategies
    pub secrets: Arc<dyn SecretResolver>,
    /// Snapshot source for ReplyURLSync specs
    pub specs: Arc<dyn SyncSpecSource>,
    /// Kubernetes API client (shared across controllers)
    pub kube_client: Client,
    /// Per-resource retry state
    pub retry_tracker: Arc<RetryTracker>,
}

pub(crate) fn synced_status(synced_hosts: Vec<String>) -> ReplyURLSyncStatus {
    ReplyURLSyncStatus {
        synced_hosts,
        conditions: vec![Condition::synced(true, "Synced", "Reply URLs converged")],
    }
}

pub(crate) fn degraded_status(sync: &ReplyURLSync, error: &SyncError) -> ReplyURLSyncStatus {
    // Keep the last known synced hosts; a failed pass changed nothing remotely
    ReplyURLSyncStatus {
        synced_hosts: sync
            .status
            .as_ref()
            .map(|status| status.synced_hosts.clone())
            .unwrap_or_default(),
        conditions: vec![
            Condition::synced(false, "SyncFailed", &error.to_string()),
            Condition::degraded("SyncFailed", &error.to_string()),
        ],
    }
}

/// Update the status subresource of a ReplyURLSync
pub(crate) async fn update_sync_status(
    client: &Client,
    sync: &ReplyURLSync,
    status: ReplyURLSyncStatus,
) -> Result<(), kube::Error> {
    let name = sync.name_any();
    let api: Api<ReplyURLSync> = match sync.namespace() {
        Some(namespace) => Api::namespaced(client.clone(), &namespace),
        None => Api::default_namespaced(client.clone()),
    };

    let patch = serde_json::json!({
        "status": status
    });

    api.patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch))
        .await?;

    Ok(())
}
