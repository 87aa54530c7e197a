//! Reply-URL reconciliation
//!
//! One pass: validate the sync spec, derive the desired reply URLs from the
//! routing snapshot, fetch the stored list, diff, and issue a single
//! whole-list replace when anything changed. A pass never retries on its own
//! and never partially applies a delta; failures bubble up to the controller
//! for requeueing.

use std::collections::BTreeSet;
use std::fmt;

use kube::{Resource, ResourceExt};
use regex::Regex;
use thiserror::Error;
use tracing::{info, instrument};

use crate::config::ReplyURLSync;
use crate::filter::{HostFilter, RouteRule};
use crate::graph::{AppRegistrationClient, GraphClientFactory, GraphError};
use crate::secrets::{SecretError, SecretResolver};

/// How the desired set for a pass was assembled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// Desired set covers a single changed ingress; stored entries are never
    /// pruned because one ingress cannot speak for the whole cluster.
    Targeted,
    /// Desired set covers all known ingresses; stale entries are pruned,
    /// subject to the spec's reply-URL filter.
    FullSweep,
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncMode::Targeted => f.write_str("targeted"),
            SyncMode::FullSweep => f.write_str("full-sweep"),
        }
    }
}

/// Mutation computed by one pass. Produced whether or not a write happened.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Delta {
    pub added: BTreeSet<String>,
    pub removed: BTreeSet<String>,
    pub unchanged: BTreeSet<String>,
}

impl Delta {
    /// True when the stored list already matches and no write is needed
    pub fn is_noop(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }

    /// Reply URLs present after the pass, sorted
    pub fn synced_urls(&self) -> Vec<String> {
        self.added.union(&self.unchanged).cloned().collect()
    }
}

/// Outcome of diffing the stored list against the desired set
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyUrlDiff {
    /// Whole list to store remotely. Kept entries stay in stored order,
    /// additions are appended.
    pub reply_urls: Vec<String>,
    pub delta: Delta,
}

/// Diff the stored reply URLs against the desired set.
///
/// Stored entries in `desired` are kept. Stored entries absent from
/// `desired` are pruned only in full-sweep mode, and only when `url_filter`
/// is unset or matches the entry; a non-matching entry is protected and
/// kept, so manually managed URLs survive the sweep. Desired entries absent
/// from the store become additions.
pub fn diff_reply_urls(
    actual: &[String],
    desired: &BTreeSet<String>,
    url_filter: Option<&Regex>,
    mode: SyncMode,
) -> ReplyUrlDiff {
    let mut delta = Delta::default();
    let mut reply_urls = Vec::with_capacity(actual.len() + desired.len());

    for url in actual {
        if desired.contains(url) {
            delta.unchanged.insert(url.clone());
            reply_urls.push(url.clone());
            continue;
        }

        let prune = mode == SyncMode::FullSweep
            && url_filter.map_or(true, |filter| filter.is_match(url));
        if prune {
            delta.removed.insert(url.clone());
        } else {
            delta.unchanged.insert(url.clone());
            reply_urls.push(url.clone());
        }
    }

    for url in desired {
        if !actual.contains(url) {
            delta.added.insert(url.clone());
            reply_urls.push(url.clone());
        }
    }

    ReplyUrlDiff { reply_urls, delta }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Field '{field}' is missing please add to your {resource} resource")]
    MissingField {
        field: &'static str,
        resource: String,
    },
    #[error("invalid pattern {pattern:?} in {field}: {source}")]
    InvalidFilter {
        field: &'static str,
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error(transparent)]
    Secret(#[from] SecretError),
    #[error(transparent)]
    Graph(#[from] GraphError),
}

fn resource_name(sync: &ReplyURLSync) -> String {
    format!("{}./{}", ReplyURLSync::kind(&()), sync.name_any())
}

fn required_field<'a>(
    value: &'a Option<String>,
    field: &'static str,
    sync: &ReplyURLSync,
) -> Result<&'a str, SyncError> {
    value.as_deref().ok_or_else(|| SyncError::MissingField {
        field,
        resource: resource_name(sync),
    })
}

/// Run one reconciliation pass for a single sync spec.
///
/// Fetches nothing and writes nothing when validation or credential
/// resolution fails. When the diff is empty the stored list is left
/// untouched. Returns the [`Delta`] either way.
#[instrument(skip_all, fields(sync = %sync.name_any(), mode = %mode))]
pub async fn run_sync_pass(
    graph: &dyn GraphClientFactory,
    secrets: &dyn SecretResolver,
    sync: &ReplyURLSync,
    routes: &[RouteRule],
    mode: SyncMode,
) -> Result<Delta, SyncError> {
    let object_id = required_field(&sync.spec.object_id, ".spec.objectID", sync)?;
    let tenant_id = required_field(&sync.spec.tenant_id, ".spec.tenantID", sync)?;
    let client_id = required_field(&sync.spec.client_id, ".spec.clientID", sync)?;

    let host_filter = HostFilter::from_spec(&sync.spec).map_err(|source| SyncError::InvalidFilter {
        field: ".spec.domainFilter",
        pattern: sync.spec.domain_filter().to_string(),
        source,
    })?;
    let url_filter = sync
        .spec
        .reply_url_filter
        .as_deref()
        .map(Regex::new)
        .transpose()
        .map_err(|source| SyncError::InvalidFilter {
            field: ".spec.replyURLFilter",
            pattern: sync.spec.reply_url_filter.clone().unwrap_or_default(),
            source,
        })?;

    let desired: BTreeSet<String> = host_filter.desired_reply_urls(routes).collect();

    let secret = secrets.resolve(&sync.spec.client_secret).await?;
    let client = graph.connect(tenant_id, client_id, &secret).await?;

    let actual = client.get_reply_urls(object_id).await?;
    let diff = diff_reply_urls(&actual, &desired, url_filter.as_ref(), mode);

    if diff.delta.is_noop() {
        info!(
            unchanged = diff.delta.unchanged.len(),
            "Reply URLs already converged"
        );
        return Ok(diff.delta);
    }

    client.replace_reply_urls(object_id, diff.reply_urls).await?;
    info!(
        added = diff.delta.added.len(),
        removed = diff.delta.removed.len(),
        unchanged = diff.delta.unchanged.len(),
        "Reply URLs converged"
    );

    Ok(diff.delta)
}
