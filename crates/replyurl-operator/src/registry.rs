//! In-memory index of ReplyURLSync specs
//!
//! Rebuilt from a fresh listing at the start of each pass, so lookups see a
//! consistent read-only snapshot.

use async_trait::async_trait;
use kube::api::ListParams;
use kube::{Api, Client};

use crate::config::ReplyURLSync;

/// Snapshot of the sync specs present in the cluster
#[derive(Debug, Default)]
pub struct SyncRegistry {
    specs: Vec<ReplyURLSync>,
}

impl SyncRegistry {
    pub fn new(specs: Vec<ReplyURLSync>) -> Self {
        Self { specs }
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    /// Specs governing the given ingress class.
    ///
    /// `None` returns every spec (full-sweep passes). A class tag returns all
    /// specs whose `ingressClassFilter` equals it exactly; several specs may
    /// share a class and every one of them is applied.
    pub fn find_by_route_class(&self, route_class: Option<&str>) -> Vec<&ReplyURLSync> {
        match route_class {
            None => self.specs.iter().collect(),
            Some(class) => self
                .specs
                .iter()
                .filter(|sync| sync.spec.ingress_class_filter.as_deref() == Some(class))
                .collect(),
        }
    }
}

/// Source of sync spec snapshots
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SyncSpecSource: Send + Sync {
    /// Take a fresh snapshot of all ReplyURLSync resources
    async fn load(&self) -> Result<SyncRegistry, kube::Error>;
}

/// Loads sync specs from the cluster across all namespaces
pub struct ClusterSpecSource {
    client: Client,
}

impl ClusterSpecSource {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SyncSpecSource for ClusterSpecSource {
    async fn load(&self) -> Result<SyncRegistry, kube::Error> {
        let api: Api<ReplyURLSync> = Api::all(self.client.clone());
        let list = api.list(&ListParams::default()).await?;
        Ok(SyncRegistry::new(list.items))
    }
}
