use async_trait::async_trait;
use deployer_store::{StoreError, StoreResult};
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, ResourceExt};
use serde_json::json;

use crate::crd::DeployItem;

/// Writes back to the cluster hosting the DeployItem objects.
#[async_trait]
pub trait DeployItemClient: Send + Sync {
    async fn patch_status(&self, item: &DeployItem) -> StoreResult<()>;

    async fn set_finalizers(
        &self,
        item: &DeployItem,
        finalizers: Vec<String>,
    ) -> StoreResult<()>;
}

#[derive(Clone)]
pub struct KubeDeployItemClient {
    client: Client,
}

impl KubeDeployItemClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, item: &DeployItem) -> Api<DeployItem> {
        match item.namespace() {
            Some(ns) => Api::namespaced(self.client.clone(), &ns),
            None => Api::default_namespaced(self.client.clone()),
        }
    }
}

#[async_trait]
impl DeployItemClient for KubeDeployItemClient {
    async fn patch_status(&self, item: &DeployItem) -> StoreResult<()> {
        let patch = json!({ "status": item.status });
        self.api(item)
            .patch_status(&item.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map(|_| ())
            .map_err(StoreError::from)
    }

    async fn set_finalizers(
        &self,
        item: &DeployItem,
        finalizers: Vec<String>,
    ) -> StoreResult<()> {
        let patch = json!({ "metadata": { "finalizers": finalizers } });
        self.api(item)
            .patch(&item.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map(|_| ())
            .map_err(StoreError::from)
    }
}
