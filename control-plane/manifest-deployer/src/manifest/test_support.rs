use std::sync::Arc;

use async_trait::async_trait;
use deployer_store::memory::MemoryResourceStore;
use deployer_store::{StoreError, StoreResult};
use kube::core::{DynamicObject, GroupVersionKind};
use serde_json::{Value, json};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::{DeployerContext, DeployerSettings, Manifest};
use crate::controller::host::DeployItemClient;
use crate::crd::{DeployItem, DeployItemSpec, DeployItemStatus, FINALIZER};
use crate::readiness::ReadinessRegistry;

#[derive(Default)]
struct HostState {
    statuses: Vec<Option<DeployItemStatus>>,
    finalizers: Option<Vec<String>>,
    fail_status: bool,
    stall_finalizers: bool,
}

/// Records every status and finalizer write instead of talking to a cluster.
#[derive(Clone, Default)]
pub struct MemoryDeployItemClient {
    state: Arc<Mutex<HostState>>,
}

impl MemoryDeployItemClient {
    pub async fn status_writes(&self) -> usize {
        self.state.lock().await.statuses.len()
    }

    pub async fn last_status(&self) -> Option<DeployItemStatus> {
        self.state
            .lock()
            .await
            .statuses
            .last()
            .cloned()
            .flatten()
    }

    pub async fn finalizers(&self) -> Option<Vec<String>> {
        self.state.lock().await.finalizers.clone()
    }

    pub async fn fail_status_writes(&self) {
        self.state.lock().await.fail_status = true;
    }

    /// Finalizer writes never complete, like an unresponsive API server.
    pub async fn stall_finalizer_writes(&self) {
        self.state.lock().await.stall_finalizers = true;
    }
}

#[async_trait]
impl DeployItemClient for MemoryDeployItemClient {
    async fn patch_status(&self, item: &DeployItem) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        if state.fail_status {
            return Err(StoreError::Backend("status writes disabled".into()));
        }
        state.statuses.push(item.status.clone());
        Ok(())
    }

    async fn set_finalizers(
        &self,
        _item: &DeployItem,
        finalizers: Vec<String>,
    ) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        if state.stall_finalizers {
            drop(state);
            return std::future::pending().await;
        }
        state.finalizers = Some(finalizers);
        Ok(())
    }
}

pub struct Harness {
    pub store: MemoryResourceStore,
    pub host: MemoryDeployItemClient,
    pub ctx: DeployerContext,
}

impl Harness {
    pub fn new() -> Self {
        let store = MemoryResourceStore::new();
        let host = MemoryDeployItemClient::default();
        let ctx = DeployerContext {
            target: Arc::new(store.clone()),
            host: Arc::new(host.clone()),
            readiness: Arc::new(ReadinessRegistry::with_builtin()),
            settings: DeployerSettings::default(),
        };
        Self { store, host, ctx }
    }

    pub fn manifest(&self, item: DeployItem) -> Manifest {
        Manifest::new(item, self.ctx.clone(), CancellationToken::new())
    }
}

/// A finalized deploy item named `web` in `default` at generation 1.
pub fn deploy_item(configuration: Value) -> DeployItem {
    let mut item = DeployItem::new("web", DeployItemSpec { configuration });
    item.metadata.namespace = Some("default".into());
    item.metadata.generation = Some(1);
    item.metadata.finalizers = Some(vec![FINALIZER.to_string()]);
    item
}

pub fn config_map(name: &str) -> Value {
    json!({
        "apiVersion": "v1",
        "kind": "ConfigMap",
        "metadata": {"name": name, "namespace": "default"},
        "data": {"name": name},
    })
}

pub fn entry(policy: &str, manifest: Value) -> Value {
    json!({"policy": policy, "manifest": manifest})
}

pub fn manifests(entries: Vec<Value>) -> Value {
    json!({"manifests": entries})
}

pub fn cm_gvk() -> GroupVersionKind {
    GroupVersionKind::gvk("", "v1", "ConfigMap")
}

pub fn object(v: Value) -> DynamicObject {
    serde_json::from_value(v).unwrap()
}
