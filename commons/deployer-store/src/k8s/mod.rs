use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::core::{ApiResource, DynamicObject, GroupVersionKind};
use kube::discovery::{ApiCapabilities, Scope, pinned_kind};
use kube::{Client, ResourceExt};
use tokio::sync::RwLock;
use tracing::{debug, trace};

use crate::error::StoreError;
use crate::object::{gvk_of, label_selector};
use crate::traits::*;

type Resolved = (ApiResource, ApiCapabilities);

/// [`ResourceStore`] backed by a Kubernetes API server. Kinds are resolved
/// lazily through discovery and cached for the lifetime of the store.
#[derive(Clone)]
pub struct KubeResourceStore {
    client: Client,
    default_namespace: String,
    resolved: Arc<RwLock<HashMap<String, Resolved>>>,
}

fn cache_key(gvk: &GroupVersionKind) -> String {
    format!("{}/{}/{}", gvk.group, gvk.version, gvk.kind)
}

impl KubeResourceStore {
    pub fn new(client: Client) -> Self {
        let default_namespace = client.default_namespace().to_string();
        Self {
            client,
            default_namespace,
            resolved: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    async fn resolve(&self, gvk: &GroupVersionKind) -> StoreResult<Resolved> {
        let key = cache_key(gvk);
        if let Some(hit) = self.resolved.read().await.get(&key) {
            return Ok(hit.clone());
        }
        let resolved = pinned_kind(&self.client, gvk).await.map_err(|e| {
            match StoreError::from(e) {
                StoreError::NotFound(msg) => StoreError::UnknownKind(format!(
                    "{}: {}",
                    key, msg
                )),
                other => other,
            }
        })?;
        debug!(kind = %key, plural = %resolved.0.plural, "discovery: resolved kind");
        self.resolved.write().await.insert(key, resolved.clone());
        Ok(resolved)
    }

    async fn api(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
    ) -> StoreResult<Api<DynamicObject>> {
        let (ar, caps) = self.resolve(gvk).await?;
        let api = match caps.scope {
            Scope::Cluster => Api::all_with(self.client.clone(), &ar),
            Scope::Namespaced => Api::namespaced_with(
                self.client.clone(),
                namespace
                    .filter(|ns| !ns.is_empty())
                    .unwrap_or(&self.default_namespace),
                &ar,
            ),
        };
        Ok(api)
    }

    async fn api_for(&self, obj: &DynamicObject) -> StoreResult<Api<DynamicObject>> {
        let gvk = gvk_of(obj)?;
        self.api(&gvk, obj.namespace().as_deref()).await
    }
}

#[async_trait]
impl ResourceStore for KubeResourceStore {
    async fn get(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
        name: &str,
    ) -> StoreResult<DynamicObject> {
        trace!(kind = %gvk.kind, ?namespace, %name, "store: get");
        let api = self.api(gvk, namespace).await?;
        Ok(api.get(name).await?)
    }

    async fn create(&self, obj: &DynamicObject) -> StoreResult<DynamicObject> {
        let api = self.api_for(obj).await?;
        Ok(api.create(&PostParams::default(), obj).await?)
    }

    async fn update(&self, obj: &DynamicObject) -> StoreResult<DynamicObject> {
        let api = self.api_for(obj).await?;
        Ok(api.replace(&obj.name_any(), &PostParams::default(), obj).await?)
    }

    async fn patch(
        &self,
        target: &DynamicObject,
        merge_from: &DynamicObject,
    ) -> StoreResult<DynamicObject> {
        let api = self.api_for(target).await?;
        Ok(api
            .patch(
                &target.name_any(),
                &PatchParams::default(),
                &Patch::Merge(merge_from),
            )
            .await?)
    }

    async fn delete(&self, obj: &DynamicObject) -> StoreResult<()> {
        let api = self.api_for(obj).await?;
        api.delete(&obj.name_any(), &DeleteParams::background())
            .await?;
        Ok(())
    }

    async fn list(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
        labels: &BTreeMap<String, String>,
    ) -> StoreResult<Vec<DynamicObject>> {
        let lp = ListParams::default().labels(&label_selector(labels));
        let api = match namespace {
            Some(_) => self.api(gvk, namespace).await?,
            None => {
                let (ar, _) = self.resolve(gvk).await?;
                Api::all_with(self.client.clone(), &ar)
            }
        };
        Ok(api.list(&lp).await?.items)
    }
}
