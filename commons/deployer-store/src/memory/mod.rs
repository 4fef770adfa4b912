use async_trait::async_trait;
use kube::ResourceExt;
use kube::core::{DynamicObject, GroupVersionKind};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::error::StoreError;
use crate::object::{describe, gvk_of};
use crate::traits::*;

/// Objects are keyed without their version so that a resource written as
/// `apps/v1` is found again under any served version.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct ObjectKey {
    group: String,
    kind: String,
    namespace: String,
    name: String,
}

impl ObjectKey {
    fn new(gvk: &GroupVersionKind, namespace: Option<&str>, name: &str) -> Self {
        Self {
            group: gvk.group.clone(),
            kind: gvk.kind.clone(),
            namespace: namespace.unwrap_or_default().to_string(),
            name: name.to_string(),
        }
    }

    fn of(obj: &DynamicObject) -> StoreResult<Self> {
        let gvk = gvk_of(obj)?;
        Ok(Self::new(&gvk, obj.namespace().as_deref(), &obj.name_any()))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StoreOp {
    Get,
    Create,
    Update,
    Patch,
    Delete,
    List,
}

/// Number of calls observed per operation.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OpCounts {
    pub get: usize,
    pub create: usize,
    pub update: usize,
    pub patch: usize,
    pub delete: usize,
    pub list: usize,
}

impl OpCounts {
    pub fn writes(&self) -> usize {
        self.create + self.update + self.patch + self.delete
    }

    fn bump(&mut self, op: StoreOp) {
        match op {
            StoreOp::Get => self.get += 1,
            StoreOp::Create => self.create += 1,
            StoreOp::Update => self.update += 1,
            StoreOp::Patch => self.patch += 1,
            StoreOp::Delete => self.delete += 1,
            StoreOp::List => self.list += 1,
        }
    }
}

#[derive(Default)]
struct MemoryState {
    objects: HashMap<ObjectKey, DynamicObject>,
    // deleted while still holding finalizers
    terminating: HashSet<ObjectKey>,
    failures: HashSet<(StoreOp, String)>,
    counts: OpCounts,
    revision: u64,
}

impl MemoryState {
    fn enter(&mut self, op: StoreOp, name: &str) -> StoreResult<()> {
        self.counts.bump(op);
        if self.failures.contains(&(op, name.to_string())) {
            return Err(StoreError::Backend(format!(
                "injected {:?} failure for {}",
                op, name
            )));
        }
        Ok(())
    }

    fn next_revision(&mut self) -> String {
        self.revision += 1;
        self.revision.to_string()
    }
}

/// In-process [`ResourceStore`] with server-like semantics: uid and
/// resourceVersion assignment, stale-write rejection and finalizer-gated
/// deletion.
#[derive(Clone, Default)]
pub struct MemoryResourceStore {
    state: Arc<RwLock<MemoryState>>,
}

impl MemoryResourceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an object directly, bypassing counters and failure injection.
    pub async fn insert(&self, obj: DynamicObject) -> StoreResult<DynamicObject> {
        let key = ObjectKey::of(&obj)?;
        let mut state = self.state.write().await;
        let mut obj = obj;
        if obj.metadata.uid.is_none() {
            obj.metadata.uid = Some(uuid::Uuid::new_v4().to_string());
        }
        obj.metadata.resource_version = Some(state.next_revision());
        state.objects.insert(key, obj.clone());
        Ok(obj)
    }

    pub async fn contains(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
        name: &str,
    ) -> bool {
        let state = self.state.read().await;
        state
            .objects
            .contains_key(&ObjectKey::new(gvk, namespace, name))
    }

    /// Read an object without counting the access.
    pub async fn peek(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
        name: &str,
    ) -> Option<DynamicObject> {
        let state = self.state.read().await;
        state
            .objects
            .get(&ObjectKey::new(gvk, namespace, name))
            .cloned()
    }

    pub async fn is_terminating(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
        name: &str,
    ) -> bool {
        let state = self.state.read().await;
        state
            .terminating
            .contains(&ObjectKey::new(gvk, namespace, name))
    }

    /// Drop all finalizers of an object, completing a pending deletion.
    pub async fn release_finalizers(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
        name: &str,
    ) {
        let key = ObjectKey::new(gvk, namespace, name);
        let mut state = self.state.write().await;
        if state.terminating.remove(&key) {
            state.objects.remove(&key);
        } else if let Some(obj) = state.objects.get_mut(&key) {
            obj.metadata.finalizers = None;
        }
    }

    /// Make every future `op` on objects called `name` fail with a backend error.
    pub async fn inject_failure(&self, op: StoreOp, name: &str) {
        let mut state = self.state.write().await;
        state.failures.insert((op, name.to_string()));
    }

    pub async fn op_counts(&self) -> OpCounts {
        self.state.read().await.counts.clone()
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.objects.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.read().await.objects.is_empty()
    }
}

#[async_trait]
impl ResourceStore for MemoryResourceStore {
    async fn get(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
        name: &str,
    ) -> StoreResult<DynamicObject> {
        let mut state = self.state.write().await;
        state.enter(StoreOp::Get, name)?;
        state
            .objects
            .get(&ObjectKey::new(gvk, namespace, name))
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("{} {}", gvk.kind, name)))
    }

    async fn create(&self, obj: &DynamicObject) -> StoreResult<DynamicObject> {
        let key = ObjectKey::of(obj)?;
        let mut state = self.state.write().await;
        state.enter(StoreOp::Create, &key.name)?;
        if state.objects.contains_key(&key) {
            return Err(StoreError::AlreadyExists(describe(obj)));
        }
        let mut created = obj.clone();
        created.metadata.uid = Some(uuid::Uuid::new_v4().to_string());
        created.metadata.resource_version = Some(state.next_revision());
        state.objects.insert(key, created.clone());
        Ok(created)
    }

    async fn update(&self, obj: &DynamicObject) -> StoreResult<DynamicObject> {
        let key = ObjectKey::of(obj)?;
        let mut state = self.state.write().await;
        state.enter(StoreOp::Update, &key.name)?;
        let live = state
            .objects
            .get(&key)
            .ok_or_else(|| StoreError::NotFound(describe(obj)))?;
        if let Some(rv) = obj.metadata.resource_version.as_ref() {
            if live.metadata.resource_version.as_ref() != Some(rv) {
                return Err(StoreError::Conflict(format!(
                    "{}: resourceVersion {} is stale",
                    describe(obj),
                    rv
                )));
            }
        }
        let mut updated = obj.clone();
        updated.metadata.uid = live.metadata.uid.clone();
        updated.metadata.resource_version = Some(state.next_revision());
        state.objects.insert(key, updated.clone());
        Ok(updated)
    }

    async fn patch(
        &self,
        target: &DynamicObject,
        merge_from: &DynamicObject,
    ) -> StoreResult<DynamicObject> {
        let key = ObjectKey::of(target)?;
        let mut state = self.state.write().await;
        state.enter(StoreOp::Patch, &key.name)?;
        let live = state
            .objects
            .get(&key)
            .ok_or_else(|| StoreError::NotFound(describe(target)))?;
        let uid = live.metadata.uid.clone();
        let mut doc = serde_json::to_value(live)?;
        let mut patch = serde_json::to_value(merge_from)?;
        // server-owned; a merge patch never rewrites them
        if let Some(meta) =
            patch.get_mut("metadata").and_then(|m| m.as_object_mut())
        {
            meta.remove("resourceVersion");
            meta.remove("uid");
        }
        json_patch::merge(&mut doc, &patch);
        let mut patched: DynamicObject = serde_json::from_value(doc)?;
        patched.metadata.uid = uid;
        patched.metadata.resource_version = Some(state.next_revision());
        state.objects.insert(key, patched.clone());
        Ok(patched)
    }

    async fn delete(&self, obj: &DynamicObject) -> StoreResult<()> {
        let key = ObjectKey::of(obj)?;
        let mut state = self.state.write().await;
        state.enter(StoreOp::Delete, &key.name)?;
        let has_finalizers = match state.objects.get(&key) {
            None => return Err(StoreError::NotFound(describe(obj))),
            Some(live) => live
                .metadata
                .finalizers
                .as_ref()
                .map(|f| !f.is_empty())
                .unwrap_or(false),
        };
        if has_finalizers {
            state.terminating.insert(key);
        } else {
            state.objects.remove(&key);
        }
        Ok(())
    }

    async fn list(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
        labels: &BTreeMap<String, String>,
    ) -> StoreResult<Vec<DynamicObject>> {
        let mut state = self.state.write().await;
        state.enter(StoreOp::List, &gvk.kind)?;
        let items = state
            .objects
            .iter()
            .filter(|(key, _)| key.group == gvk.group && key.kind == gvk.kind)
            .filter(|(key, _)| {
                namespace.map(|ns| key.namespace == ns).unwrap_or(true)
            })
            .filter(|(_, obj)| {
                let have = obj.labels();
                labels.iter().all(|(k, v)| have.get(k) == Some(v))
            })
            .map(|(_, obj)| obj.clone())
            .collect();
        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::object_ref;
    use serde_json::json;

    fn config_map(name: &str, data: serde_json::Value) -> DynamicObject {
        let mut obj = object_ref(
            &GroupVersionKind::gvk("", "v1", "ConfigMap"),
            Some("default"),
            name,
        );
        obj.data = json!({ "data": data });
        obj
    }

    fn cm_gvk() -> GroupVersionKind {
        GroupVersionKind::gvk("", "v1", "ConfigMap")
    }

    #[tokio::test]
    async fn create_assigns_identity_and_rejects_duplicates() {
        let store = MemoryResourceStore::new();
        let created = store
            .create(&config_map("a", json!({"k": "v"})))
            .await
            .unwrap();
        assert!(created.metadata.uid.is_some());
        assert!(created.metadata.resource_version.is_some());

        let err = store
            .create(&config_map("a", json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn update_rejects_stale_resource_version() {
        let store = MemoryResourceStore::new();
        let created = store.create(&config_map("a", json!({}))).await.unwrap();

        let mut first = config_map("a", json!({"k": "1"}));
        first.metadata.resource_version = created.metadata.resource_version.clone();
        store.update(&first).await.unwrap();

        // same base revision again is now stale
        let err = store.update(&first).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn patch_merges_fields_and_keeps_uid() {
        let store = MemoryResourceStore::new();
        let created = store
            .create(&config_map("a", json!({"keep": "x", "change": "1"})))
            .await
            .unwrap();

        let desired = config_map("a", json!({"change": "2"}));
        let patched = store.patch(&created, &desired).await.unwrap();
        assert_eq!(patched.metadata.uid, created.metadata.uid);
        assert_eq!(patched.data["data"]["keep"], "x");
        assert_eq!(patched.data["data"]["change"], "2");
    }

    #[tokio::test]
    async fn delete_waits_for_finalizers() {
        let store = MemoryResourceStore::new();
        let mut obj = config_map("a", json!({}));
        obj.metadata.finalizers = Some(vec!["example.com/guard".into()]);
        store.create(&obj).await.unwrap();

        store.delete(&obj).await.unwrap();
        assert!(store.contains(&cm_gvk(), Some("default"), "a").await);
        assert!(store.is_terminating(&cm_gvk(), Some("default"), "a").await);

        store
            .release_finalizers(&cm_gvk(), Some("default"), "a")
            .await;
        assert!(!store.contains(&cm_gvk(), Some("default"), "a").await);
    }

    #[tokio::test]
    async fn list_filters_by_labels_and_namespace() {
        let store = MemoryResourceStore::new();
        let mut labelled = config_map("a", json!({}));
        labelled
            .labels_mut()
            .insert("team".into(), "blue".into());
        store.create(&labelled).await.unwrap();
        store.create(&config_map("b", json!({}))).await.unwrap();

        let mut selector = BTreeMap::new();
        selector.insert("team".to_string(), "blue".to_string());
        let found = store
            .list(&cm_gvk(), Some("default"), &selector)
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name_any(), "a");

        let none = store
            .list(&cm_gvk(), Some("other"), &BTreeMap::new())
            .await
            .unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn injected_failures_surface_as_backend_errors() {
        let store = MemoryResourceStore::new();
        store.inject_failure(StoreOp::Create, "a").await;
        let err = store.create(&config_map("a", json!({}))).await.unwrap_err();
        assert!(matches!(err, StoreError::Backend(_)));
        assert_eq!(store.op_counts().await.create, 1);
        assert!(store.is_empty().await);
    }
}
