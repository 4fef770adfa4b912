use deployer_store::object::{gvk_from_parts, object_ref};
use kube::ResourceExt;
use kube::core::{DynamicObject, GroupVersionKind};
use serde::{Deserialize, Serialize};

use crate::error::DeployerError;

pub const PROVIDER_API_VERSION: &str = "deployer.manifest.io/v1alpha1";
pub const PROVIDER_STATUS_KIND: &str = "ProviderStatus";

/// Label scoping all resources written by one deployer instance.
pub const MANAGED_INSTANCE_LABEL: &str = "manifest.deployer.io/instance";
/// Label naming the deploy item that owns a resource.
pub const MANAGED_DEPLOY_ITEM_LABEL: &str = "manifest.deployer.io/deployitem";

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ManifestPolicy {
    /// Fully own: create, update and delete on removal.
    #[default]
    Manage,
    /// Track identity only.
    Ignore,
    /// Own only when unowned or already owned by this deploy item.
    Fallback,
    /// Manage while present, never delete.
    Keep,
}

impl ManifestPolicy {
    /// Whether the resource is deleted once it leaves the rendered set or the
    /// deploy item is torn down.
    pub fn deletes_on_removal(self) -> bool {
        match self {
            ManifestPolicy::Manage | ManifestPolicy::Fallback => true,
            ManifestPolicy::Ignore | ManifestPolicy::Keep => false,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum UpdateStrategy {
    /// Replace the live object with the desired one.
    #[default]
    Update,
    /// JSON merge patch of the desired object onto the live one.
    Patch,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ManifestEntry {
    #[serde(default)]
    pub policy: ManifestPolicy,
    /// Inline object, or a string holding one YAML/JSON document.
    pub manifest: serde_json::Value,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ProviderConfiguration {
    #[serde(default)]
    pub update_strategy: UpdateStrategy,
    #[serde(default)]
    pub manifests: Vec<ManifestEntry>,
}

impl ProviderConfiguration {
    pub fn from_value(value: &serde_json::Value) -> Result<Self, DeployerError> {
        serde_json::from_value(value.clone())
            .map_err(|e| DeployerError::InvalidConfiguration(e.to_string()))
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct TypedReference {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    #[serde(default)]
    pub namespace: String,
}

impl TypedReference {
    pub fn from_object(obj: &DynamicObject) -> Self {
        let (api_version, kind) = obj
            .types
            .as_ref()
            .map(|t| (t.api_version.clone(), t.kind.clone()))
            .unwrap_or_default();
        Self {
            api_version,
            kind,
            name: obj.name_any(),
            namespace: obj.namespace().unwrap_or_default(),
        }
    }

    pub fn gvk(&self) -> GroupVersionKind {
        gvk_from_parts(&self.api_version, &self.kind)
    }

    pub fn namespace(&self) -> Option<&str> {
        Some(self.namespace.as_str()).filter(|ns| !ns.is_empty())
    }

    /// Identity-only object used for get/delete calls.
    pub fn to_object(&self) -> DynamicObject {
        object_ref(&self.gvk(), self.namespace(), &self.name)
    }
}

impl std::fmt::Display for TypedReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.namespace() {
            Some(ns) => write!(f, "{} {}/{}", self.kind, ns, self.name),
            None => write!(f, "{} {}", self.kind, self.name),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ManagedResourceStatus {
    #[serde(default)]
    pub policy: ManifestPolicy,
    pub resource: TypedReference,
}

/// Record of every resource processed by the last successful reconcile, in
/// manifest order. Persisted opaquely in the deploy item status.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProviderStatus {
    pub api_version: String,
    pub kind: String,
    #[serde(default)]
    pub managed_resources: Vec<ManagedResourceStatus>,
}

impl ProviderStatus {
    pub fn new(managed_resources: Vec<ManagedResourceStatus>) -> Self {
        Self {
            api_version: PROVIDER_API_VERSION.to_string(),
            kind: PROVIDER_STATUS_KIND.to_string(),
            managed_resources,
        }
    }

    pub fn encode(&self) -> Result<serde_json::Value, DeployerError> {
        serde_json::to_value(self).map_err(DeployerError::StatusEncode)
    }

    /// Decode a persisted blob. `None` and JSON null mean "never reconciled".
    pub fn decode(
        raw: Option<&serde_json::Value>,
    ) -> Result<Option<Self>, DeployerError> {
        let raw = match raw {
            None | Some(serde_json::Value::Null) => return Ok(None),
            Some(raw) => raw,
        };
        let status: ProviderStatus = serde_json::from_value(raw.clone())
            .map_err(|e| DeployerError::StatusDecode(e.to_string()))?;
        if status.api_version != PROVIDER_API_VERSION
            || status.kind != PROVIDER_STATUS_KIND
        {
            return Err(DeployerError::StatusDecode(format!(
                "unsupported provider status {}/{}",
                status.api_version, status.kind
            )));
        }
        Ok(Some(status))
    }
}
