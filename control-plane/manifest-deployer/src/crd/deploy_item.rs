use chrono::Utc;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Marker that blocks removal of a DeployItem until its resources are torn down.
pub const FINALIZER: &str = "deployer.manifest.io/finalizer";

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "deployer.manifest.io",
    version = "v1alpha1",
    kind = "DeployItem",
    plural = "deployitems",
    namespaced,
    status = "DeployItemStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct DeployItemSpec {
    /// Provider configuration (manifests + update strategy), kept raw so that
    /// configuration errors surface as deploy item errors instead of watch failures.
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub configuration: serde_json::Value,
}

fn preserve_unknown_fields(
    _: &mut schemars::r#gen::SchemaGenerator,
) -> schemars::schema::Schema {
    let mut obj = schemars::schema::SchemaObject::default();
    obj.extensions.insert(
        "x-kubernetes-preserve-unknown-fields".to_string(),
        serde_json::Value::Bool(true),
    );
    obj.into()
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeployItemStatus {
    pub phase: Option<Phase>,
    pub observed_generation: Option<i64>,
    pub last_error: Option<LastError>,
    /// Opaque, versioned ProviderStatus blob.
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub provider_status: Option<serde_json::Value>,
}

#[derive(
    Deserialize, Serialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq, Default,
)]
pub enum Phase {
    #[default]
    Pending,
    Progressing,
    Succeeded,
    Failed,
    Deleting,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Pending => write!(f, "Pending"),
            Phase::Progressing => write!(f, "Progressing"),
            Phase::Succeeded => write!(f, "Succeeded"),
            Phase::Failed => write!(f, "Failed"),
            Phase::Deleting => write!(f, "Deleting"),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LastError {
    pub operation: String,
    pub reason: String,
    pub message: String,
    pub last_transition_time: Option<String>,
    pub last_update_time: Option<String>,
}

impl LastError {
    /// Build the next error value. The transition time only moves when the
    /// operation or reason differs from `previous`.
    pub fn updated(
        previous: Option<&LastError>,
        operation: &str,
        reason: &str,
        message: &str,
    ) -> LastError {
        let now = Utc::now().to_rfc3339();
        let last_transition_time = match previous {
            Some(prev) if prev.operation == operation && prev.reason == reason => {
                prev.last_transition_time.clone()
            }
            _ => Some(now.clone()),
        };
        LastError {
            operation: operation.to_string(),
            reason: reason.to_string(),
            message: message.to_string(),
            last_transition_time,
            last_update_time: Some(now),
        }
    }
}

impl DeployItem {
    pub fn has_finalizer(&self) -> bool {
        self.metadata
            .finalizers
            .as_ref()
            .map(|f| f.iter().any(|x| x == FINALIZER))
            .unwrap_or(false)
    }

    /// Finalizer list with ours appended (no-op when already present).
    pub fn finalizers_with_ours(&self) -> Vec<String> {
        let mut finals = self.metadata.finalizers.clone().unwrap_or_default();
        if !finals.iter().any(|f| f == FINALIZER) {
            finals.push(FINALIZER.to_string());
        }
        finals
    }

    pub fn finalizers_without_ours(&self) -> Vec<String> {
        self.metadata
            .finalizers
            .clone()
            .unwrap_or_default()
            .into_iter()
            .filter(|f| f != FINALIZER)
            .collect()
    }

    pub fn status_mut(&mut self) -> &mut DeployItemStatus {
        self.status.get_or_insert_with(DeployItemStatus::default)
    }

    pub fn phase(&self) -> Option<Phase> {
        self.status.as_ref().and_then(|s| s.phase)
    }

    pub fn desired_generation(&self) -> Option<i64> {
        self.metadata.generation
    }

    pub fn observed_generation(&self) -> Option<i64> {
        self.status.as_ref().and_then(|s| s.observed_generation)
    }
}
