use std::time::Duration;

use deployer_store::object::{describe, gvk_of};
use deployer_store::{ResourceStore, bounded};
use kube::ResourceExt;
use kube::core::DynamicObject;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::crd::{ManifestPolicy, UpdateStrategy};
use crate::error::DeployerError;
use crate::manifest::policy::{ApplyDecision, Ownership, decide};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApplyOutcome {
    Created,
    Updated,
    Patched,
    Skipped,
}

/// Applies desired objects one at a time against a target store.
pub struct ApplyEngine<'a> {
    pub store: &'a dyn ResourceStore,
    pub ownership: &'a Ownership,
    pub strategy: UpdateStrategy,
    pub cancel: &'a CancellationToken,
    pub request_timeout: Duration,
}

impl ApplyEngine<'_> {
    /// Converge one resource. On a write, `desired` is replaced by the object
    /// the store returned so that callers see server-assigned identity.
    pub async fn apply_object(
        &self,
        policy: ManifestPolicy,
        desired: &mut DynamicObject,
    ) -> Result<ApplyOutcome, DeployerError> {
        if policy == ManifestPolicy::Ignore {
            return Ok(ApplyOutcome::Skipped);
        }
        let resource = describe(desired);
        let gvk = gvk_of(desired).map_err(|e| {
            DeployerError::client(
                "GetObject",
                format!("unable to get resource {}", resource),
                e,
            )
        })?;
        let namespace = desired.namespace();
        let name = desired.name_any();

        let live = match bounded(
            self.cancel,
            self.request_timeout,
            self.store.get(&gvk, namespace.as_deref(), &name),
        )
        .await
        {
            Ok(live) => Some(live),
            Err(e) if e.is_not_found() => None,
            Err(e) => {
                return Err(DeployerError::client(
                    "GetObject",
                    format!("unable to get resource {}", resource),
                    e,
                ));
            }
        };
        let owned = live
            .as_ref()
            .map(|obj| self.ownership.owns(obj))
            .unwrap_or(false);

        match (decide(policy, live.is_some(), owned), live) {
            (ApplyDecision::Skip, _) => {
                info!(%resource, ?policy, "resource is not owned by this deploy item, skipping");
                Ok(ApplyOutcome::Skipped)
            }
            (ApplyDecision::Create, _) | (ApplyDecision::Apply, None) => {
                self.ownership.stamp(desired);
                let created = bounded(
                    self.cancel,
                    self.request_timeout,
                    self.store.create(desired),
                )
                .await
                .map_err(|e| {
                    DeployerError::client(
                        "CreateObject",
                        format!("unable to create resource {}", resource),
                        e,
                    )
                })?;
                debug!(%resource, "created resource");
                *desired = created;
                Ok(ApplyOutcome::Created)
            }
            (ApplyDecision::Apply, Some(live)) => {
                self.ownership.stamp(desired);
                merge_required_fields(&live, desired);
                let write = match self.strategy {
                    UpdateStrategy::Update => {
                        bounded(self.cancel, self.request_timeout, self.store.update(desired))
                            .await
                    }
                    UpdateStrategy::Patch => {
                        bounded(
                            self.cancel,
                            self.request_timeout,
                            self.store.patch(&live, desired),
                        )
                        .await
                    }
                };
                let applied = write.map_err(|e| {
                    DeployerError::client(
                        "ApplyObject",
                        format!("unable to apply resource {}", resource),
                        e,
                    )
                })?;
                debug!(%resource, strategy = ?self.strategy, "applied resource");
                *desired = applied;
                Ok(match self.strategy {
                    UpdateStrategy::Update => ApplyOutcome::Updated,
                    UpdateStrategy::Patch => ApplyOutcome::Patched,
                })
            }
        }
    }
}

const SERVICE_FIELDS: &[&[&str]] = &[&["spec", "clusterIP"], &["spec", "clusterIPs"]];
const PVC_FIELDS: &[&[&str]] = &[&["spec", "volumeName"]];
const SERVICE_ACCOUNT_FIELDS: &[&[&str]] = &[&["secrets"]];
const NO_FIELDS: &[&[&str]] = &[];

/// Copy fields the server populates (and rejects changes to) from the live
/// object into the desired one, leaving anything the desired object sets.
pub fn merge_required_fields(live: &DynamicObject, desired: &mut DynamicObject) {
    if desired.metadata.resource_version.is_none() {
        desired.metadata.resource_version = live.metadata.resource_version.clone();
    }
    if desired.metadata.uid.is_none() {
        desired.metadata.uid = live.metadata.uid.clone();
    }

    let paths = match gvk_of(desired) {
        Ok(gvk) if gvk.group.is_empty() => match gvk.kind.as_str() {
            "Service" => SERVICE_FIELDS,
            "PersistentVolumeClaim" => PVC_FIELDS,
            "ServiceAccount" => SERVICE_ACCOUNT_FIELDS,
            _ => NO_FIELDS,
        },
        _ => NO_FIELDS,
    };
    for path in paths {
        copy_if_absent(&live.data, &mut desired.data, path);
    }
}

fn copy_if_absent(live: &Value, desired: &mut Value, path: &[&str]) {
    let Some(value) = path.iter().try_fold(live, |v, key| v.get(*key)) else {
        return;
    };
    if value.is_null() {
        return;
    }
    let Some((last, parents)) = path.split_last() else {
        return;
    };
    let mut cursor = desired;
    for key in parents {
        if !cursor.is_object() {
            *cursor = Value::Object(Default::default());
        }
        let Some(map) = cursor.as_object_mut() else {
            return;
        };
        cursor = map
            .entry(key.to_string())
            .or_insert_with(|| Value::Object(Default::default()));
    }
    if !cursor.is_object() {
        *cursor = Value::Object(Default::default());
    }
    if let Some(map) = cursor.as_object_mut() {
        match map.get(*last) {
            Some(existing) if !existing.is_null() => {}
            _ => {
                map.insert(last.to_string(), value.clone());
            }
        }
    }
}
