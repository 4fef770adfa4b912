pub mod apply;
pub mod decode;
pub mod orphans;
pub mod policy;

#[cfg(test)]
mod health_tests;
#[cfg(test)]
pub(crate) mod test_support;

use std::sync::Arc;
use std::time::Duration;

use deployer_store::{ResourceStore, bounded};
use kube::ResourceExt;
use kube::core::DynamicObject;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::controller::host::DeployItemClient;
use crate::crd::{
    DeployItem, LastError, ManagedResourceStatus, ManifestPolicy, Phase,
    ProviderConfiguration, ProviderStatus, TypedReference,
};
use crate::error::DeployerError;
use crate::readiness::{Backoff, ReadinessProber, ReadinessRegistry};

use apply::ApplyEngine;
use decode::decode_manifest;
use orphans::OrphanReconciler;
use policy::Ownership;

pub const OP_RECONCILE: &str = "ReconcileManifests";
pub const OP_HEALTH: &str = "CheckResourcesHealthManifests";
pub const OP_DELETE: &str = "DeleteManifests";
pub const OP_APPLY: &str = "ApplyObjects";

#[derive(Clone, Debug)]
pub struct DeployerSettings {
    /// Value of the instance label stamped on every written resource.
    pub instance_id: String,
    pub delete_timeout: Duration,
    pub delete_poll_interval: Duration,
    pub health_check_timeout: Duration,
    pub health_check: Backoff,
    pub request_timeout: Duration,
}

impl Default for DeployerSettings {
    fn default() -> Self {
        DeployerSettings {
            instance_id: "default".to_string(),
            delete_timeout: Duration::from_secs(60),
            delete_poll_interval: Duration::from_secs(5),
            health_check_timeout: Duration::from_secs(60),
            health_check: Backoff::default(),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Collaborators shared by every deploy item handled by one deployer.
#[derive(Clone)]
pub struct DeployerContext {
    pub target: Arc<dyn ResourceStore>,
    pub host: Arc<dyn DeployItemClient>,
    pub readiness: Arc<ReadinessRegistry>,
    pub settings: DeployerSettings,
}

/// One deploy item bound to its deployer context. Each entry point mutates
/// the item status and persists it before returning.
pub struct Manifest {
    item: DeployItem,
    ctx: DeployerContext,
    cancel: CancellationToken,
}

impl Manifest {
    pub fn new(item: DeployItem, ctx: DeployerContext, cancel: CancellationToken) -> Self {
        Self { item, ctx, cancel }
    }

    pub fn item(&self) -> &DeployItem {
        &self.item
    }

    pub fn into_item(self) -> DeployItem {
        self.item
    }

    /// Converge the target onto the configured manifests and drop resources
    /// that left the configuration.
    #[instrument(skip_all, fields(ns = %self.item.namespace().unwrap_or_default(), name = %self.item.name_any()))]
    pub async fn reconcile(&mut self) -> Result<(), DeployerError> {
        self.item.status_mut().phase = Some(Phase::Progressing);
        match self.apply_manifests().await {
            Ok(provider_status) => {
                let status = self.item.status_mut();
                status.provider_status = Some(provider_status);
                status.last_error = None;
                info!("manifests applied");
                self.persist_status().await
            }
            Err((operation, err)) => Err(self.fail(operation, err).await),
        }
    }

    async fn apply_manifests(
        &self,
    ) -> Result<serde_json::Value, (&'static str, DeployerError)> {
        let on = |op: &'static str| move |e: DeployerError| (op, e);

        let config = ProviderConfiguration::from_value(&self.item.spec.configuration)
            .map_err(on(OP_RECONCILE))?;
        let previous = ProviderStatus::decode(self.provider_status_raw())
            .map_err(on(OP_RECONCILE))?;
        let mut desired = config
            .manifests
            .iter()
            .enumerate()
            .map(|(index, entry)| {
                decode_manifest(index, entry).map(|obj| (entry.policy, obj))
            })
            .collect::<Result<Vec<(ManifestPolicy, DynamicObject)>, _>>()
            .map_err(on(OP_RECONCILE))?;

        let ownership = Ownership::new(
            self.ctx.settings.instance_id.clone(),
            self.item.name_any(),
        );
        let engine = ApplyEngine {
            store: self.ctx.target.as_ref(),
            ownership: &ownership,
            strategy: config.update_strategy,
            cancel: &self.cancel,
            request_timeout: self.ctx.settings.request_timeout,
        };
        let mut managed = Vec::with_capacity(desired.len());
        for (policy, obj) in desired.iter_mut() {
            let outcome = engine
                .apply_object(*policy, obj)
                .await
                .map_err(on(OP_APPLY))?;
            debug!(resource = %TypedReference::from_object(obj), ?outcome, "processed manifest");
            managed.push(ManagedResourceStatus {
                policy: *policy,
                resource: TypedReference::from_object(obj),
            });
        }

        if let Some(previous) = previous {
            let current: Vec<DynamicObject> =
                desired.into_iter().map(|(_, obj)| obj).collect();
            self.orphan_reconciler()
                .reconcile_orphans(&previous.managed_resources, &current)
                .await
                .map_err(on(OP_RECONCILE))?;
        }

        ProviderStatus::new(managed)
            .encode()
            .map_err(on(OP_RECONCILE))
    }

    /// Wait for every recorded resource to become ready, then mark the
    /// current generation as succeeded.
    #[instrument(skip_all, fields(ns = %self.item.namespace().unwrap_or_default(), name = %self.item.name_any()))]
    pub async fn check_resources_health(&mut self) -> Result<(), DeployerError> {
        let resources = match ProviderStatus::decode(self.provider_status_raw()) {
            Ok(status) => status.map(|s| s.managed_resources).unwrap_or_default(),
            Err(err) => return Err(self.fail(OP_HEALTH, err).await),
        };
        if !resources.is_empty() {
            let prober = ReadinessProber {
                store: self.ctx.target.clone(),
                registry: self.ctx.readiness.clone(),
                cancel: self.cancel.clone(),
                request_timeout: self.ctx.settings.request_timeout,
                timeout: self.ctx.settings.health_check_timeout,
            };
            if let Err(err) = prober
                .probe(&resources, self.ctx.settings.health_check)
                .await
            {
                return Err(self.fail(OP_HEALTH, err).await);
            }
        }

        let generation = self.item.desired_generation();
        let status = self.item.status_mut();
        status.phase = Some(Phase::Succeeded);
        status.observed_generation = generation;
        status.last_error = None;
        info!("all resources are healthy");
        self.persist_status().await
    }

    /// Remove every owned resource. The finalizer is only released once the
    /// target reports all of them gone.
    #[instrument(skip_all, fields(ns = %self.item.namespace().unwrap_or_default(), name = %self.item.name_any()))]
    pub async fn delete(&mut self) -> Result<(), DeployerError> {
        self.item.status_mut().phase = Some(Phase::Deleting);
        let status = match ProviderStatus::decode(self.provider_status_raw()) {
            Ok(status) => status,
            Err(err) => return Err(self.fail(OP_DELETE, err).await),
        };
        let managed = status.map(|s| s.managed_resources).unwrap_or_default();
        if managed.is_empty() {
            return self.release_finalizer().await;
        }

        let mut pending = Vec::new();
        for entry in managed.iter().filter(|e| e.policy.deletes_on_removal()) {
            let reference = &entry.resource;
            match bounded(
                &self.cancel,
                self.ctx.settings.request_timeout,
                self.ctx.target.delete(&reference.to_object()),
            )
            .await
            {
                Ok(()) => {
                    debug!(resource = %reference, "deletion requested");
                    pending.push(reference.to_string());
                }
                Err(e) if e.is_not_found() => {}
                Err(e) => {
                    let err = DeployerError::client(
                        "DeleteObject",
                        format!("unable to delete resource {}", reference),
                        e,
                    );
                    return Err(self.fail(OP_DELETE, err).await);
                }
            }
        }

        if pending.is_empty() {
            self.release_finalizer().await
        } else {
            info!(pending = pending.len(), "waiting for resources to be deleted");
            Err(self
                .fail(OP_DELETE, DeployerError::IncompleteDeletion { pending })
                .await)
        }
    }

    fn provider_status_raw(&self) -> Option<&serde_json::Value> {
        self.item
            .status
            .as_ref()
            .and_then(|s| s.provider_status.as_ref())
    }

    fn orphan_reconciler(&self) -> OrphanReconciler {
        OrphanReconciler {
            store: self.ctx.target.clone(),
            cancel: self.cancel.clone(),
            request_timeout: self.ctx.settings.request_timeout,
            delete_timeout: self.ctx.settings.delete_timeout,
            poll_interval: self.ctx.settings.delete_poll_interval,
        }
    }

    /// Record `err` on the item and persist the status. Persistence is best
    /// effort; the original error is always returned.
    async fn fail(&mut self, operation: &str, err: DeployerError) -> DeployerError {
        if matches!(err, DeployerError::Cancelled) {
            return err;
        }
        warn!(operation, reason = err.reason(), error = %err, "deploy item operation failed");
        let status = self.item.status_mut();
        status.last_error = Some(LastError::updated(
            status.last_error.as_ref(),
            operation,
            err.reason(),
            &err.to_string(),
        ));
        if !err.is_retryable() && status.phase != Some(Phase::Deleting) {
            status.phase = Some(Phase::Failed);
        }
        if let Err(persist_err) = self.persist_status().await {
            warn!(error = %persist_err, "unable to persist deploy item status");
        }
        err
    }

    async fn persist_status(&self) -> Result<(), DeployerError> {
        bounded(
            &self.cancel,
            self.ctx.settings.request_timeout,
            self.ctx.host.patch_status(&self.item),
        )
        .await
        .map_err(|e| {
            DeployerError::client(
                "UpdateStatus",
                format!("unable to update status of deploy item {}", self.item.name_any()),
                e,
            )
        })
    }

    async fn release_finalizer(&mut self) -> Result<(), DeployerError> {
        if !self.item.has_finalizer() {
            return Ok(());
        }
        let finalizers = self.item.finalizers_without_ours();
        let res = bounded(
            &self.cancel,
            self.ctx.settings.request_timeout,
            self.ctx.host.set_finalizers(&self.item, finalizers.clone()),
        )
        .await;
        match res {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => {
                let err = DeployerError::client(
                    "RemoveFinalizer",
                    format!("unable to remove finalizer from deploy item {}", self.item.name_any()),
                    e,
                );
                return Err(self.fail(OP_DELETE, err).await);
            }
        }
        self.item.metadata.finalizers = Some(finalizers);
        info!("finalizer removed");
        Ok(())
    }
}
