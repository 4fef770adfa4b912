use std::sync::Arc;
use std::time::Duration;

use deployer_store::object::gvk_of;
use deployer_store::{ResourceStore, StoreError, bounded};
use kube::ResourceExt;
use kube::core::DynamicObject;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::crd::{ManagedResourceStatus, TypedReference};
use crate::error::DeployerError;

/// Removes resources recorded by a previous reconcile that the current
/// rendering no longer contains.
#[derive(Clone)]
pub struct OrphanReconciler {
    pub store: Arc<dyn ResourceStore>,
    pub cancel: CancellationToken,
    pub request_timeout: Duration,
    pub delete_timeout: Duration,
    pub poll_interval: Duration,
}

impl OrphanReconciler {
    /// Deletions run concurrently; every failure is collected and reported
    /// together once all of them have finished.
    #[instrument(skip_all, fields(previous = previous.len(), current = current.len()))]
    pub async fn reconcile_orphans(
        &self,
        previous: &[ManagedResourceStatus],
        current: &[DynamicObject],
    ) -> Result<(), DeployerError> {
        let mut errors = Vec::new();
        let mut tasks = JoinSet::new();

        for entry in previous {
            if !entry.policy.deletes_on_removal() {
                continue;
            }
            let reference = &entry.resource;
            let fetched = match bounded(
                &self.cancel,
                self.request_timeout,
                self.store
                    .get(&reference.gvk(), reference.namespace(), &reference.name),
            )
            .await
            {
                Ok(obj) => obj,
                Err(e) if e.is_not_found() => continue,
                Err(StoreError::Cancelled) => return Err(DeployerError::Cancelled),
                Err(e) => {
                    warn!(resource = %reference, error = %e, "unable to look up previously managed resource");
                    errors.push(DeployerError::client(
                        "GetObject",
                        format!("unable to get resource {}", reference),
                        e,
                    ));
                    continue;
                }
            };
            if contains_object(current, &fetched) {
                continue;
            }
            info!(resource = %reference, "deleting orphaned resource");
            let this = self.clone();
            let reference = reference.clone();
            tasks.spawn(async move { this.delete_and_wait(reference, fetched).await });
        }

        let mut cancelled = false;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(DeployerError::Cancelled)) => cancelled = true,
                Ok(Err(e)) => errors.push(e),
                Err(e) => errors.push(DeployerError::Task(e.to_string())),
            }
        }

        if cancelled || self.cancel.is_cancelled() {
            return Err(DeployerError::Cancelled);
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(DeployerError::Aggregate(errors))
        }
    }

    async fn delete_and_wait(
        &self,
        reference: TypedReference,
        obj: DynamicObject,
    ) -> Result<(), DeployerError> {
        match bounded(&self.cancel, self.request_timeout, self.store.delete(&obj)).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => {
                return Err(DeployerError::client(
                    "DeleteObject",
                    format!("unable to delete resource {}", reference),
                    e,
                ));
            }
        }
        self.wait_for_deletion(&reference).await
    }

    /// Poll until the store reports the object gone, checking once right away.
    async fn wait_for_deletion(&self, reference: &TypedReference) -> Result<(), DeployerError> {
        let gvk = reference.gvk();
        let deadline = Instant::now() + self.delete_timeout;
        loop {
            match bounded(
                &self.cancel,
                self.request_timeout,
                self.store.get(&gvk, reference.namespace(), &reference.name),
            )
            .await
            {
                Err(e) if e.is_not_found() => {
                    debug!(resource = %reference, "resource deleted");
                    return Ok(());
                }
                Err(StoreError::Cancelled) => return Err(DeployerError::Cancelled),
                // still present, or a transient failure
                _ => {}
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(DeployerError::DeletionTimeout {
                    resource: reference.to_string(),
                });
            }
            let wait = self.poll_interval.min(deadline - now);
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(DeployerError::Cancelled),
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }
}

/// Membership test used for orphan detection. Objects that both carry a uid
/// are compared by uid, everything else by group, kind, namespace and name.
pub fn contains_object(candidates: &[DynamicObject], obj: &DynamicObject) -> bool {
    candidates.iter().any(|candidate| match (candidate.uid(), obj.uid()) {
        (Some(a), Some(b)) => a == b,
        _ => same_identity(candidate, obj),
    })
}

fn same_identity(a: &DynamicObject, b: &DynamicObject) -> bool {
    let kinds_match = match (gvk_of(a), gvk_of(b)) {
        (Ok(x), Ok(y)) => x.group == y.group && x.kind == y.kind,
        _ => false,
    };
    kinds_match && a.name_any() == b.name_any() && a.namespace() == b.namespace()
}
