pub mod host;

use std::sync::Arc;

use deployer_store::{KubeResourceStore, StoreError, bounded};
use futures_util::StreamExt;
use kube::{
    Api, Client, ResourceExt,
    runtime::{Controller, controller::Action, watcher::Config},
};
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{ControllerConfig, DeployerConfig};
use crate::crd::{DeployItem, Phase};
use crate::error::DeployerError;
use crate::manifest::{DeployerContext, Manifest};
use crate::readiness::ReadinessRegistry;
use host::KubeDeployItemClient;

#[derive(thiserror::Error, Debug)]
pub enum ReconcileErr {
    #[error(transparent)]
    Deployer(#[from] DeployerError),
    #[error("unable to add finalizer: {0}")]
    Finalizer(#[source] StoreError),
}

impl ReconcileErr {
    pub fn is_retryable(&self) -> bool {
        match self {
            ReconcileErr::Deployer(e) => e.is_retryable(),
            ReconcileErr::Finalizer(e) => e.is_retryable(),
        }
    }
}

#[derive(Clone)]
pub struct ControllerContext {
    pub deployer: DeployerContext,
    pub cfg: ControllerConfig,
    pub cancel: CancellationToken,
}

pub async fn run_controller(client: Client, cfg: DeployerConfig) -> anyhow::Result<()> {
    let api: Api<DeployItem> = Api::all(client.clone());
    let settings = cfg.settings()?;
    let ctx = Arc::new(ControllerContext {
        deployer: DeployerContext {
            target: Arc::new(KubeResourceStore::new(client.clone())),
            host: Arc::new(KubeDeployItemClient::new(client.clone())),
            readiness: Arc::new(ReadinessRegistry::with_builtin()),
            settings,
        },
        cfg: cfg.controller.clone(),
        cancel: CancellationToken::new(),
    });

    let shutdown = ctx.cancel.clone();
    Controller::new(api, Config::default())
        .graceful_shutdown_on(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "unable to listen for shutdown signal");
                return;
            }
            info!("shutdown requested, cancelling in-flight reconciles");
            shutdown.cancel();
        })
        .run(reconcile, error_policy, ctx)
        .for_each(|res| async move {
            match res {
                Ok((obj_ref, action)) => {
                    info!(name = %obj_ref.name, "reconciled: requeue={:?}", action)
                }
                Err(e) => error!(error = ?e, "reconcile error"),
            }
        })
        .await;

    Ok(())
}

async fn reconcile(
    obj: Arc<DeployItem>,
    ctx: Arc<ControllerContext>,
) -> Result<Action, ReconcileErr> {
    dispatch((*obj).clone(), &ctx.deployer, &ctx.cfg, ctx.cancel.child_token()).await
}

/// Route one deploy item to delete, or to reconcile followed by a health
/// check when its spec or phase calls for it.
pub async fn dispatch(
    mut item: DeployItem,
    deployer: &DeployerContext,
    cfg: &ControllerConfig,
    cancel: CancellationToken,
) -> Result<Action, ReconcileErr> {
    let resync = Action::requeue(Duration::from_secs(cfg.resync_secs));

    if item.metadata.deletion_timestamp.is_some() {
        let mut manifest = Manifest::new(item, deployer.clone(), cancel);
        return match manifest.delete().await {
            Ok(()) => Ok(Action::await_change()),
            Err(DeployerError::IncompleteDeletion { .. }) => Ok(Action::requeue(
                Duration::from_secs(cfg.deleting_requeue_secs),
            )),
            Err(e) => Err(e.into()),
        };
    }

    if !item.has_finalizer() {
        let finalizers = item.finalizers_with_ours();
        bounded(
            &cancel,
            deployer.settings.request_timeout,
            deployer.host.set_finalizers(&item, finalizers.clone()),
        )
        .await
        .map_err(ReconcileErr::Finalizer)?;
        item.metadata.finalizers = Some(finalizers);
    }

    let up_to_date = item.phase() == Some(Phase::Succeeded)
        && item.observed_generation() == item.desired_generation();
    if up_to_date {
        return Ok(resync);
    }

    let mut manifest = Manifest::new(item, deployer.clone(), cancel);
    manifest.reconcile().await?;
    manifest.check_resources_health().await?;
    Ok(resync)
}

fn error_policy(
    obj: Arc<DeployItem>,
    err: &ReconcileErr,
    ctx: Arc<ControllerContext>,
) -> Action {
    warn!(name = %obj.name_any(), error = %err, "deploy item reconcile failed");
    if err.is_retryable() {
        Action::requeue(Duration::from_secs(ctx.cfg.error_requeue_secs))
    } else {
        Action::await_change()
    }
}
