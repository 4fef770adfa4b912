use std::time::Duration;

use serde_json::{Value, json};
use tokio::time::Instant;

use super::OP_HEALTH;
use super::test_support::*;
use crate::crd::{LastError, Phase};
use crate::error::DeployerError;

fn deployment(ready_replicas: i32) -> Value {
    json!({
        "apiVersion": "apps/v1",
        "kind": "Deployment",
        "metadata": {"name": "web", "namespace": "default", "generation": 1},
        "spec": {"replicas": 1, "selector": {}, "template": {}},
        "status": {
            "observedGeneration": 1,
            "updatedReplicas": 1,
            "readyReplicas": ready_replicas,
            "availableReplicas": ready_replicas
        }
    })
}

#[tokio::test(start_paused = true)]
async fn empty_provider_status_is_trivially_healthy() {
    let h = Harness::new();
    let mut item = deploy_item(manifests(vec![]));
    item.metadata.generation = Some(4);
    let mut m = h.manifest(item);
    m.reconcile().await.unwrap();
    m.check_resources_health().await.unwrap();

    let status = m.item().status.clone().unwrap();
    assert_eq!(status.phase, Some(Phase::Succeeded));
    assert_eq!(status.observed_generation, Some(4));
    assert_eq!(h.store.op_counts().await.get, 0);
}

#[tokio::test(start_paused = true)]
async fn never_reconciled_items_are_healthy() {
    let h = Harness::new();
    let mut m = h.manifest(deploy_item(manifests(vec![])));
    m.check_resources_health().await.unwrap();
    assert_eq!(m.item().phase(), Some(Phase::Succeeded));
    assert_eq!(m.item().observed_generation(), Some(1));
}

#[tokio::test(start_paused = true)]
async fn ready_resources_mark_the_generation_succeeded_and_clear_errors() {
    let h = Harness::new();
    let mut item = deploy_item(manifests(vec![
        entry("manage", deployment(1)),
        entry("manage", config_map("cfg")),
    ]));
    item.status_mut().last_error = Some(LastError::updated(
        None,
        OP_HEALTH,
        "CheckResourcesReadiness",
        "previously unready",
    ));
    let mut m = h.manifest(item);
    m.reconcile().await.unwrap();
    m.check_resources_health().await.unwrap();

    let persisted = h.host.last_status().await.unwrap();
    assert_eq!(persisted.phase, Some(Phase::Succeeded));
    assert_eq!(persisted.observed_generation, Some(1));
    assert!(persisted.last_error.is_none());
}

#[tokio::test(start_paused = true)]
async fn resources_ready_by_the_second_poll_succeed() {
    let h = Harness::new();
    let mut item = deploy_item(manifests(vec![entry("manage", deployment(0))]));
    item.status_mut().last_error = Some(LastError::updated(
        None,
        OP_HEALTH,
        "CheckResourcesReadiness",
        "previously unready",
    ));
    let mut m = h.manifest(item);
    m.reconcile().await.unwrap();

    let store = h.store.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(3)).await;
        store.insert(object(deployment(1))).await.unwrap();
    });

    let gets_before = h.store.op_counts().await.get;
    let started = Instant::now();
    m.check_resources_health().await.unwrap();

    assert_eq!(started.elapsed(), Duration::from_secs(5));
    assert_eq!(h.store.op_counts().await.get - gets_before, 2);
    let persisted = h.host.last_status().await.unwrap();
    assert_eq!(persisted.phase, Some(Phase::Succeeded));
    assert_eq!(persisted.observed_generation, Some(1));
    assert!(persisted.last_error.is_none());
}

#[tokio::test(start_paused = true)]
async fn unready_resources_record_the_error_and_keep_the_phase() {
    let h = Harness::new();
    let mut m = h.manifest(deploy_item(manifests(vec![entry(
        "manage",
        deployment(0),
    )])));
    m.reconcile().await.unwrap();

    let started = Instant::now();
    let err = m.check_resources_health().await.unwrap_err();
    assert_eq!(started.elapsed(), Duration::from_secs(10));
    assert!(matches!(err, DeployerError::ReadinessTimeout { .. }));
    assert!(err.is_retryable());

    let status = m.item().status.clone().unwrap();
    assert_eq!(status.phase, Some(Phase::Progressing));
    assert_eq!(status.observed_generation, None);
    let last = status.last_error.unwrap();
    assert_eq!(last.operation, OP_HEALTH);
    assert!(last.message.contains("Deployment default/web"));
}

#[tokio::test(start_paused = true)]
async fn ignored_resources_are_not_probed() {
    let h = Harness::new();
    let mut m = h.manifest(deploy_item(manifests(vec![entry(
        "ignore",
        deployment(0),
    )])));
    m.reconcile().await.unwrap();
    m.check_resources_health().await.unwrap();
    assert_eq!(m.item().phase(), Some(Phase::Succeeded));
}

#[tokio::test(start_paused = true)]
async fn corrupt_provider_status_fails_the_item() {
    let h = Harness::new();
    let mut item = deploy_item(manifests(vec![]));
    item.status_mut().provider_status = Some(json!({"apiVersion": "v0", "kind": "Nope"}));
    let mut m = h.manifest(item);
    let err = m.check_resources_health().await.unwrap_err();
    assert!(matches!(err, DeployerError::StatusDecode(_)));
    assert_eq!(m.item().phase(), Some(Phase::Failed));
}
