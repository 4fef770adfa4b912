pub mod checks;

use std::sync::Arc;
use std::time::Duration;

use deployer_store::{ResourceStore, StoreError, bounded};
use futures_util::future::join_all;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

pub use checks::{ReadinessCheck, ReadinessRegistry, ReadinessResult};

use crate::crd::{ManagedResourceStatus, ManifestPolicy, TypedReference};
use crate::error::DeployerError;

/// Retry schedule for readiness polling. `steps` is the number of attempts;
/// a `factor` of zero keeps the delay constant.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Backoff {
    pub initial_delay: Duration,
    pub factor: f64,
    pub steps: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff {
            initial_delay: Duration::from_secs(5),
            factor: 0.0,
            steps: 3,
        }
    }
}

impl Backoff {
    /// Sleeps taken between consecutive attempts, produced lazily. Growth
    /// saturates at `Duration::MAX` instead of overflowing.
    pub fn delays(&self) -> impl Iterator<Item = Duration> {
        let factor = self.factor;
        let sleeps = self.steps.max(1) - 1;
        std::iter::successors(Some(self.initial_delay), move |current| {
            Some(scale(*current, factor))
        })
        .take(sleeps as usize)
    }
}

fn scale(delay: Duration, factor: f64) -> Duration {
    if factor.is_nan() || factor <= 0.0 {
        return delay;
    }
    Duration::try_from_secs_f64(delay.as_secs_f64() * factor).unwrap_or(Duration::MAX)
}

pub struct ReadinessProber {
    pub store: Arc<dyn ResourceStore>,
    pub registry: Arc<ReadinessRegistry>,
    pub cancel: CancellationToken,
    pub request_timeout: Duration,
    /// Upper bound on the whole probe, sleeps included.
    pub timeout: Duration,
}

impl ReadinessProber {
    /// Wait until every tracked resource is ready. Ignored resources are not
    /// tracked.
    #[instrument(skip_all, fields(resources = resources.len(), steps = backoff.steps))]
    pub async fn probe(
        &self,
        resources: &[ManagedResourceStatus],
        backoff: Backoff,
    ) -> Result<(), DeployerError> {
        let tracked: Vec<&TypedReference> = resources
            .iter()
            .filter(|r| r.policy != ManifestPolicy::Ignore)
            .map(|r| &r.resource)
            .collect();
        if tracked.is_empty() {
            return Ok(());
        }

        let deadline = Instant::now() + self.timeout;
        let mut delays = backoff.delays();
        loop {
            let unready = self.check_once(&tracked).await?;
            if unready.is_empty() {
                return Ok(());
            }
            debug!(pending = unready.len(), "resources not ready yet");

            let Some(delay) = delays.next() else {
                return Err(DeployerError::ReadinessTimeout { unready });
            };
            if delay > deadline.saturating_duration_since(Instant::now()) {
                return Err(DeployerError::ReadinessTimeout { unready });
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(DeployerError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// One pass over all tracked resources; returns a description of each
    /// one that is not ready.
    async fn check_once(
        &self,
        tracked: &[&TypedReference],
    ) -> Result<Vec<String>, DeployerError> {
        let fetches = tracked.iter().map(|reference| async move {
            let res = bounded(
                &self.cancel,
                self.request_timeout,
                self.store
                    .get(&reference.gvk(), reference.namespace(), &reference.name),
            )
            .await;
            (*reference, res)
        });

        let mut unready = Vec::new();
        for (reference, res) in join_all(fetches).await {
            match res {
                Ok(obj) => {
                    let result = self.registry.evaluate(&obj);
                    if !result.ready {
                        unready.push(format!(
                            "{}: {}",
                            reference,
                            result
                                .message
                                .or(result.reason)
                                .unwrap_or_else(|| "not ready".to_string())
                        ));
                    }
                }
                Err(StoreError::Cancelled) => return Err(DeployerError::Cancelled),
                Err(e) if e.is_not_found() => {
                    unready.push(format!("{}: not found", reference));
                }
                Err(e) => unready.push(format!("{}: {}", reference, e)),
            }
        }
        Ok(unready)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use deployer_store::memory::MemoryResourceStore;
    use kube::core::DynamicObject;
    use serde_json::{Value, json};

    fn deployment(ready_replicas: i32) -> DynamicObject {
        serde_json::from_value(json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {"name": "web", "namespace": "default", "generation": 1},
            "spec": {"replicas": 2, "selector": {}, "template": {}},
            "status": {
                "observedGeneration": 1,
                "updatedReplicas": 2,
                "readyReplicas": ready_replicas,
                "availableReplicas": ready_replicas
            },
        }))
        .unwrap()
    }

    fn tracked(policy: ManifestPolicy, obj: &Value) -> ManagedResourceStatus {
        let obj: DynamicObject = serde_json::from_value(obj.clone()).unwrap();
        ManagedResourceStatus {
            policy,
            resource: TypedReference::from_object(&obj),
        }
    }

    fn web() -> ManagedResourceStatus {
        ManagedResourceStatus {
            policy: ManifestPolicy::Manage,
            resource: TypedReference::from_object(&deployment(0)),
        }
    }

    fn prober(store: &MemoryResourceStore) -> ReadinessProber {
        ReadinessProber {
            store: Arc::new(store.clone()),
            registry: Arc::new(ReadinessRegistry::with_builtin()),
            cancel: CancellationToken::new(),
            request_timeout: Duration::from_secs(30),
            timeout: Duration::from_secs(60),
        }
    }

    #[test]
    fn backoff_schedule() {
        assert_eq!(
            Backoff::default().delays().collect::<Vec<_>>(),
            vec![Duration::from_secs(5), Duration::from_secs(5)]
        );
        let growing = Backoff {
            initial_delay: Duration::from_secs(1),
            factor: 2.0,
            steps: 4,
        };
        assert_eq!(
            growing.delays().collect::<Vec<_>>(),
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4)
            ]
        );
        let single = Backoff {
            steps: 0,
            ..Backoff::default()
        };
        assert_eq!(single.delays().count(), 0);
    }

    #[test]
    fn steep_growth_saturates() {
        let steep = Backoff {
            initial_delay: Duration::from_secs(5),
            factor: 10.0,
            steps: 30,
        };
        let delays: Vec<_> = steep.delays().collect();
        assert_eq!(delays.len(), 29);
        assert_eq!(delays[1], Duration::from_secs(50));
        assert_eq!(delays[28], Duration::MAX);

        let long = Backoff {
            steps: u32::MAX,
            ..Backoff::default()
        };
        assert_eq!(long.delays().nth(1_000_000), Some(Duration::from_secs(5)));
    }

    #[tokio::test(start_paused = true)]
    async fn steep_schedules_stop_at_the_deadline() {
        let store = MemoryResourceStore::new();
        store.insert(deployment(0)).await.unwrap();
        let backoff = Backoff {
            initial_delay: Duration::from_secs(5),
            factor: 10.0,
            steps: 30,
        };
        let started = Instant::now();
        let err = prober(&store).probe(&[web()], backoff).await.unwrap_err();
        assert!(matches!(err, DeployerError::ReadinessTimeout { .. }));
        // 5s then 50s fit in the 60s budget, 500s does not
        assert_eq!(started.elapsed(), Duration::from_secs(55));

        store.insert(deployment(2)).await.unwrap();
        prober(&store).probe(&[web()], backoff).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn ready_resources_pass_on_first_attempt() {
        let store = MemoryResourceStore::new();
        store.insert(deployment(2)).await.unwrap();
        prober(&store)
            .probe(&[web()], Backoff::default())
            .await
            .unwrap();
        assert_eq!(store.op_counts().await.get, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_budget_names_unready_resources() {
        let store = MemoryResourceStore::new();
        store.insert(deployment(1)).await.unwrap();
        let started = Instant::now();
        let err = prober(&store)
            .probe(&[web()], Backoff::default())
            .await
            .unwrap_err();
        assert_eq!(started.elapsed(), Duration::from_secs(10));
        assert_eq!(store.op_counts().await.get, 3);
        match err {
            DeployerError::ReadinessTimeout { unready } => {
                assert_eq!(unready.len(), 1);
                assert!(unready[0].starts_with("Deployment default/web"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn resources_becoming_ready_between_attempts() {
        let store = MemoryResourceStore::new();
        store.insert(deployment(0)).await.unwrap();
        let background = store.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(7)).await;
            background.insert(deployment(2)).await.unwrap();
        });
        prober(&store)
            .probe(&[web()], Backoff::default())
            .await
            .unwrap();
        assert_eq!(store.op_counts().await.get, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_resources_are_unready_and_ignored_ones_skipped() {
        let store = MemoryResourceStore::new();
        let cm = json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": "cfg", "namespace": "default"}
        });
        prober(&store)
            .probe(&[tracked(ManifestPolicy::Ignore, &cm)], Backoff::default())
            .await
            .unwrap();
        assert_eq!(store.op_counts().await.get, 0);

        let err = prober(&store)
            .probe(&[tracked(ManifestPolicy::Keep, &cm)], Backoff::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("ConfigMap default/cfg: not found"));
    }

    #[tokio::test(start_paused = true)]
    async fn overall_timeout_cuts_the_schedule_short() {
        let store = MemoryResourceStore::new();
        store.insert(deployment(0)).await.unwrap();
        let mut p = prober(&store);
        p.timeout = Duration::from_secs(12);
        let started = Instant::now();
        let backoff = Backoff {
            initial_delay: Duration::from_secs(5),
            factor: 0.0,
            steps: 10,
        };
        let err = p.probe(&[web()], backoff).await.unwrap_err();
        assert!(matches!(err, DeployerError::ReadinessTimeout { .. }));
        assert_eq!(started.elapsed(), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_the_wait() {
        let store = MemoryResourceStore::new();
        store.insert(deployment(0)).await.unwrap();
        let p = prober(&store);
        let cancel = p.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            cancel.cancel();
        });
        let err = p.probe(&[web()], Backoff::default()).await.unwrap_err();
        assert!(matches!(err, DeployerError::Cancelled));
    }
}
