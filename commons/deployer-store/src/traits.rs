use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use kube::core::{DynamicObject, GroupVersionKind};
use tokio_util::sync::CancellationToken;

use crate::error::StoreError;

pub type StoreResult<T> = Result<T, StoreError>;

/// CRUD access to a remote object store addressed by
/// (group, version, kind, namespace, name).
///
/// Implementations must report a missing object as [`StoreError::NotFound`]
/// so callers can tell absence apart from failure.
#[async_trait]
pub trait ResourceStore: Send + Sync {
    async fn get(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
        name: &str,
    ) -> StoreResult<DynamicObject>;

    async fn create(&self, obj: &DynamicObject) -> StoreResult<DynamicObject>;

    /// Full replace. The object's resourceVersion, when set, must match the live one.
    async fn update(&self, obj: &DynamicObject) -> StoreResult<DynamicObject>;

    /// Apply `merge_from` onto `target` as a JSON merge patch.
    async fn patch(
        &self,
        target: &DynamicObject,
        merge_from: &DynamicObject,
    ) -> StoreResult<DynamicObject>;

    async fn delete(&self, obj: &DynamicObject) -> StoreResult<()>;

    async fn list(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
        labels: &BTreeMap<String, String>,
    ) -> StoreResult<Vec<DynamicObject>>;
}

/// Run a store call under a per-call timeout, abandoning it when `cancel` fires.
pub async fn bounded<T, F>(
    cancel: &CancellationToken,
    timeout: Duration,
    call: F,
) -> StoreResult<T>
where
    F: Future<Output = StoreResult<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(StoreError::Cancelled),
        res = tokio::time::timeout(timeout, call) => match res {
            Ok(inner) => inner,
            Err(_) => Err(StoreError::Timeout(format!(
                "store call did not complete within {:?}",
                timeout
            ))),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn bounded_times_out_slow_calls() {
        let cancel = CancellationToken::new();
        let res: StoreResult<()> =
            bounded(&cancel, Duration::from_secs(1), async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        assert!(matches!(res, Err(StoreError::Timeout(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn bounded_stops_on_cancellation() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let res: StoreResult<()> =
            bounded(&cancel, Duration::from_secs(30), async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        assert!(matches!(res, Err(StoreError::Cancelled)));
    }

    #[tokio::test]
    async fn bounded_passes_through_results() {
        let cancel = CancellationToken::new();
        let res = bounded(&cancel, Duration::from_secs(1), async {
            Err::<(), _>(StoreError::NotFound("cm/x".into()))
        })
        .await;
        assert!(res.unwrap_err().is_not_found());
    }
}
