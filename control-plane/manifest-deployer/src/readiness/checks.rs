use std::collections::HashMap;
use std::sync::Arc;

use deployer_store::object::gvk_of;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, ReplicaSet, StatefulSet};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Pod;
use kube::core::DynamicObject;
use serde::de::DeserializeOwned;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReadinessResult {
    pub ready: bool,
    pub reason: Option<String>,
    pub message: Option<String>,
}

impl ReadinessResult {
    pub fn ready() -> Self {
        ReadinessResult {
            ready: true,
            reason: None,
            message: None,
        }
    }

    pub fn not_ready(reason: &str, message: impl Into<String>) -> Self {
        ReadinessResult {
            ready: false,
            reason: Some(reason.to_string()),
            message: Some(message.into()),
        }
    }
}

pub type ReadinessCheck = Arc<dyn Fn(&DynamicObject) -> ReadinessResult + Send + Sync>;

/// Kind-specific readiness predicates keyed by (group, kind).
#[derive(Clone, Default)]
pub struct ReadinessRegistry {
    checks: HashMap<(String, String), ReadinessCheck>,
}

impl ReadinessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with predicates for the core workload kinds.
    pub fn with_builtin() -> Self {
        let mut reg = Self::new();
        reg.register("apps", "Deployment", Arc::new(deployment_ready));
        reg.register("apps", "StatefulSet", Arc::new(statefulset_ready));
        reg.register("apps", "DaemonSet", Arc::new(daemonset_ready));
        reg.register("apps", "ReplicaSet", Arc::new(replicaset_ready));
        reg.register("", "Pod", Arc::new(pod_ready));
        reg.register("batch", "Job", Arc::new(job_ready));
        reg
    }

    pub fn register(&mut self, group: &str, kind: &str, check: ReadinessCheck) {
        self.checks
            .insert((group.to_string(), kind.to_string()), check);
    }

    /// Objects of kinds without a registered predicate are ready once they exist.
    pub fn evaluate(&self, obj: &DynamicObject) -> ReadinessResult {
        let Ok(gvk) = gvk_of(obj) else {
            return ReadinessResult::ready();
        };
        match self.checks.get(&(gvk.group, gvk.kind)) {
            Some(check) => check(obj),
            None => ReadinessResult::ready(),
        }
    }
}

fn parse<K: DeserializeOwned + kube::Resource>(
    obj: &DynamicObject,
) -> Result<K, ReadinessResult> {
    obj.clone()
        .try_parse::<K>()
        .map_err(|e| ReadinessResult::not_ready("Unparseable", e.to_string()))
}

fn generation_observed(generation: Option<i64>, observed: Option<i64>) -> bool {
    match (generation, observed) {
        (Some(g), Some(o)) => o >= g,
        (Some(_), None) => false,
        (None, _) => true,
    }
}

fn deployment_ready(obj: &DynamicObject) -> ReadinessResult {
    let d: Deployment = match parse(obj) {
        Ok(d) => d,
        Err(r) => return r,
    };
    let desired = d.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
    let Some(status) = d.status.as_ref() else {
        return ReadinessResult::not_ready("NoStatus", "deployment has no status yet");
    };
    if !generation_observed(d.metadata.generation, status.observed_generation) {
        return ReadinessResult::not_ready(
            "GenerationNotObserved",
            "deployment spec update not yet observed",
        );
    }
    let updated = status.updated_replicas.unwrap_or(0);
    let ready = status.ready_replicas.unwrap_or(0);
    let available = status.available_replicas.unwrap_or(0);
    if updated != desired || ready != desired || available != desired {
        return ReadinessResult::not_ready(
            "ReplicasNotReady",
            format!(
                "{} desired, {} updated, {} ready, {} available",
                desired, updated, ready, available
            ),
        );
    }
    ReadinessResult::ready()
}

fn statefulset_ready(obj: &DynamicObject) -> ReadinessResult {
    let s: StatefulSet = match parse(obj) {
        Ok(s) => s,
        Err(r) => return r,
    };
    let desired = s.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
    let Some(status) = s.status.as_ref() else {
        return ReadinessResult::not_ready("NoStatus", "statefulset has no status yet");
    };
    if !generation_observed(s.metadata.generation, status.observed_generation) {
        return ReadinessResult::not_ready(
            "GenerationNotObserved",
            "statefulset spec update not yet observed",
        );
    }
    let ready = status.ready_replicas.unwrap_or(0);
    if ready != desired {
        return ReadinessResult::not_ready(
            "ReplicasNotReady",
            format!("{} of {} replicas ready", ready, desired),
        );
    }
    ReadinessResult::ready()
}

fn daemonset_ready(obj: &DynamicObject) -> ReadinessResult {
    let ds: DaemonSet = match parse(obj) {
        Ok(ds) => ds,
        Err(r) => return r,
    };
    let Some(status) = ds.status.as_ref() else {
        return ReadinessResult::not_ready("NoStatus", "daemonset has no status yet");
    };
    if !generation_observed(ds.metadata.generation, status.observed_generation) {
        return ReadinessResult::not_ready(
            "GenerationNotObserved",
            "daemonset spec update not yet observed",
        );
    }
    if status.number_ready != status.desired_number_scheduled {
        return ReadinessResult::not_ready(
            "PodsNotReady",
            format!(
                "{} of {} scheduled pods ready",
                status.number_ready, status.desired_number_scheduled
            ),
        );
    }
    ReadinessResult::ready()
}

fn replicaset_ready(obj: &DynamicObject) -> ReadinessResult {
    let rs: ReplicaSet = match parse(obj) {
        Ok(rs) => rs,
        Err(r) => return r,
    };
    let desired = rs.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
    let ready = rs
        .status
        .as_ref()
        .and_then(|s| s.ready_replicas)
        .unwrap_or(0);
    if ready != desired {
        return ReadinessResult::not_ready(
            "ReplicasNotReady",
            format!("{} of {} replicas ready", ready, desired),
        );
    }
    ReadinessResult::ready()
}

fn pod_ready(obj: &DynamicObject) -> ReadinessResult {
    let pod: Pod = match parse(obj) {
        Ok(p) => p,
        Err(r) => return r,
    };
    let status = pod.status.unwrap_or_default();
    let phase = status.phase.unwrap_or_default();
    match phase.as_str() {
        "Succeeded" => ReadinessResult::ready(),
        "Running" => {
            let ready = status
                .conditions
                .unwrap_or_default()
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True");
            if ready {
                ReadinessResult::ready()
            } else {
                ReadinessResult::not_ready("ContainersNotReady", "pod is running but not ready")
            }
        }
        other => ReadinessResult::not_ready("PodNotRunning", format!("pod phase is {:?}", other)),
    }
}

fn job_ready(obj: &DynamicObject) -> ReadinessResult {
    let job: Job = match parse(obj) {
        Ok(j) => j,
        Err(r) => return r,
    };
    let completions = job.spec.as_ref().and_then(|s| s.completions).unwrap_or(1);
    let status = job.status.unwrap_or_default();
    let conditions = status.conditions.unwrap_or_default();
    let has = |kind: &str| {
        conditions
            .iter()
            .any(|c| c.type_ == kind && c.status == "True")
    };
    if has("Failed") {
        return ReadinessResult::not_ready("JobFailed", "job has failed");
    }
    let succeeded = status.succeeded.unwrap_or(0);
    if has("Complete") || succeeded >= completions {
        return ReadinessResult::ready();
    }
    ReadinessResult::not_ready(
        "JobNotComplete",
        format!("{} of {} completions succeeded", succeeded, completions),
    )
}
