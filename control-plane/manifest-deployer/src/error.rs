use deployer_store::StoreError;

#[derive(thiserror::Error, Debug)]
pub enum DeployerError {
    #[error("error while decoding manifest at index {index}: {message}")]
    Decode { index: usize, message: String },

    #[error("invalid provider configuration: {0}")]
    InvalidConfiguration(String),

    #[error("unable to decode provider status: {0}")]
    StatusDecode(String),

    #[error("unable to encode provider status: {0}")]
    StatusEncode(#[source] serde_json::Error),

    /// A store call failed. `operation` names the failing step (GetObject, CreateObject, ...).
    #[error("{context}: {source}")]
    Client {
        operation: &'static str,
        context: String,
        #[source]
        source: StoreError,
    },

    #[error("timed out waiting for {resource} to be deleted")]
    DeletionTimeout { resource: String },

    #[error("not all items are deleted ({} pending)", .pending.len())]
    IncompleteDeletion { pending: Vec<String> },

    #[error("resources are not ready: {}", .unready.join(", "))]
    ReadinessTimeout { unready: Vec<String> },

    #[error("{}", format_aggregate(.0))]
    Aggregate(Vec<DeployerError>),

    #[error("cleanup task failed: {0}")]
    Task(String),

    #[error("operation cancelled")]
    Cancelled,
}

fn format_aggregate(errs: &[DeployerError]) -> String {
    match errs {
        [single] => single.to_string(),
        many => format!(
            "[{}]",
            many.iter()
                .map(|e| e.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ),
    }
}

impl DeployerError {
    pub fn client(
        operation: &'static str,
        context: impl Into<String>,
        source: StoreError,
    ) -> Self {
        match source {
            StoreError::Cancelled => DeployerError::Cancelled,
            source => DeployerError::Client {
                operation,
                context: context.into(),
                source,
            },
        }
    }

    /// Whether re-invoking the same entry point later may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            DeployerError::Decode { .. }
            | DeployerError::InvalidConfiguration(_)
            | DeployerError::StatusDecode(_)
            | DeployerError::StatusEncode(_) => false,
            DeployerError::Client { source, .. } => source.is_retryable(),
            DeployerError::Aggregate(errs) => errs.iter().any(|e| e.is_retryable()),
            DeployerError::DeletionTimeout { .. }
            | DeployerError::IncompleteDeletion { .. }
            | DeployerError::ReadinessTimeout { .. }
            | DeployerError::Task(_)
            | DeployerError::Cancelled => true,
        }
    }

    /// Short machine-readable reason recorded in `LastError.reason`.
    pub fn reason(&self) -> &'static str {
        match self {
            DeployerError::Decode { .. } => "DecodeManifest",
            DeployerError::InvalidConfiguration(_) => "ProviderConfiguration",
            DeployerError::StatusDecode(_) | DeployerError::StatusEncode(_) => {
                "ProviderStatus"
            }
            DeployerError::Client { operation, .. } => operation,
            DeployerError::DeletionTimeout { .. } => "WaitForDeletion",
            DeployerError::IncompleteDeletion { .. } => "WaitingForDeletion",
            DeployerError::ReadinessTimeout { .. } => "CheckResourcesReadiness",
            DeployerError::Aggregate(_) | DeployerError::Task(_) => {
                "CleanupOrphanedResources"
            }
            DeployerError::Cancelled => "Cancelled",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_errors_map_cancellation() {
        let err = DeployerError::client("GetObject", "get x", StoreError::Cancelled);
        assert!(matches!(err, DeployerError::Cancelled));
    }

    #[test]
    fn permanent_rejections_are_not_retryable() {
        let err = DeployerError::client(
            "CreateObject",
            "unable to create resource default/x",
            StoreError::Rejected {
                code: 422,
                message: "invalid".into(),
            },
        );
        assert!(!err.is_retryable());
        assert_eq!(err.reason(), "CreateObject");

        let race = DeployerError::client(
            "CreateObject",
            "unable to create resource default/x",
            StoreError::AlreadyExists("x".into()),
        );
        assert!(race.is_retryable());
    }

    #[test]
    fn aggregate_formats_like_a_list() {
        let one = DeployerError::Aggregate(vec![DeployerError::DeletionTimeout {
            resource: "ConfigMap default/a".into(),
        }]);
        assert_eq!(
            one.to_string(),
            "timed out waiting for ConfigMap default/a to be deleted"
        );
        let two = DeployerError::Aggregate(vec![
            DeployerError::Task("panicked".into()),
            DeployerError::Cancelled,
        ]);
        assert_eq!(
            two.to_string(),
            "[cleanup task failed: panicked, operation cancelled]"
        );
    }
}
