#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("object already exists: {0}")]
    AlreadyExists(String),

    /// Optimistic-concurrency rejection (stale resourceVersion).
    #[error("conflict: {0}")]
    Conflict(String),

    /// The store refused the request and retrying the same request will not help.
    #[error("request rejected ({code}): {message}")]
    Rejected { code: u16, message: String },

    #[error("timeout error: {0}")]
    Timeout(String),

    #[error("request cancelled")]
    Cancelled,

    #[error("unknown resource kind: {0}")]
    UnknownKind(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }

    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            StoreError::Rejected { .. }
                | StoreError::UnknownKind(_)
                | StoreError::Serialization(_)
        )
    }
}

impl From<kube::Error> for StoreError {
    fn from(err: kube::Error) -> Self {
        match err {
            kube::Error::Api(resp) => match resp.code {
                404 => StoreError::NotFound(resp.message),
                409 if resp.reason == "AlreadyExists" => {
                    StoreError::AlreadyExists(resp.message)
                }
                409 => StoreError::Conflict(resp.message),
                400 | 403 | 405 | 415 | 422 => StoreError::Rejected {
                    code: resp.code,
                    message: resp.message,
                },
                _ => StoreError::Backend(format!(
                    "{} ({}): {}",
                    resp.reason, resp.code, resp.message
                )),
            },
            kube::Error::SerdeError(e) => StoreError::Serialization(e),
            other => StoreError::Backend(other.to_string()),
        }
    }
}
