use crate::keys::KeyError;

#[derive(thiserror::Error, Debug)]
pub(crate) enum ControllerError {
    /// The work queue key (or the object it was derived from) is malformed.
    /// Retrying cannot fix it.
    #[error("{0}")]
    InvalidKey(#[from] KeyError),
    /// The informer caches did not sync, workers must not be started.
    #[error("failed to wait for caches to sync: {0}")]
    CacheSync(String),
    /// Kubernetes API error
    #[error("{0}")]
    KubeApi(#[from] kube::Error),
    /// Reconciliation of `key` panicked.
    #[error("reconcile of {key} panicked: {message}")]
    Panicked { key: String, message: String },
    /// Any other kind of errors
    #[error("{0}")]
    Any(#[from] anyhow::Error),
}

impl ControllerError {
    /// Whether the item that caused this error should be retried with backoff.
    pub(crate) fn is_temporary(&self) -> bool {
        match self {
            ControllerError::InvalidKey(_) => false,
            ControllerError::CacheSync(_) => false,
            _ => true,
        }
    }
}
