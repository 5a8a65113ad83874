use crate::api::ApiError;
use crate::services::ServicesError;
use crate::store::StoreError;

/// Error type for lifecycle operations.
///
/// Cloneable so one shared creation result can be handed to every waiter.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LifecycleError {
    #[error("Runtime {0} has been terminated")]
    RuntimeTerminated(String),

    #[error("Runtime {uid} has no pod name, cannot delete it")]
    MissingPodName { uid: String },

    #[error("No runtime is bound to notebook {0}")]
    NotBound(String),

    #[error("Terminating all runtimes, try again once it finishes")]
    TerminationInProgress,

    #[error("Runtime creation for notebook {0} was abandoned")]
    CreationAbandoned(String),

    #[error("Runtime API: {0}")]
    Api(#[from] ApiError),

    #[error("Session manager: {0}")]
    Services(#[from] ServicesError),

    #[error("Binding store: {0}")]
    Store(#[from] StoreError),

    #[error("Proxy: {0}")]
    Proxy(String),
}

impl From<runtime_proxy::client::ClientError> for LifecycleError {
    fn from(err: runtime_proxy::client::ClientError) -> Self {
        match err {
            runtime_proxy::client::ClientError::RuntimeTerminated(id) => {
                LifecycleError::RuntimeTerminated(id)
            }
            other => LifecycleError::Proxy(other.to_string()),
        }
    }
}
