//! Error types for backend operations.

/// Errors that can occur during backend operations.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// The named object or key does not exist.
    #[error("not found: {namespace}/{name}")]
    NotFound { namespace: String, name: String },

    /// A namespace or name contains characters the backend cannot store.
    #[error("invalid name: {0:?}")]
    InvalidName(String),

    /// No backend is registered under the configured name.
    #[error("unknown backend: {0:?}")]
    UnknownBackend(String),

    /// An I/O error from the underlying storage.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// An error from the kv storage engine.
    #[error("kv engine error: {0}")]
    Engine(#[from] fjall::Error),
}

impl BackendError {
    pub(crate) fn not_found(namespace: &str, name: &str) -> Self {
        Self::NotFound {
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    /// Whether this error means the target simply does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, BackendError::NotFound { .. })
    }
}
