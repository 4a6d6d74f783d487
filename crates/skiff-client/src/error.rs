//! Error types for the client library.

use skiff_backend::BackendError;
use skiff_proto::ProtoError;

/// Errors surfaced by the client API.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The configuration is missing, unreadable, or invalid.
    #[error("configuration error: {0}")]
    Config(String),

    /// A public call was made with an argument it cannot act on; nothing
    /// was scheduled.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// An explicit server index is out of range for the configured servers.
    #[error("server index {index} out of range (have {count} servers)")]
    ServerIndex { index: u32, count: u32 },

    /// A wire protocol or connection error; the connection is discarded.
    #[error(transparent)]
    Proto(#[from] ProtoError),

    /// A local backend operation failed.
    #[error(transparent)]
    Backend(#[from] BackendError),

    /// A kv get found no value under the key.
    #[error("key not found: {namespace}/{key}")]
    KeyNotFound { namespace: String, key: String },

    /// The server reported failure for an operation in this run.
    #[error("{0} rejected by server")]
    Remote(&'static str),

    /// At least one run of an asynchronously executed batch failed.
    #[error("batch failed")]
    BatchFailed,

    /// A background task was dropped before completing.
    #[error("background task dropped")]
    TaskDropped,
}
