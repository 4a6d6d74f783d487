//! Error types for the server.

use skiff_proto::ProtoError;

/// Errors that end a connection worker or prevent the server from starting.
///
/// Backend failures are not represented here: they are per-operation
/// results reported back to the client inside reply frames.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// An I/O error on the listener.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A framing or connection error on a worker.
    #[error(transparent)]
    Proto(#[from] ProtoError),

    /// The peer declared a bulk payload the server refuses to buffer.
    #[error("bulk payload too large: {len} bytes")]
    BulkTooLarge { len: u64 },
}
