//! Backend contracts and implementations.
//!
//! A backend implements one of two capability sets: [`ObjectBackend`] for
//! byte-addressable named streams and [`KvBackend`] for opaque binary
//! documents. The same trait object serves both deployment modes: linked
//! into the client (`component = "client"`) or behind the server
//! (`component = "server"`).
//!
//! [`object_backend`] and [`kv_backend`] look implementations up by their
//! configured name, taking the place of a loadable-module entry point.

mod error;
mod fjall_kv;
mod memory;
mod posix;
mod traits;

use std::path::Path;
use std::sync::Arc;

pub use error::BackendError;
pub use fjall_kv::FjallKvBackend;
pub use memory::MemoryKvBackend;
pub use posix::PosixObjectBackend;
pub use traits::{KvBackend, KvIterator, KvWriteBatch, ObjectBackend, ObjectStatus};

/// Instantiate an object backend by its configured name.
pub fn object_backend(name: &str, path: &Path) -> Result<Arc<dyn ObjectBackend>, BackendError> {
    match name {
        "posix" => Ok(Arc::new(PosixObjectBackend::new(path)?)),
        _ => Err(BackendError::UnknownBackend(name.to_string())),
    }
}

/// Instantiate a kv backend by its configured name.
pub fn kv_backend(name: &str, path: &Path) -> Result<Arc<dyn KvBackend>, BackendError> {
    match name {
        "fjall" => Ok(Arc::new(FjallKvBackend::open(path)?)),
        "memory" => Ok(Arc::new(MemoryKvBackend::new())),
        _ => Err(BackendError::UnknownBackend(name.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_backend_names_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            object_backend("mongodb", dir.path()),
            Err(BackendError::UnknownBackend(_))
        ));
        assert!(matches!(
            kv_backend("leveldb", dir.path()),
            Err(BackendError::UnknownBackend(_))
        ));
    }

    #[test]
    fn test_known_backends_construct() {
        let dir = tempfile::tempdir().unwrap();
        assert!(object_backend("posix", &dir.path().join("objects")).is_ok());
        assert!(kv_backend("memory", dir.path()).is_ok());
        assert!(kv_backend("fjall", &dir.path().join("kv")).is_ok());
    }
}
