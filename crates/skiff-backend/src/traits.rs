//! The two backend capability sets.

use bytes::Bytes;
use skiff_types::Safety;

use crate::error::BackendError;

/// Metadata returned by [`ObjectBackend::status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectStatus {
    /// Modification time, seconds since the Unix epoch.
    pub modification_time: i64,
    /// Object size in bytes.
    pub size: u64,
}

/// Byte-addressable storage of named objects, grouped into namespaces.
///
/// Implementations must be safe for concurrent use across disjoint
/// namespaces. All operations fail on a missing object except [`create`];
/// a write past the current end extends the object.
///
/// [`create`]: ObjectBackend::create
#[async_trait::async_trait]
pub trait ObjectBackend: Send + Sync {
    /// Create an object. Creating an existing object succeeds without
    /// touching its content.
    async fn create(&self, namespace: &str, name: &str) -> Result<(), BackendError>;

    /// Check that an object exists.
    async fn open(&self, namespace: &str, name: &str) -> Result<(), BackendError>;

    /// Delete an object.
    async fn delete(&self, namespace: &str, name: &str) -> Result<(), BackendError>;

    /// Report an object's modification time and size.
    async fn status(&self, namespace: &str, name: &str) -> Result<ObjectStatus, BackendError>;

    /// Flush an object's data to stable storage.
    async fn sync(&self, namespace: &str, name: &str) -> Result<(), BackendError>;

    /// Read up to `length` bytes at `offset`. A short result means the
    /// object ends inside the requested range.
    async fn read(
        &self,
        namespace: &str,
        name: &str,
        length: u64,
        offset: u64,
    ) -> Result<Bytes, BackendError>;

    /// Write `data` at `offset`, returning the number of bytes written.
    async fn write(
        &self,
        namespace: &str,
        name: &str,
        data: &[u8],
        offset: u64,
    ) -> Result<u64, BackendError>;
}

/// A pending set of kv mutations for one namespace.
///
/// Mutations are buffered by [`put`](KvWriteBatch::put) and
/// [`delete`](KvWriteBatch::delete) and applied by
/// [`commit`](KvWriteBatch::commit), atomically when the engine supports
/// it, otherwise best-effort in submission order.
#[async_trait::async_trait]
pub trait KvWriteBatch: Send {
    /// Buffer a put of `value` under `key`.
    fn put(&mut self, key: &str, value: Bytes);

    /// Buffer a deletion of `key`.
    fn delete(&mut self, key: &str);

    /// Apply the buffered mutations.
    async fn commit(self: Box<Self>) -> Result<(), BackendError>;
}

/// Snapshot iterator over `(key, value)` pairs of one namespace.
pub struct KvIterator {
    entries: std::vec::IntoIter<(String, Bytes)>,
}

impl KvIterator {
    pub(crate) fn new(entries: Vec<(String, Bytes)>) -> Self {
        Self {
            entries: entries.into_iter(),
        }
    }
}

impl Iterator for KvIterator {
    type Item = (String, Bytes);

    fn next(&mut self) -> Option<Self::Item> {
        self.entries.next()
    }
}

/// Storage of opaque binary documents under string keys, grouped into
/// namespaces.
///
/// Implementations must be safe for concurrent use across disjoint
/// namespaces. Gets are synchronous lookups; mutations go through a
/// [`KvWriteBatch`].
#[async_trait::async_trait]
pub trait KvBackend: Send + Sync {
    /// Start a mutation batch for one namespace at the given safety level.
    async fn batch(
        &self,
        namespace: &str,
        safety: Safety,
    ) -> Result<Box<dyn KvWriteBatch>, BackendError>;

    /// Look up a value. `None` means the key is absent.
    async fn get(&self, namespace: &str, key: &str) -> Result<Option<Bytes>, BackendError>;

    /// Iterate every pair in a namespace.
    async fn get_all(&self, namespace: &str) -> Result<KvIterator, BackendError>;

    /// Iterate the pairs of a namespace whose keys start with `prefix`.
    async fn get_by_prefix(
        &self,
        namespace: &str,
        prefix: &str,
    ) -> Result<KvIterator, BackendError>;
}
