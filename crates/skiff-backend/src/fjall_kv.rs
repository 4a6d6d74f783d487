//! Persistent kv backend on fjall.
//!
//! All namespaces share one keyspace; entries are keyed `namespace ++ 0x00
//! ++ key`. Namespaces and keys travel as null-terminated strings on the
//! wire, so the separator cannot collide.

use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use fjall::{Database, Keyspace, KeyspaceCreateOptions};
use skiff_types::Safety;
use tracing::debug;

use crate::error::BackendError;
use crate::traits::{KvBackend, KvIterator, KvWriteBatch};

/// Kv backend backed by a fjall database.
pub struct FjallKvBackend {
    #[allow(dead_code)]
    db: Database,
    entries: Arc<Keyspace>,
}

impl FjallKvBackend {
    /// Open (or create) a database at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, BackendError> {
        let db = Database::builder(path).open()?;
        let entries = Arc::new(db.keyspace("entries", KeyspaceCreateOptions::default)?);
        Ok(Self { db, entries })
    }
}

fn storage_key(namespace: &str, key: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(namespace.len() + 1 + key.len());
    out.extend_from_slice(namespace.as_bytes());
    out.push(0);
    out.extend_from_slice(key.as_bytes());
    out
}

fn scan(
    entries: &Keyspace,
    namespace: &str,
    prefix: &str,
) -> Result<Vec<(String, Bytes)>, BackendError> {
    let scan_prefix = storage_key(namespace, prefix);
    let strip = namespace.len() + 1;

    let mut pairs = Vec::new();
    for guard in entries.prefix(&scan_prefix) {
        let (k, v) = guard.into_inner()?;
        // Entries written through this backend always have UTF-8 keys;
        // skip anything else rather than failing the whole scan.
        let Ok(full_key) = std::str::from_utf8(&k[strip..]) else {
            continue;
        };
        pairs.push((full_key.to_string(), Bytes::copy_from_slice(&v)));
    }
    Ok(pairs)
}

#[async_trait::async_trait]
impl KvBackend for FjallKvBackend {
    async fn batch(
        &self,
        namespace: &str,
        safety: Safety,
    ) -> Result<Box<dyn KvWriteBatch>, BackendError> {
        Ok(Box::new(FjallWriteBatch {
            entries: self.entries.clone(),
            namespace: namespace.to_string(),
            safety,
            ops: Vec::new(),
        }))
    }

    async fn get(&self, namespace: &str, key: &str) -> Result<Option<Bytes>, BackendError> {
        match self.entries.get(storage_key(namespace, key))? {
            Some(value) => Ok(Some(Bytes::copy_from_slice(&value))),
            None => Ok(None),
        }
    }

    async fn get_all(&self, namespace: &str) -> Result<KvIterator, BackendError> {
        Ok(KvIterator::new(scan(&self.entries, namespace, "")?))
    }

    async fn get_by_prefix(
        &self,
        namespace: &str,
        prefix: &str,
    ) -> Result<KvIterator, BackendError> {
        Ok(KvIterator::new(scan(&self.entries, namespace, prefix)?))
    }
}

enum BatchOp {
    Put(String, Bytes),
    Delete(String),
}

struct FjallWriteBatch {
    entries: Arc<Keyspace>,
    namespace: String,
    safety: Safety,
    ops: Vec<BatchOp>,
}

#[async_trait::async_trait]
impl KvWriteBatch for FjallWriteBatch {
    fn put(&mut self, key: &str, value: Bytes) {
        self.ops.push(BatchOp::Put(key.to_string(), value));
    }

    fn delete(&mut self, key: &str) {
        self.ops.push(BatchOp::Delete(key.to_string()));
    }

    async fn commit(self: Box<Self>) -> Result<(), BackendError> {
        // Applied in submission order. Fjall journals every write, which is
        // what storage safety asks of this engine.
        let count = self.ops.len();
        for op in self.ops {
            match op {
                BatchOp::Put(key, value) => {
                    self.entries
                        .insert(storage_key(&self.namespace, &key), value.as_ref())?;
                }
                BatchOp::Delete(key) => {
                    self.entries.remove(storage_key(&self.namespace, &key))?;
                }
            }
        }
        debug!(
            namespace = %self.namespace,
            count,
            safety = ?self.safety,
            "committed kv batch"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn make_backend() -> (FjallKvBackend, TempDir) {
        let dir = TempDir::new().unwrap();
        let backend = FjallKvBackend::open(dir.path().join("kv")).unwrap();
        (backend, dir)
    }

    #[tokio::test]
    async fn test_put_get_round_trip() {
        let (backend, _dir) = make_backend();
        let mut batch = backend.batch("ns", Safety::Network).await.unwrap();
        batch.put("k", Bytes::from_static(&[1, 2, 3]));
        batch.commit().await.unwrap();

        let value = backend.get("ns", "k").await.unwrap();
        assert_eq!(value, Some(Bytes::from_static(&[1, 2, 3])));
    }

    #[tokio::test]
    async fn test_get_absent_returns_none() {
        let (backend, _dir) = make_backend();
        assert_eq!(backend.get("ns", "missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_delete_removes_key() {
        let (backend, _dir) = make_backend();
        let mut batch = backend.batch("ns", Safety::Network).await.unwrap();
        batch.put("k", Bytes::from_static(b"v"));
        batch.commit().await.unwrap();

        let mut batch = backend.batch("ns", Safety::Network).await.unwrap();
        batch.delete("k");
        batch.commit().await.unwrap();

        assert_eq!(backend.get("ns", "k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_batch_applies_in_order() {
        let (backend, _dir) = make_backend();
        let mut batch = backend.batch("ns", Safety::Network).await.unwrap();
        batch.put("k", Bytes::from_static(b"first"));
        batch.delete("k");
        batch.put("k", Bytes::from_static(b"second"));
        batch.commit().await.unwrap();

        assert_eq!(
            backend.get("ns", "k").await.unwrap(),
            Some(Bytes::from_static(b"second"))
        );
    }

    #[tokio::test]
    async fn test_namespaces_are_disjoint() {
        let (backend, _dir) = make_backend();
        let mut batch = backend.batch("a", Safety::Network).await.unwrap();
        batch.put("k", Bytes::from_static(b"in-a"));
        batch.commit().await.unwrap();

        assert_eq!(backend.get("b", "k").await.unwrap(), None);

        // A namespace sharing a prefix with another must not leak into its
        // scans ("ab" vs "a").
        let mut batch = backend.batch("ab", Safety::Network).await.unwrap();
        batch.put("x", Bytes::from_static(b"in-ab"));
        batch.commit().await.unwrap();

        let pairs: Vec<_> = backend.get_all("a").await.unwrap().collect();
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].0, "k");
    }

    #[tokio::test]
    async fn test_prefix_iteration() {
        let (backend, _dir) = make_backend();
        let mut batch = backend.batch("ns", Safety::Network).await.unwrap();
        batch.put("user:1", Bytes::from_static(b"a"));
        batch.put("user:2", Bytes::from_static(b"b"));
        batch.put("group:1", Bytes::from_static(b"c"));
        batch.commit().await.unwrap();

        let mut keys: Vec<String> = backend
            .get_by_prefix("ns", "user:")
            .await
            .unwrap()
            .map(|(k, _)| k)
            .collect();
        keys.sort();
        assert_eq!(keys, vec!["user:1", "user:2"]);
    }

    #[tokio::test]
    async fn test_persistence_across_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("kv");

        {
            let backend = FjallKvBackend::open(&path).unwrap();
            let mut batch = backend.batch("ns", Safety::Storage).await.unwrap();
            batch.put("k", Bytes::from_static(b"durable"));
            batch.commit().await.unwrap();
        }

        let backend = FjallKvBackend::open(&path).unwrap();
        assert_eq!(
            backend.get("ns", "k").await.unwrap(),
            Some(Bytes::from_static(b"durable"))
        );
    }
}
