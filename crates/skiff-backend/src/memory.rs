//! In-memory kv backend for tests and local scratch setups.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::{Arc, RwLock};

use bytes::Bytes;
use skiff_types::Safety;

use crate::error::BackendError;
use crate::traits::{KvBackend, KvIterator, KvWriteBatch};

type Store = Arc<RwLock<BTreeMap<(String, String), Bytes>>>;

/// Kv backend holding everything in a BTreeMap.
///
/// Batches apply under one write lock, so a committed batch is atomic with
/// respect to concurrent readers.
#[derive(Default)]
pub struct MemoryKvBackend {
    entries: Store,
}

impl MemoryKvBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl KvBackend for MemoryKvBackend {
    async fn batch(
        &self,
        namespace: &str,
        _safety: Safety,
    ) -> Result<Box<dyn KvWriteBatch>, BackendError> {
        Ok(Box::new(MemoryWriteBatch {
            entries: self.entries.clone(),
            namespace: namespace.to_string(),
            ops: Vec::new(),
        }))
    }

    async fn get(&self, namespace: &str, key: &str) -> Result<Option<Bytes>, BackendError> {
        let map = self.entries.read().expect("kv map lock poisoned");
        Ok(map.get(&(namespace.to_string(), key.to_string())).cloned())
    }

    async fn get_all(&self, namespace: &str) -> Result<KvIterator, BackendError> {
        self.get_by_prefix(namespace, "").await
    }

    async fn get_by_prefix(
        &self,
        namespace: &str,
        prefix: &str,
    ) -> Result<KvIterator, BackendError> {
        let map = self.entries.read().expect("kv map lock poisoned");
        let start = (namespace.to_string(), prefix.to_string());
        let pairs = map
            .range((Bound::Included(start), Bound::Unbounded))
            .take_while(|((ns, key), _)| ns == namespace && key.starts_with(prefix))
            .map(|((_, key), value)| (key.clone(), value.clone()))
            .collect();
        Ok(KvIterator::new(pairs))
    }
}

enum BatchOp {
    Put(String, Bytes),
    Delete(String),
}

struct MemoryWriteBatch {
    entries: Store,
    namespace: String,
    ops: Vec<BatchOp>,
}

#[async_trait::async_trait]
impl KvWriteBatch for MemoryWriteBatch {
    fn put(&mut self, key: &str, value: Bytes) {
        self.ops.push(BatchOp::Put(key.to_string(), value));
    }

    fn delete(&mut self, key: &str) {
        self.ops.push(BatchOp::Delete(key.to_string()));
    }

    async fn commit(self: Box<Self>) -> Result<(), BackendError> {
        let mut map = self.entries.write().expect("kv map lock poisoned");
        for op in self.ops {
            match op {
                BatchOp::Put(key, value) => {
                    map.insert((self.namespace.clone(), key), value);
                }
                BatchOp::Delete(key) => {
                    map.remove(&(self.namespace.clone(), key));
                }
            }
        }
        Ok(())
    }
}
