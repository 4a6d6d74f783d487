//! Batches and the operation pipeline.
//!
//! A [`Batch`] collects operation descriptors in append order. Executing it
//! partitions the list into maximal *runs* of consecutive operations that
//! share a kind and a target merge key; each run becomes a single backend
//! call or a single wire message. Runs execute in formation order, every
//! run executes even after an earlier one failed, and the aggregate result
//! reports the first failure.

use std::mem;
use std::sync::Arc;

use bytes::Bytes;
use skiff_types::{Safety, Semantics};
use tracing::warn;

use crate::background::TaskHandle;
use crate::error::ClientError;
use crate::kv::{self, GetSink, KvHandle};
use crate::object::{self, ObjectHandle, ReadResult, StatusResult, WriteResult};
use crate::ClientInner;

/// Completion callback invoked with the aggregate success of a batch.
pub type CompletionCallback = Arc<dyn Fn(bool) + Send + Sync>;

/// One scheduled operation.
pub(crate) enum Operation {
    ObjectCreate {
        object: ObjectHandle,
    },
    ObjectDelete {
        object: ObjectHandle,
    },
    ObjectRead {
        object: ObjectHandle,
        length: u64,
        offset: u64,
        result: ReadResult,
    },
    ObjectWrite {
        object: ObjectHandle,
        data: Bytes,
        offset: u64,
        result: WriteResult,
    },
    ObjectStatus {
        object: ObjectHandle,
        result: StatusResult,
    },
    KvPut {
        kv: KvHandle,
        value: Bytes,
    },
    KvDelete {
        kv: KvHandle,
    },
    KvGet {
        kv: KvHandle,
        sink: GetSink,
    },
}

/// Kind tag used for run formation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OpKind {
    ObjectCreate,
    ObjectDelete,
    ObjectRead,
    ObjectWrite,
    ObjectStatus,
    KvPut,
    KvDelete,
    KvGet,
}

impl Operation {
    pub(crate) fn kind(&self) -> OpKind {
        match self {
            Operation::ObjectCreate { .. } => OpKind::ObjectCreate,
            Operation::ObjectDelete { .. } => OpKind::ObjectDelete,
            Operation::ObjectRead { .. } => OpKind::ObjectRead,
            Operation::ObjectWrite { .. } => OpKind::ObjectWrite,
            Operation::ObjectStatus { .. } => OpKind::ObjectStatus,
            Operation::KvPut { .. } => OpKind::KvPut,
            Operation::KvDelete { .. } => OpKind::KvDelete,
            Operation::KvGet { .. } => OpKind::KvGet,
        }
    }

    /// The target merge key: `(server index, namespace)`, plus the object
    /// name for reads and writes, whose frames carry the name once for the
    /// whole run.
    fn merge_key(&self) -> (u32, &str, Option<&str>) {
        match self {
            Operation::ObjectCreate { object }
            | Operation::ObjectDelete { object }
            | Operation::ObjectStatus { object, .. } => {
                (object.index(), object.namespace(), None)
            }
            Operation::ObjectRead { object, .. } | Operation::ObjectWrite { object, .. } => {
                (object.index(), object.namespace(), Some(object.name()))
            }
            Operation::KvPut { kv, .. }
            | Operation::KvDelete { kv }
            | Operation::KvGet { kv, .. } => (kv.index(), kv.namespace(), None),
        }
    }

    fn same_run(&self, other: &Operation) -> bool {
        self.kind() == other.kind() && self.merge_key() == other.merge_key()
    }
}

/// Partition operations into maximal runs, preserving append order.
pub(crate) fn split_runs(operations: Vec<Operation>) -> Vec<Vec<Operation>> {
    let mut runs = Vec::new();
    let mut current: Vec<Operation> = Vec::new();

    for operation in operations {
        if let Some(last) = current.last()
            && !last.same_run(&operation)
        {
            runs.push(mem::take(&mut current));
        }
        current.push(operation);
    }
    if !current.is_empty() {
        runs.push(current);
    }
    runs
}

/// Execute runs in formation order; every run executes and the first error
/// becomes the aggregate result.
pub(crate) async fn execute_operations(
    client: &Arc<ClientInner>,
    operations: Vec<Operation>,
    semantics: &Semantics,
) -> Result<(), ClientError> {
    let mut first_error = None;

    for run in split_runs(operations) {
        let kind = run[0].kind();
        let result = match kind {
            OpKind::ObjectCreate => object::execute_create(client, &run, semantics).await,
            OpKind::ObjectDelete => object::execute_delete(client, &run, semantics).await,
            OpKind::ObjectRead => object::execute_read(client, &run, semantics).await,
            OpKind::ObjectWrite => object::execute_write(client, &run, semantics).await,
            OpKind::ObjectStatus => object::execute_status(client, &run, semantics).await,
            OpKind::KvPut => kv::execute_put(client, &run, semantics).await,
            OpKind::KvDelete => kv::execute_delete(client, &run, semantics).await,
            OpKind::KvGet => kv::execute_get(client, &run, semantics).await,
        };

        if let Err(e) = result {
            warn!(?kind, error = %e, "run failed");
            first_error.get_or_insert(e);
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Entry point shared by synchronous and asynchronous execution: defer
/// safety-none batches into the operation cache, flush the cache ahead of
/// anything stronger.
pub(crate) async fn execute_or_defer(
    client: &Arc<ClientInner>,
    operations: Vec<Operation>,
    semantics: Semantics,
) -> Result<(), ClientError> {
    if operations.is_empty() {
        return Ok(());
    }

    if semantics.safety() == Safety::None && client.cache.is_enabled() {
        return client.cache.defer(client, operations, semantics).await;
    }

    // Deferred batches must reach the servers before this one.
    let flushed = client.cache.flush(client).await;
    let executed = execute_operations(client, operations, &semantics).await;
    flushed.and(executed)
}

/// An ordered list of operations executed together under one semantics
/// bundle.
///
/// A batch is a single-owner value; concurrent threads use separate
/// batches. Executing takes ownership of the current operation list, so
/// adding afterwards starts a fresh list on the same batch.
pub struct Batch {
    client: Arc<ClientInner>,
    semantics: Semantics,
    operations: Vec<Operation>,
    pending: Vec<TaskHandle<bool>>,
    completion: Option<CompletionCallback>,
}

impl Batch {
    pub(crate) fn new(client: Arc<ClientInner>, semantics: Semantics) -> Self {
        Self {
            client,
            semantics,
            operations: Vec::new(),
            pending: Vec::new(),
            completion: None,
        }
    }

    pub fn semantics(&self) -> &Semantics {
        &self.semantics
    }

    /// Number of operations scheduled since the last execute.
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Install a callback invoked with the aggregate success flag after
    /// each execute.
    pub fn on_completion(&mut self, callback: impl Fn(bool) + Send + Sync + 'static) {
        self.completion = Some(Arc::new(callback));
    }

    pub(crate) fn add(&mut self, operation: Operation) {
        self.operations.push(operation);
    }

    /// Execute the scheduled operations and report the aggregate result.
    pub async fn execute(&mut self) -> Result<(), ClientError> {
        let operations = mem::take(&mut self.operations);
        let result = execute_or_defer(&self.client, operations, self.semantics).await;
        if let Some(callback) = &self.completion {
            callback(result.is_ok());
        }
        result
    }

    /// Execute on the background pool. Completion is observable through
    /// [`wait`](Batch::wait) or the completion callback.
    pub async fn execute_async(&mut self) {
        let operations = mem::take(&mut self.operations);
        let client = self.client.clone();
        let semantics = self.semantics;
        let completion = self.completion.clone();

        let handle = self
            .client
            .background
            .submit(async move {
                let result = execute_or_defer(&client, operations, semantics).await;
                if let Err(e) = &result {
                    warn!(error = %e, "asynchronous batch failed");
                }
                let ok = result.is_ok();
                if let Some(callback) = completion {
                    callback(ok);
                }
                ok
            })
            .await;

        self.pending.push(handle);
    }

    /// Wait for every asynchronous execute issued on this batch.
    pub async fn wait(&mut self) -> Result<(), ClientError> {
        let mut ok = true;
        for handle in self.pending.drain(..) {
            match handle.wait().await {
                Some(success) => ok &= success,
                None => return Err(ClientError::TaskDropped),
            }
        }
        if ok { Ok(()) } else { Err(ClientError::BatchFailed) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn put(index: u32, namespace: &str, key: &str) -> Operation {
        Operation::KvPut {
            kv: KvHandle::new(index, namespace.to_string(), key.to_string()),
            value: Bytes::from_static(b"v"),
        }
    }

    fn delete(index: u32, namespace: &str, key: &str) -> Operation {
        Operation::KvDelete {
            kv: KvHandle::new(index, namespace.to_string(), key.to_string()),
        }
    }

    fn kinds(runs: &[Vec<Operation>]) -> Vec<(OpKind, usize)> {
        runs.iter().map(|run| (run[0].kind(), run.len())).collect()
    }

    #[test]
    fn test_intervening_kind_splits_runs() {
        // put, put, delete, put on one server/namespace: three runs, and
        // the puts around the delete do not merge.
        let operations = vec![
            put(0, "x", "k1"),
            put(0, "x", "k2"),
            delete(0, "x", "k3"),
            put(0, "x", "k4"),
        ];
        let runs = split_runs(operations);
        assert_eq!(
            kinds(&runs),
            vec![(OpKind::KvPut, 2), (OpKind::KvDelete, 1), (OpKind::KvPut, 1)]
        );
    }

    #[test]
    fn test_namespace_change_splits_runs() {
        let operations = vec![put(0, "a", "k1"), put(0, "b", "k2"), put(0, "a", "k3")];
        let runs = split_runs(operations);
        assert_eq!(
            kinds(&runs),
            vec![(OpKind::KvPut, 1), (OpKind::KvPut, 1), (OpKind::KvPut, 1)]
        );
    }

    #[test]
    fn test_server_index_change_splits_runs() {
        let operations = vec![put(0, "x", "k1"), put(1, "x", "k2")];
        assert_eq!(split_runs(operations).len(), 2);
    }

    #[test]
    fn test_contiguous_same_target_ops_form_one_run() {
        let operations = vec![put(0, "x", "a"), put(0, "x", "b"), put(0, "x", "c")];
        let runs = split_runs(operations);
        assert_eq!(kinds(&runs), vec![(OpKind::KvPut, 3)]);
    }

    #[test]
    fn test_read_runs_are_per_object() {
        let alpha = ObjectHandle::new(0, "ns".to_string(), "alpha".to_string());
        let beta = ObjectHandle::new(0, "ns".to_string(), "beta".to_string());

        let operations = vec![
            Operation::ObjectRead {
                object: alpha.clone(),
                length: 16,
                offset: 0,
                result: ReadResult::new(),
            },
            Operation::ObjectRead {
                object: beta,
                length: 16,
                offset: 0,
                result: ReadResult::new(),
            },
            Operation::ObjectRead {
                object: alpha,
                length: 16,
                offset: 16,
                result: ReadResult::new(),
            },
        ];

        // Same namespace and server, but reads carry the object name once
        // per frame, so each object change starts a new run.
        assert_eq!(split_runs(operations).len(), 3);
    }

    #[test]
    fn test_create_runs_merge_across_names() {
        let alpha = ObjectHandle::new(0, "ns".to_string(), "alpha".to_string());
        let beta = ObjectHandle::new(0, "ns".to_string(), "beta".to_string());

        let operations = vec![
            Operation::ObjectCreate { object: alpha },
            Operation::ObjectCreate { object: beta },
        ];
        assert_eq!(split_runs(operations).len(), 1);
    }

    #[test]
    fn test_empty_batch_has_no_runs() {
        assert!(split_runs(Vec::new()).is_empty());
    }
}
