//! Deferral cache for safety-none batches.
//!
//! A batch executed without any safety requirement does not need to reach
//! the servers before the call returns. The cache queues such batches and
//! replays them, in submission order, right before the next batch that does
//! require acknowledgement (or at client shutdown).

use std::collections::VecDeque;
use std::sync::Arc;

use skiff_types::Semantics;
use tokio::sync::Mutex;
use tracing::debug;

use crate::ClientInner;
use crate::batch::{Operation, execute_operations};
use crate::error::ClientError;

pub(crate) struct DeferredBatch {
    operations: Vec<Operation>,
    semantics: Semantics,
}

pub(crate) struct OperationCache {
    /// Maximum queued batches; 0 disables deferral entirely.
    capacity: usize,
    deferred: Mutex<VecDeque<DeferredBatch>>,
}

impl OperationCache {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity,
            deferred: Mutex::new(VecDeque::new()),
        }
    }

    pub(crate) fn is_enabled(&self) -> bool {
        self.capacity > 0
    }

    /// Queue a safety-none batch. When the cache is full, the queued
    /// batches are flushed synchronously first; a flush failure is the only
    /// way deferral reports an error.
    pub(crate) async fn defer(
        &self,
        client: &Arc<ClientInner>,
        operations: Vec<Operation>,
        semantics: Semantics,
    ) -> Result<(), ClientError> {
        let overflow = {
            let mut deferred = self.deferred.lock().await;
            if deferred.len() >= self.capacity {
                deferred.drain(..).collect::<Vec<_>>()
            } else {
                Vec::new()
            }
        };

        let result = if overflow.is_empty() {
            Ok(())
        } else {
            debug!(count = overflow.len(), "operation cache full, flushing");
            replay(client, overflow).await
        };

        self.deferred.lock().await.push_back(DeferredBatch {
            operations,
            semantics,
        });

        result
    }

    /// Execute every deferred batch in submission order.
    pub(crate) async fn flush(&self, client: &Arc<ClientInner>) -> Result<(), ClientError> {
        let deferred: Vec<_> = {
            let mut queue = self.deferred.lock().await;
            queue.drain(..).collect()
        };
        if deferred.is_empty() {
            return Ok(());
        }

        debug!(count = deferred.len(), "flushing deferred batches");
        replay(client, deferred).await
    }
}

async fn replay(
    client: &Arc<ClientInner>,
    batches: Vec<DeferredBatch>,
) -> Result<(), ClientError> {
    let mut first_error = None;
    for batch in batches {
        if let Err(e) = execute_operations(client, batch.operations, &batch.semantics).await {
            first_error.get_or_insert(e);
        }
    }
    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
