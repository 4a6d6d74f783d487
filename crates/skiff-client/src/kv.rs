//! Key-value client: handles, get sinks, and per-kind run execution.

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use skiff_proto::{Message, OpCode};
use skiff_types::{Safety, Semantics};

use crate::ClientInner;
use crate::batch::{Batch, Operation};
use crate::error::ClientError;
use crate::object::{or_ok, poison_on_proto_error};

/// A key on one kv server.
///
/// Mirrors the object handle: the server index is hashed from the key
/// unless given explicitly, so a key always lives on the same server.
#[derive(Debug, Clone)]
pub struct KvHandle {
    inner: Arc<KvInner>,
}

#[derive(Debug)]
struct KvInner {
    index: u32,
    namespace: String,
    key: String,
}

impl KvHandle {
    pub(crate) fn new(index: u32, namespace: String, key: String) -> Self {
        Self {
            inner: Arc::new(KvInner {
                index,
                namespace,
                key,
            }),
        }
    }

    pub fn index(&self) -> u32 {
        self.inner.index
    }

    pub fn namespace(&self) -> &str {
        &self.inner.namespace
    }

    pub fn key(&self) -> &str {
        &self.inner.key
    }

    /// Schedule a put of `value` under this key.
    pub fn put(&self, batch: &mut Batch, value: Bytes) {
        batch.add(Operation::KvPut {
            kv: self.clone(),
            value,
        });
    }

    /// Schedule deletion of this key.
    pub fn delete(&self, batch: &mut Batch) {
        batch.add(Operation::KvDelete { kv: self.clone() });
    }

    /// Schedule a get; the result slot fills on execute. An absent key
    /// fails the operation's run.
    pub fn get(&self, batch: &mut Batch) -> KvGetResult {
        let result = KvGetResult::new();
        batch.add(Operation::KvGet {
            kv: self.clone(),
            sink: GetSink::Slot(result.clone()),
        });
        result
    }

    /// Schedule a get whose raw value bytes are handed to `decode` without
    /// an intermediate copy into a result slot.
    pub fn get_with(&self, batch: &mut Batch, decode: impl Fn(Bytes) + Send + Sync + 'static) {
        batch.add(Operation::KvGet {
            kv: self.clone(),
            sink: GetSink::Callback(Arc::new(decode)),
        });
    }
}

/// Holds the value answered for a scheduled get.
#[derive(Debug, Clone)]
pub struct KvGetResult {
    inner: Arc<Mutex<Option<Bytes>>>,
}

impl KvGetResult {
    fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(None)),
        }
    }

    /// The value, or `None` if the key was absent or the batch has not
    /// executed.
    pub fn value(&self) -> Option<Bytes> {
        self.inner.lock().expect("get slot lock poisoned").clone()
    }
}

/// Where a get delivers its value.
pub(crate) enum GetSink {
    Slot(KvGetResult),
    Callback(Arc<dyn Fn(Bytes) + Send + Sync>),
}

impl GetSink {
    fn deliver(&self, value: Bytes) {
        match self {
            GetSink::Slot(result) => {
                *result.inner.lock().expect("get slot lock poisoned") = Some(value);
            }
            GetSink::Callback(decode) => decode(value),
        }
    }
}

// -----------------------------------------------------------------------
// Run execution
// -----------------------------------------------------------------------

fn kv_of(operation: &Operation) -> &KvHandle {
    match operation {
        Operation::KvPut { kv, .. } | Operation::KvDelete { kv } | Operation::KvGet { kv, .. } => {
            kv
        }
        _ => unreachable!("kv run contains a non-kv operation"),
    }
}

pub(crate) async fn execute_put(
    client: &Arc<ClientInner>,
    run: &[Operation],
    semantics: &Semantics,
) -> Result<(), ClientError> {
    fn parts(operation: &Operation) -> (&KvHandle, &Bytes) {
        match operation {
            Operation::KvPut { kv, value } => (kv, value),
            _ => unreachable!("put run contains a non-put operation"),
        }
    }

    let (first, _) = parts(&run[0]);

    if let Some(backend) = &client.kv_backend {
        let mut batch = backend
            .batch(first.namespace(), semantics.safety())
            .await?;
        for operation in run {
            let (kv, value) = parts(operation);
            batch.put(kv.key(), value.clone());
        }
        batch.commit().await?;
        return Ok(());
    }

    let mut message = Message::new(OpCode::KvPut);
    message.set_safety(semantics);
    // A reply is required even under unsafe semantics: a following get on
    // another pooled connection could otherwise reach the server before
    // the put does.
    message.force_safety(Safety::Network);
    message.append_str(first.namespace());
    for operation in run {
        let (kv, value) = parts(operation);
        message.add_operation(kv.key().len() + 1 + 4 + value.len());
        message.append_str(kv.key());
        message.append_4(value.len() as u32);
        message.append_n(value);
    }

    let mut conn = client.pool.pop_kv(first.index()).await?;
    let result = async {
        message.send(&mut conn).await?;

        if message.wants_reply() {
            let mut reply = Message::receive(&mut conn).await?;
            if message.wants_storage() {
                // At storage safety the server reports each put's fate.
                let mut ok = true;
                for _ in 0..run.len() {
                    ok &= reply.get_4()? != 0;
                }
                if !ok {
                    return Err(ClientError::Remote("put"));
                }
            }
        }
        Ok(())
    }
    .await;
    poison_on_proto_error(&mut conn, &result);
    client.pool.push_kv(first.index(), conn);
    result
}

pub(crate) async fn execute_delete(
    client: &Arc<ClientInner>,
    run: &[Operation],
    semantics: &Semantics,
) -> Result<(), ClientError> {
    let first = kv_of(&run[0]);

    if let Some(backend) = &client.kv_backend {
        let mut batch = backend
            .batch(first.namespace(), semantics.safety())
            .await?;
        for operation in run {
            batch.delete(kv_of(operation).key());
        }
        batch.commit().await?;
        return Ok(());
    }

    let mut message = Message::new(OpCode::KvDelete);
    message.set_safety(semantics);
    message.append_str(first.namespace());
    for operation in run {
        let kv = kv_of(operation);
        message.add_operation(kv.key().len() + 1);
        message.append_str(kv.key());
    }

    let mut conn = client.pool.pop_kv(first.index()).await?;
    let result = async {
        message.send(&mut conn).await?;
        if message.wants_reply() {
            // Bare acknowledgement; deletes carry no per-operation answer.
            Message::receive(&mut conn).await?;
        }
        Ok(())
    }
    .await;
    poison_on_proto_error(&mut conn, &result);
    client.pool.push_kv(first.index(), conn);
    result
}

pub(crate) async fn execute_get(
    client: &Arc<ClientInner>,
    run: &[Operation],
    semantics: &Semantics,
) -> Result<(), ClientError> {
    fn parts(operation: &Operation) -> (&KvHandle, &GetSink) {
        match operation {
            Operation::KvGet { kv, sink } => (kv, sink),
            _ => unreachable!("get run contains a non-get operation"),
        }
    }

    let (first, _) = parts(&run[0]);

    if let Some(backend) = &client.kv_backend {
        let mut first_error = None;
        for operation in run {
            let (kv, sink) = parts(operation);
            match backend.get(kv.namespace(), kv.key()).await {
                Ok(Some(value)) => sink.deliver(value),
                Ok(None) => {
                    first_error.get_or_insert(ClientError::KeyNotFound {
                        namespace: kv.namespace().to_string(),
                        key: kv.key().to_string(),
                    });
                }
                Err(e) => {
                    first_error.get_or_insert(e.into());
                }
            }
        }
        return or_ok(first_error);
    }

    let mut message = Message::new(OpCode::KvGet);
    message.set_safety(semantics);
    message.append_str(first.namespace());
    for operation in run {
        let (kv, _) = parts(operation);
        message.add_operation(kv.key().len() + 1);
        message.append_str(kv.key());
    }

    let mut conn = client.pool.pop_kv(first.index()).await?;
    let result = async {
        message.send(&mut conn).await?;

        // Gets always reply: a zero value length marks an absent key.
        let mut reply = Message::receive(&mut conn).await?;
        let mut first_error = None;
        for operation in run {
            let (kv, sink) = parts(operation);
            let length = reply.get_4()?;
            if length > 0 {
                let value = Bytes::copy_from_slice(reply.get_n(length as usize)?);
                sink.deliver(value);
            } else {
                first_error.get_or_insert(ClientError::KeyNotFound {
                    namespace: kv.namespace().to_string(),
                    key: kv.key().to_string(),
                });
            }
        }
        or_ok(first_error)
    }
    .await;
    poison_on_proto_error(&mut conn, &result);
    client.pool.push_kv(first.index(), conn);
    result
}
