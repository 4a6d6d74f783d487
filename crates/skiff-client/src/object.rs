//! Object client: handles, result slots, and per-kind run execution.
//!
//! The public calls only append descriptors to a batch; the work happens
//! when the batch executes. Each `execute_*` function receives one run of
//! merge-compatible operations and turns it into a single local backend
//! pass or a single wire message.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::{Bytes, BytesMut};
use skiff_backend::ObjectStatus;
use skiff_proto::{Message, OpCode};
use skiff_types::{Safety, Semantics};
use tracing::debug;

use crate::ClientInner;
use crate::batch::{Batch, Operation};
use crate::error::ClientError;

/// A named byte stream on one object server.
///
/// The server index is fixed at construction (hashed from the name unless
/// given explicitly), so every operation on the same handle targets the
/// same server. Handles are cheap to clone and share.
#[derive(Debug, Clone)]
pub struct ObjectHandle {
    inner: Arc<ObjectInner>,
}

#[derive(Debug)]
struct ObjectInner {
    index: u32,
    namespace: String,
    name: String,
}

impl ObjectHandle {
    pub(crate) fn new(index: u32, namespace: String, name: String) -> Self {
        Self {
            inner: Arc::new(ObjectInner {
                index,
                namespace,
                name,
            }),
        }
    }

    pub fn index(&self) -> u32 {
        self.inner.index
    }

    pub fn namespace(&self) -> &str {
        &self.inner.namespace
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Schedule creation of this object.
    pub fn create(&self, batch: &mut Batch) {
        batch.add(Operation::ObjectCreate {
            object: self.clone(),
        });
    }

    /// Schedule deletion of this object.
    pub fn delete(&self, batch: &mut Batch) {
        batch.add(Operation::ObjectDelete {
            object: self.clone(),
        });
    }

    /// Schedule a status query; the result slot fills on execute.
    pub fn status(&self, batch: &mut Batch) -> StatusResult {
        let result = StatusResult::new();
        batch.add(Operation::ObjectStatus {
            object: self.clone(),
            result: result.clone(),
        });
        result
    }

    /// Schedule a read of `length` bytes at `offset`.
    ///
    /// The byte counter and buffer fill as replies stream in during
    /// execute. A zero-length read schedules nothing.
    pub fn read(
        &self,
        batch: &mut Batch,
        length: u64,
        offset: u64,
    ) -> Result<ReadResult, ClientError> {
        if length == 0 {
            return Err(ClientError::InvalidArgument("zero-length read"));
        }

        let result = ReadResult::new();
        batch.add(Operation::ObjectRead {
            object: self.clone(),
            length,
            offset,
            result: result.clone(),
        });
        Ok(result)
    }

    /// Schedule a write of `data` at `offset`.
    ///
    /// Under safety `none` the counter is credited optimistically with the
    /// full length; otherwise it reflects the server's per-operation
    /// answers. An empty write schedules nothing.
    pub fn write(
        &self,
        batch: &mut Batch,
        data: Bytes,
        offset: u64,
    ) -> Result<WriteResult, ClientError> {
        if data.is_empty() {
            return Err(ClientError::InvalidArgument("zero-length write"));
        }

        let result = WriteResult::new();
        batch.add(Operation::ObjectWrite {
            object: self.clone(),
            data,
            offset,
            result: result.clone(),
        });
        Ok(result)
    }
}

// -----------------------------------------------------------------------
// Result slots
// -----------------------------------------------------------------------

/// Accumulates the outcome of a scheduled read.
#[derive(Debug, Clone)]
pub struct ReadResult {
    inner: Arc<ReadInner>,
}

#[derive(Debug)]
struct ReadInner {
    bytes_read: AtomicU64,
    data: Mutex<BytesMut>,
}

impl ReadResult {
    pub(crate) fn new() -> Self {
        Self {
            inner: Arc::new(ReadInner {
                bytes_read: AtomicU64::new(0),
                data: Mutex::new(BytesMut::new()),
            }),
        }
    }

    /// Bytes confirmed so far; the final value after execute.
    pub fn bytes_read(&self) -> u64 {
        self.inner.bytes_read.load(Ordering::Acquire)
    }

    /// Copy of the bytes received so far.
    pub fn bytes(&self) -> Bytes {
        let data = self.inner.data.lock().expect("read slot lock poisoned");
        Bytes::copy_from_slice(&data)
    }

    fn credit(&self, count: u64) {
        self.inner.bytes_read.fetch_add(count, Ordering::AcqRel);
    }

    fn append(&self, chunk: &[u8]) {
        let mut data = self.inner.data.lock().expect("read slot lock poisoned");
        data.extend_from_slice(chunk);
    }
}

/// Accumulates the confirmed byte count of a scheduled write.
#[derive(Debug, Clone)]
pub struct WriteResult {
    bytes_written: Arc<AtomicU64>,
}

impl WriteResult {
    pub(crate) fn new() -> Self {
        Self {
            bytes_written: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Acquire)
    }

    fn credit(&self, count: u64) {
        self.bytes_written.fetch_add(count, Ordering::AcqRel);
    }
}

/// Holds the answer of a scheduled status query.
#[derive(Debug, Clone)]
pub struct StatusResult {
    inner: Arc<Mutex<Option<ObjectStatus>>>,
}

impl StatusResult {
    pub(crate) fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(None)),
        }
    }

    /// The status, or `None` if the batch has not executed (or the run
    /// failed before this operation was answered).
    pub fn status(&self) -> Option<ObjectStatus> {
        *self.inner.lock().expect("status slot lock poisoned")
    }

    fn set(&self, status: ObjectStatus) {
        *self.inner.lock().expect("status slot lock poisoned") = Some(status);
    }
}

// -----------------------------------------------------------------------
// Run execution
// -----------------------------------------------------------------------

fn object_of(operation: &Operation) -> &ObjectHandle {
    match operation {
        Operation::ObjectCreate { object }
        | Operation::ObjectDelete { object }
        | Operation::ObjectRead { object, .. }
        | Operation::ObjectWrite { object, .. }
        | Operation::ObjectStatus { object, .. } => object,
        _ => unreachable!("object run contains a non-object operation"),
    }
}

pub(crate) async fn execute_create(
    client: &Arc<ClientInner>,
    run: &[Operation],
    semantics: &Semantics,
) -> Result<(), ClientError> {
    let first = object_of(&run[0]);

    if let Some(backend) = &client.object_backend {
        let mut first_error = None;
        for operation in run {
            let object = object_of(operation);
            if let Err(e) = backend.create(object.namespace(), object.name()).await {
                first_error.get_or_insert(e.into());
            }
        }
        return or_ok(first_error);
    }

    let mut message = Message::new(OpCode::ObjectCreate);
    message.set_safety(semantics);
    // A reply is required even under unsafe semantics: a following write on
    // another pooled connection could otherwise reach the server before the
    // create does.
    message.force_safety(Safety::Network);
    message.append_str(first.namespace());
    for operation in run {
        let object = object_of(operation);
        message.add_operation(object.name().len() + 1);
        message.append_str(object.name());
    }

    let mut conn = client.pool.pop_object(first.index()).await?;
    let result = send_and_check(&mut conn, &message, run.len(), "create").await;
    poison_on_proto_error(&mut conn, &result);
    client.pool.push_object(first.index(), conn);
    result
}

pub(crate) async fn execute_delete(
    client: &Arc<ClientInner>,
    run: &[Operation],
    semantics: &Semantics,
) -> Result<(), ClientError> {
    let first = object_of(&run[0]);

    if let Some(backend) = &client.object_backend {
        let mut first_error = None;
        for operation in run {
            let object = object_of(operation);
            if let Err(e) = backend.delete(object.namespace(), object.name()).await {
                first_error.get_or_insert(e.into());
            }
        }
        return or_ok(first_error);
    }

    let mut message = Message::new(OpCode::ObjectDelete);
    message.set_safety(semantics);
    message.append_str(first.namespace());
    for operation in run {
        let object = object_of(operation);
        message.add_operation(object.name().len() + 1);
        message.append_str(object.name());
    }

    let mut conn = client.pool.pop_object(first.index()).await?;
    let result = send_and_check(&mut conn, &message, run.len(), "delete").await;
    poison_on_proto_error(&mut conn, &result);
    client.pool.push_object(first.index(), conn);
    result
}

/// Send a request and, when a reply is due, check the per-operation result
/// codes.
async fn send_and_check(
    conn: &mut crate::pool::PooledConnection,
    message: &Message,
    count: usize,
    what: &'static str,
) -> Result<(), ClientError> {
    message.send(conn).await?;

    if message.wants_reply() {
        let mut reply = Message::receive(conn).await?;
        let mut ok = true;
        for _ in 0..count {
            ok &= reply.get_8()? != 0;
        }
        if !ok {
            return Err(ClientError::Remote(what));
        }
    }
    Ok(())
}

pub(crate) async fn execute_read(
    client: &Arc<ClientInner>,
    run: &[Operation],
    semantics: &Semantics,
) -> Result<(), ClientError> {
    fn parts(operation: &Operation) -> (&ObjectHandle, u64, u64, &ReadResult) {
        match operation {
            Operation::ObjectRead {
                object,
                length,
                offset,
                result,
            } => (object, *length, *offset, result),
            _ => unreachable!("read run contains a non-read operation"),
        }
    }

    let (first, ..) = parts(&run[0]);

    if let Some(backend) = &client.object_backend {
        let mut first_error = None;
        for operation in run {
            let (object, length, offset, result) = parts(operation);
            match backend
                .read(object.namespace(), object.name(), length, offset)
                .await
            {
                Ok(data) => {
                    result.credit(data.len() as u64);
                    result.append(&data);
                }
                Err(e) => {
                    first_error.get_or_insert(e.into());
                }
            }
        }
        return or_ok(first_error);
    }

    let mut message = Message::new(OpCode::ObjectRead);
    message.set_safety(semantics);
    message.append_str(first.namespace());
    message.append_str(first.name());
    for operation in run {
        let (_, length, offset, _) = parts(operation);
        message.add_operation(16);
        message.append_8(length);
        message.append_8(offset);
    }

    let mut conn = client.pool.pop_object(first.index()).await?;
    let result = async {
        message.send(&mut conn).await?;

        // The server may answer a long run across several reply frames;
        // each frame covers the next `count` operations, with the bulk
        // bytes following the frame on the stream.
        let total = run.len() as u32;
        let mut answered = 0u32;
        let mut pending = run.iter();

        while answered < total {
            let mut reply = Message::receive(&mut conn).await?;
            let reply_count = reply.count();
            if reply_count == 0 || reply_count > total - answered {
                conn.mark_broken();
                return Err(ClientError::Remote("read"));
            }

            for _ in 0..reply_count {
                let operation = pending.next().expect("reply count checked above");
                let (_, _, _, slot) = parts(operation);

                let returned = reply.get_8()?;
                slot.credit(returned);
                if returned > 0 {
                    let mut chunk = BytesMut::zeroed(returned as usize);
                    conn.read_exact(&mut chunk).await?;
                    slot.append(&chunk);
                }
            }
            answered += reply_count;
        }
        Ok(())
    }
    .await;
    poison_on_proto_error(&mut conn, &result);
    client.pool.push_object(first.index(), conn);
    result
}

pub(crate) async fn execute_write(
    client: &Arc<ClientInner>,
    run: &[Operation],
    semantics: &Semantics,
) -> Result<(), ClientError> {
    fn parts(operation: &Operation) -> (&ObjectHandle, &Bytes, u64, &WriteResult) {
        match operation {
            Operation::ObjectWrite {
                object,
                data,
                offset,
                result,
            } => (object, data, *offset, result),
            _ => unreachable!("write run contains a non-write operation"),
        }
    }

    let (first, ..) = parts(&run[0]);

    if let Some(backend) = &client.object_backend {
        let mut first_error = None;
        for operation in run {
            let (object, data, offset, result) = parts(operation);
            match backend
                .write(object.namespace(), object.name(), data, offset)
                .await
            {
                Ok(written) => result.credit(written),
                Err(e) => {
                    first_error.get_or_insert(e.into());
                }
            }
        }
        return or_ok(first_error);
    }

    let mut message = Message::new(OpCode::ObjectWrite);
    message.set_safety(semantics);
    message.append_str(first.namespace());
    message.append_str(first.name());
    for operation in run {
        let (_, data, offset, result) = parts(operation);
        message.add_operation(16);
        message.append_8(data.len() as u64);
        message.append_8(offset);
        message.add_send(data.clone());

        // Without acknowledgement there is nothing to wait for; credit the
        // full length now. A short write can no longer be reported.
        if semantics.safety() == Safety::None {
            result.credit(data.len() as u64);
        }
    }

    let mut conn = client.pool.pop_object(first.index()).await?;
    let result = async {
        message.send(&mut conn).await?;

        if message.wants_reply() {
            let mut reply = Message::receive(&mut conn).await?;
            for operation in run {
                let (_, _, _, slot) = parts(operation);
                slot.credit(reply.get_8()?);
            }
        }
        Ok(())
    }
    .await;
    poison_on_proto_error(&mut conn, &result);
    client.pool.push_object(first.index(), conn);
    result
}

pub(crate) async fn execute_status(
    client: &Arc<ClientInner>,
    run: &[Operation],
    semantics: &Semantics,
) -> Result<(), ClientError> {
    fn parts(operation: &Operation) -> (&ObjectHandle, &StatusResult) {
        match operation {
            Operation::ObjectStatus { object, result } => (object, result),
            _ => unreachable!("status run contains a non-status operation"),
        }
    }

    let (first, _) = parts(&run[0]);

    if let Some(backend) = &client.object_backend {
        let mut first_error = None;
        for operation in run {
            let (object, result) = parts(operation);
            match backend.status(object.namespace(), object.name()).await {
                Ok(status) => result.set(status),
                Err(e) => {
                    first_error.get_or_insert(e.into());
                }
            }
        }
        return or_ok(first_error);
    }

    let mut message = Message::new(OpCode::ObjectStatus);
    message.set_safety(semantics);
    message.append_str(first.namespace());
    for operation in run {
        let (object, _) = parts(operation);
        message.add_operation(object.name().len() + 1);
        message.append_str(object.name());
    }

    let mut conn = client.pool.pop_object(first.index()).await?;
    let result = async {
        message.send(&mut conn).await?;

        // Status always replies, independent of the safety flags.
        let mut reply = Message::receive(&mut conn).await?;
        for operation in run {
            let (_, slot) = parts(operation);
            let modification_time = reply.get_8()? as i64;
            let size = reply.get_8()?;
            slot.set(ObjectStatus {
                modification_time,
                size,
            });
        }
        Ok(())
    }
    .await;
    poison_on_proto_error(&mut conn, &result);
    client.pool.push_object(first.index(), conn);

    debug!(count = run.len(), "status run finished");
    result
}

pub(crate) fn or_ok(first_error: Option<ClientError>) -> Result<(), ClientError> {
    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// A framing error leaves the stream position undefined, so the connection
/// must not be reused even when the socket itself still works.
pub(crate) fn poison_on_proto_error(
    conn: &mut crate::pool::PooledConnection,
    result: &Result<(), ClientError>,
) {
    if matches!(result, Err(ClientError::Proto(_))) {
        conn.mark_broken();
    }
}
