//! Per-connection frame dispatch.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use skiff_backend::{KvBackend, ObjectBackend};
use skiff_proto::{Connection, MAX_BODY_LEN, Message, OpCode};
use skiff_types::Safety;
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::error::ServerError;

/// Bulk bytes buffered per read reply frame before it is flushed. Long read
/// runs therefore stream as multiple reply frames.
const READ_REPLY_BULK_CAP: u64 = 4 * 1024 * 1024;

/// Run the receive/dispatch loop until the peer disconnects or a protocol
/// error poisons the connection.
pub(crate) async fn serve_connection(
    stream: TcpStream,
    object_backend: Arc<dyn ObjectBackend>,
    kv_backend: Arc<dyn KvBackend>,
) {
    let mut conn = Connection::from_stream(stream);
    let peer = conn.peer_addr();

    loop {
        let message = match Message::receive(&mut conn).await {
            Ok(message) => message,
            Err(e) if e.is_closed() => {
                debug!(?peer, "connection closed");
                return;
            }
            Err(e) => {
                warn!(?peer, error = %e, "receive failed, closing connection");
                return;
            }
        };

        if let Err(e) = dispatch(&mut conn, message, &object_backend, &kv_backend).await {
            warn!(?peer, error = %e, "dispatch failed, closing connection");
            return;
        }
    }
}

async fn dispatch(
    conn: &mut Connection,
    message: Message,
    object_backend: &Arc<dyn ObjectBackend>,
    kv_backend: &Arc<dyn KvBackend>,
) -> Result<(), ServerError> {
    match message.opcode() {
        Some(
            op @ (OpCode::ObjectCreate
            | OpCode::ObjectDelete
            | OpCode::ObjectOpen
            | OpCode::ObjectClose
            | OpCode::ObjectSync),
        ) => object_simple(conn, message, object_backend, op).await,
        Some(OpCode::ObjectStatus) => object_status(conn, message, object_backend).await,
        Some(OpCode::ObjectRead) => object_read(conn, message, object_backend).await,
        Some(OpCode::ObjectWrite) => object_write(conn, message, object_backend).await,
        Some(OpCode::KvPut) => kv_put(conn, message, kv_backend).await,
        Some(OpCode::KvDelete) => kv_delete(conn, message, kv_backend).await,
        Some(OpCode::KvGet) => kv_get(conn, message, kv_backend).await,
        Some(OpCode::None) | None => unknown(conn, message).await,
    }
}

/// Create, delete, open, close, and sync share a frame shape: names in,
/// one result code out per name.
async fn object_simple(
    conn: &mut Connection,
    mut message: Message,
    backend: &Arc<dyn ObjectBackend>,
    op: OpCode,
) -> Result<(), ServerError> {
    let count = message.count();
    let wants_reply = message.wants_reply();
    let wants_storage = message.wants_storage();
    let mut reply = Message::reply_to(&message);

    let namespace = message.get_str()?.to_string();

    for _ in 0..count {
        let name = message.get_str()?;

        let result = match op {
            OpCode::ObjectCreate => backend.create(&namespace, name).await,
            OpCode::ObjectDelete => backend.delete(&namespace, name).await,
            OpCode::ObjectOpen => backend.open(&namespace, name).await,
            // Per-call path resolution leaves nothing to close.
            OpCode::ObjectClose => Ok(()),
            OpCode::ObjectSync => backend.sync(&namespace, name).await,
            _ => unreachable!("non-simple opcode"),
        };

        let mut ok = match result {
            Ok(()) => true,
            Err(e) => {
                debug!(%namespace, name, ?op, error = %e, "operation failed");
                false
            }
        };

        if ok && wants_storage && op == OpCode::ObjectCreate {
            ok = backend.sync(&namespace, name).await.is_ok();
        }

        if wants_reply {
            reply.add_operation(8);
            reply.append_8(u64::from(ok));
        }
    }

    if wants_reply {
        reply.send(conn).await?;
    }
    Ok(())
}

async fn object_status(
    conn: &mut Connection,
    mut message: Message,
    backend: &Arc<dyn ObjectBackend>,
) -> Result<(), ServerError> {
    let count = message.count();
    let mut reply = Message::reply_to(&message);

    let namespace = message.get_str()?.to_string();

    for _ in 0..count {
        let name = message.get_str()?;
        let (modification_time, size) = match backend.status(&namespace, name).await {
            Ok(status) => (status.modification_time, status.size),
            Err(e) => {
                debug!(%namespace, name, error = %e, "status failed");
                (0, 0)
            }
        };
        reply.add_operation(16);
        reply.append_8(modification_time as u64);
        reply.append_8(size);
    }

    // Status answers are the reply; safety flags do not matter here.
    reply.send(conn).await?;
    Ok(())
}

async fn object_read(
    conn: &mut Connection,
    mut message: Message,
    backend: &Arc<dyn ObjectBackend>,
) -> Result<(), ServerError> {
    let count = message.count();
    let namespace = message.get_str()?.to_string();
    let name = message.get_str()?.to_string();

    let mut reply = Message::reply_to(&message);
    let mut buffered = 0u64;

    for i in 0..count {
        let length = message.get_8()?;
        let offset = message.get_8()?;

        let data = match backend.read(&namespace, &name, length, offset).await {
            Ok(data) => data,
            Err(e) => {
                debug!(%namespace, %name, error = %e, "read failed");
                Bytes::new()
            }
        };

        reply.add_operation(8);
        reply.append_8(data.len() as u64);
        buffered += data.len() as u64;
        if !data.is_empty() {
            reply.add_send(data);
        }

        // Flush a partial reply once enough bulk has accumulated; the
        // client keeps receiving frames until every operation is answered.
        if buffered >= READ_REPLY_BULK_CAP && i + 1 < count {
            reply.send(conn).await?;
            reply = Message::reply_to(&message);
            buffered = 0;
        }
    }

    if count > 0 {
        reply.send(conn).await?;
    }
    Ok(())
}

async fn object_write(
    conn: &mut Connection,
    mut message: Message,
    backend: &Arc<dyn ObjectBackend>,
) -> Result<(), ServerError> {
    let count = message.count();
    let wants_reply = message.wants_reply();
    let wants_storage = message.wants_storage();
    let mut reply = Message::reply_to(&message);

    let namespace = message.get_str()?.to_string();
    let name = message.get_str()?.to_string();

    for _ in 0..count {
        let length = message.get_8()?;
        let offset = message.get_8()?;

        if length > MAX_BODY_LEN as u64 {
            return Err(ServerError::BulkTooLarge { len: length });
        }

        // The payload must be consumed from the stream even when the
        // backend rejects the write, or the framing desynchronizes.
        let mut data = BytesMut::zeroed(length as usize);
        conn.read_exact(&mut data).await?;

        let written = match backend.write(&namespace, &name, &data, offset).await {
            Ok(written) => written,
            Err(e) => {
                debug!(%namespace, %name, error = %e, "write failed");
                0
            }
        };

        if wants_reply {
            reply.add_operation(8);
            reply.append_8(written);
        }
    }

    if wants_storage && let Err(e) = backend.sync(&namespace, &name).await {
        warn!(%namespace, %name, error = %e, "sync after write failed");
    }

    if wants_reply {
        reply.send(conn).await?;
    }
    Ok(())
}

fn safety_from_flags(message: &Message) -> Safety {
    if message.wants_storage() {
        Safety::Storage
    } else if message.wants_reply() {
        Safety::Network
    } else {
        Safety::None
    }
}

async fn kv_put(
    conn: &mut Connection,
    mut message: Message,
    backend: &Arc<dyn KvBackend>,
) -> Result<(), ServerError> {
    let count = message.count();
    let wants_reply = message.wants_reply();
    let wants_storage = message.wants_storage();

    let namespace = message.get_str()?.to_string();

    let mut batch = match backend.batch(&namespace, safety_from_flags(&message)).await {
        Ok(batch) => Some(batch),
        Err(e) => {
            warn!(%namespace, error = %e, "kv batch start failed");
            None
        }
    };

    for _ in 0..count {
        let key = message.get_str()?.to_string();
        let length = message.get_4()?;
        let value = Bytes::copy_from_slice(message.get_n(length as usize)?);
        if let Some(batch) = batch.as_mut() {
            batch.put(&key, value);
        }
    }

    let mut ok = batch.is_some();
    if let Some(batch) = batch
        && let Err(e) = batch.commit().await
    {
        warn!(%namespace, error = %e, "kv batch commit failed");
        ok = false;
    }

    if wants_reply {
        let mut reply = Message::reply_to(&message);
        if wants_storage {
            for _ in 0..count {
                reply.add_operation(4);
                reply.append_4(u32::from(ok));
            }
        }
        reply.send(conn).await?;
    }
    Ok(())
}

async fn kv_delete(
    conn: &mut Connection,
    mut message: Message,
    backend: &Arc<dyn KvBackend>,
) -> Result<(), ServerError> {
    let count = message.count();
    let wants_reply = message.wants_reply();

    let namespace = message.get_str()?.to_string();

    let mut batch = match backend.batch(&namespace, safety_from_flags(&message)).await {
        Ok(batch) => Some(batch),
        Err(e) => {
            warn!(%namespace, error = %e, "kv batch start failed");
            None
        }
    };

    for _ in 0..count {
        let key = message.get_str()?;
        if let Some(batch) = batch.as_mut() {
            batch.delete(key);
        }
    }

    if let Some(batch) = batch
        && let Err(e) = batch.commit().await
    {
        warn!(%namespace, error = %e, "kv batch commit failed");
    }

    if wants_reply {
        Message::reply_to(&message).send(conn).await?;
    }
    Ok(())
}

async fn kv_get(
    conn: &mut Connection,
    mut message: Message,
    backend: &Arc<dyn KvBackend>,
) -> Result<(), ServerError> {
    let count = message.count();
    let mut reply = Message::reply_to(&message);

    let namespace = message.get_str()?.to_string();

    for _ in 0..count {
        let key = message.get_str()?;
        match backend.get(&namespace, key).await {
            Ok(Some(value)) => {
                reply.add_operation(4 + value.len());
                reply.append_4(value.len() as u32);
                reply.append_n(&value);
            }
            // A zero length tells the client the key is absent.
            Ok(None) => {
                reply.add_operation(4);
                reply.append_4(0);
            }
            Err(e) => {
                warn!(%namespace, key, error = %e, "kv get failed");
                reply.add_operation(4);
                reply.append_4(0);
            }
        }
    }

    reply.send(conn).await?;
    Ok(())
}

/// Unknown opcodes are logged and answered (when a reply is requested)
/// with a zero field per sub-operation, so old clients and new servers can
/// coexist without killing the connection.
async fn unknown(conn: &mut Connection, message: Message) -> Result<(), ServerError> {
    warn!(op = message.op(), count = message.count(), "unknown opcode");

    if message.wants_reply() {
        let mut reply = Message::reply_to(&message);
        for _ in 0..message.count() {
            reply.add_operation(4);
            reply.append_4(0);
        }
        reply.send(conn).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Server;
    use skiff_backend::{MemoryKvBackend, PosixObjectBackend};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn spawn_server() -> (std::net::SocketAddr, tokio::task::JoinHandle<()>, tempfile::TempDir)
    {
        let dir = tempfile::tempdir().unwrap();
        let object_backend = Arc::new(PosixObjectBackend::new(dir.path()).unwrap());
        let kv_backend = Arc::new(MemoryKvBackend::new());

        let server = Server::bind("127.0.0.1:0", object_backend, kv_backend)
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            server.serve(std::future::pending()).await.unwrap();
        });
        (addr, handle, dir)
    }

    #[tokio::test]
    async fn test_unknown_opcode_gets_zero_filled_reply() {
        let (addr, server, _dir) = spawn_server().await;

        let mut stream = TcpStream::connect(addr).await.unwrap();

        // Hand-rolled frame with opcode 99, network safety, two sub-ops.
        let mut frame = Vec::new();
        frame.extend_from_slice(b"SKF1");
        frame.extend_from_slice(&99u32.to_le_bytes());
        frame.extend_from_slice(&1u32.to_le_bytes()); // SAFETY_NETWORK
        frame.extend_from_slice(&0u32.to_le_bytes()); // empty body
        frame.extend_from_slice(&2u32.to_le_bytes());
        stream.write_all(&frame).await.unwrap();

        let mut header = [0u8; 20];
        stream.read_exact(&mut header).await.unwrap();
        assert_eq!(&header[0..4], b"SKF1");
        assert_eq!(u32::from_le_bytes(header[4..8].try_into().unwrap()), 99);
        let body_len = u32::from_le_bytes(header[12..16].try_into().unwrap());
        let reply_count = u32::from_le_bytes(header[16..20].try_into().unwrap());
        assert_eq!(reply_count, 2);
        assert_eq!(body_len, 8);

        let mut body = vec![0u8; body_len as usize];
        stream.read_exact(&mut body).await.unwrap();
        assert!(body.iter().all(|&b| b == 0));

        // The connection survived: a valid request still works.
        let mut conn = Connection::from_stream(stream);
        let mut request = Message::new(OpCode::KvGet);
        request.append_str("ns");
        request.add_operation(2);
        request.append_str("k");
        request.send(&mut conn).await.unwrap();

        let mut reply = Message::receive(&mut conn).await.unwrap();
        assert_eq!(reply.count(), 1);
        assert_eq!(reply.get_4().unwrap(), 0);

        server.abort();
    }

    #[tokio::test]
    async fn test_garbage_frame_closes_connection_but_not_server() {
        let (addr, server, _dir) = spawn_server().await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(&[0xFFu8; 20]).await.unwrap();

        // The worker drops the connection on a magic mismatch.
        let mut buf = [0u8; 1];
        assert_eq!(stream.read(&mut buf).await.unwrap(), 0);

        // The listener is unaffected.
        let mut conn = Connection::from_stream(TcpStream::connect(addr).await.unwrap());
        let mut request = Message::new(OpCode::KvGet);
        request.append_str("ns");
        request.add_operation(2);
        request.append_str("k");
        request.send(&mut conn).await.unwrap();
        assert!(Message::receive(&mut conn).await.is_ok());

        server.abort();
    }
}
