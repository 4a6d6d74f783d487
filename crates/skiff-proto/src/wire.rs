//! TCP connection wrapper used by the pool and the server.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use crate::ProtoError;

/// A client- or server-side TCP connection.
///
/// Any I/O error marks the connection broken; the connection pool discards
/// broken connections instead of returning them to the idle queue.
#[derive(Debug)]
pub struct Connection {
    stream: TcpStream,
    broken: bool,
}

impl Connection {
    /// Connect to a server address (`host:port`).
    pub async fn connect(addr: &str) -> Result<Self, ProtoError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|source| ProtoError::Connect {
                addr: addr.to_string(),
                source,
            })?;
        // Frames are small and latency-sensitive; coalescing hurts.
        stream.set_nodelay(true)?;
        debug!(%addr, "connected");
        Ok(Self {
            stream,
            broken: false,
        })
    }

    /// Wrap an accepted stream (server side).
    pub fn from_stream(stream: TcpStream) -> Self {
        let _ = stream.set_nodelay(true);
        Self {
            stream,
            broken: false,
        }
    }

    /// Whether a previous I/O error poisoned this connection.
    pub fn is_broken(&self) -> bool {
        self.broken
    }

    /// Mark the connection unusable so the pool discards it.
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }

    /// Read exactly `buf.len()` bytes, marking the connection broken on
    /// failure (including EOF).
    pub async fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), ProtoError> {
        if let Err(e) = self.stream.read_exact(buf).await {
            self.broken = true;
            return Err(e.into());
        }
        Ok(())
    }

    /// Write all of `buf`, marking the connection broken on failure.
    pub async fn write_all(&mut self, buf: &[u8]) -> Result<(), ProtoError> {
        if let Err(e) = self.stream.write_all(buf).await {
            self.broken = true;
            return Err(e.into());
        }
        Ok(())
    }

    /// The peer's socket address, for log context.
    pub fn peer_addr(&self) -> Option<std::net::SocketAddr> {
        self.stream.peer_addr().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Message, OpCode};
    use tokio::net::TcpListener;

    async fn pair() -> (Connection, Connection) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, (server, _)) =
            tokio::join!(TcpStream::connect(addr), async { listener.accept().await.unwrap() });
        (
            Connection::from_stream(client.unwrap()),
            Connection::from_stream(server),
        )
    }

    #[tokio::test]
    async fn test_frame_round_trip() {
        let (mut client, mut server) = pair().await;

        let mut message = Message::new(OpCode::KvPut);
        message.force_safety(skiff_types::Safety::Network);
        message.append_str("ns");
        message.add_operation(0);
        message.append_str("key-a");
        message.append_4(3);
        message.append_n(&[1, 2, 3]);
        message.add_operation(0);
        message.append_str("key-b");
        message.append_4(0);
        message.send(&mut client).await.unwrap();

        let mut received = Message::receive(&mut server).await.unwrap();
        assert_eq!(received.opcode(), Some(OpCode::KvPut));
        assert_eq!(received.count(), 2);
        assert!(received.wants_reply());
        assert_eq!(received.get_str().unwrap(), "ns");
        assert_eq!(received.get_str().unwrap(), "key-a");
        let len = received.get_4().unwrap();
        assert_eq!(received.get_n(len as usize).unwrap(), &[1, 2, 3]);
        assert_eq!(received.get_str().unwrap(), "key-b");
        assert_eq!(received.get_4().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_bulk_regions_follow_body() {
        let (mut client, mut server) = pair().await;

        let mut message = Message::new(OpCode::ObjectWrite);
        message.append_str("ns");
        message.append_str("obj");
        message.add_operation(16);
        message.append_8(4);
        message.append_8(0);
        message.add_send(bytes::Bytes::from_static(b"abcd"));
        message.add_operation(16);
        message.append_8(2);
        message.append_8(4);
        message.add_send(bytes::Bytes::from_static(b"ef"));
        message.send(&mut client).await.unwrap();

        let mut received = Message::receive(&mut server).await.unwrap();
        assert_eq!(received.get_str().unwrap(), "ns");
        assert_eq!(received.get_str().unwrap(), "obj");

        // Bulk bytes arrive on the stream after the body, in append order.
        let mut total = 0;
        let mut payload = Vec::new();
        for _ in 0..received.count() {
            let length = received.get_8().unwrap();
            let _offset = received.get_8().unwrap();
            let mut buf = vec![0u8; length as usize];
            server.read_exact(&mut buf).await.unwrap();
            total += length;
            payload.extend_from_slice(&buf);
        }
        assert_eq!(total, 6);
        assert_eq!(payload, b"abcdef");
    }

    #[tokio::test]
    async fn test_bad_magic_is_rejected() {
        let (mut client, mut server) = pair().await;
        client.write_all(b"JUNKJUNKJUNKJUNKJUNK").await.unwrap();

        match Message::receive(&mut server).await {
            Err(ProtoError::BadMagic { found }) => assert_eq!(&found, b"JUNK"),
            other => panic!("expected BadMagic, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_clean_close_reports_closed() {
        let (client, mut server) = pair().await;
        drop(client);

        let err = Message::receive(&mut server).await.unwrap_err();
        assert!(err.is_closed(), "expected clean close, got {err:?}");
        assert!(server.is_broken());
    }

    #[tokio::test]
    async fn test_reply_carries_request_op() {
        let (mut client, mut server) = pair().await;

        let mut request = Message::new(OpCode::ObjectStatus);
        request.append_str("ns");
        request.add_operation(0);
        request.append_str("obj");
        request.send(&mut client).await.unwrap();

        let received = Message::receive(&mut server).await.unwrap();
        let mut reply = Message::reply_to(&received);
        reply.add_operation(16);
        reply.append_8(1234);
        reply.append_8(42);
        reply.send(&mut server).await.unwrap();

        let mut reply = Message::receive(&mut client).await.unwrap();
        assert_eq!(reply.opcode(), Some(OpCode::ObjectStatus));
        assert_eq!(reply.count(), 1);
        assert_eq!(reply.get_8().unwrap(), 1234);
        assert_eq!(reply.get_8().unwrap(), 42);
    }
}
