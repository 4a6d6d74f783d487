//! Frame building and parsing.

use bytes::{BufMut, Bytes, BytesMut};
use skiff_types::{Safety, Semantics};

use crate::wire::Connection;
use crate::{HEADER_LEN, MAGIC, MAX_BODY_LEN, OpCode, ProtoError};

/// Flag bit: the sender expects a reply once the server has received the
/// frame.
pub const SAFETY_NETWORK: u32 = 0x1;

/// Flag bit: the sender expects a reply only after the server has durably
/// persisted the contained operations. Always set together with
/// [`SAFETY_NETWORK`], since storage safety implies a reply as well.
pub const SAFETY_STORAGE: u32 = 0x2;

/// A protocol frame, either under construction (builder methods) or received
/// from a peer (cursor methods).
///
/// Sub-operation payloads are appended in order and decoded in the same
/// order on the receiving side. [`Message::get_n`] borrows from the frame
/// body, so decoded slices live as long as the message.
#[derive(Debug)]
pub struct Message {
    op: u32,
    flags: u32,
    count: u32,
    body: BytesMut,
    /// Out-of-band bulk regions, written after the body in append order.
    send_list: Vec<Bytes>,
    /// Read cursor into `body` for received frames.
    cursor: usize,
}

impl Message {
    /// Start building a frame for the given operation.
    pub fn new(op: OpCode) -> Self {
        Self::with_capacity(op, 0)
    }

    /// Start building a frame with a body capacity hint.
    pub fn with_capacity(op: OpCode, capacity: usize) -> Self {
        Self {
            op: op as u32,
            flags: 0,
            count: 0,
            body: BytesMut::with_capacity(capacity),
            send_list: Vec::new(),
            cursor: 0,
        }
    }

    /// The raw operation code from the header.
    pub fn op(&self) -> u32 {
        self.op
    }

    /// The decoded operation code, or `None` if this peer does not know it.
    pub fn opcode(&self) -> Option<OpCode> {
        OpCode::from_raw(self.op)
    }

    pub fn flags(&self) -> u32 {
        self.flags
    }

    /// Number of sub-operations in the frame.
    pub fn count(&self) -> u32 {
        self.count
    }

    /// Whether the flags request a reply at network safety or stronger.
    pub fn wants_reply(&self) -> bool {
        self.flags & SAFETY_NETWORK != 0
    }

    /// Whether the flags request durable persistence before the reply.
    pub fn wants_storage(&self) -> bool {
        self.flags & SAFETY_STORAGE != 0
    }

    /// Set the safety flags from a semantics bundle.
    pub fn set_safety(&mut self, semantics: &Semantics) {
        self.flags = match semantics.safety() {
            Safety::None => 0,
            Safety::Network => SAFETY_NETWORK,
            Safety::Storage => SAFETY_NETWORK | SAFETY_STORAGE,
        };
    }

    /// Raise the safety flags to at least the given level, keeping any
    /// stronger level already set.
    pub fn force_safety(&mut self, safety: Safety) {
        match safety {
            Safety::None => {}
            Safety::Network => self.flags |= SAFETY_NETWORK,
            Safety::Storage => self.flags |= SAFETY_NETWORK | SAFETY_STORAGE,
        }
    }

    // -------------------------------------------------------------------
    // Builder side
    // -------------------------------------------------------------------

    /// Open a new sub-operation with a body size hint and bump the count.
    ///
    /// The hint only pre-reserves buffer space; the actual sub-operation
    /// payload is whatever is appended before the next `add_operation`.
    pub fn add_operation(&mut self, reserve: usize) {
        self.body.reserve(reserve);
        self.count += 1;
    }

    /// Append raw bytes to the current sub-operation payload.
    pub fn append_n(&mut self, bytes: &[u8]) {
        self.body.put_slice(bytes);
    }

    /// Append a `u32` in wire byte order.
    pub fn append_4(&mut self, value: u32) {
        self.body.put_u32_le(value);
    }

    /// Append a `u64` in wire byte order.
    pub fn append_8(&mut self, value: u64) {
        self.body.put_u64_le(value);
    }

    /// Append a null-terminated string.
    pub fn append_str(&mut self, value: &str) {
        self.body.put_slice(value.as_bytes());
        self.body.put_u8(0);
    }

    /// Attach an out-of-band bulk region, sent after the frame body.
    ///
    /// Used for write payloads; the region does not count against the
    /// header's `length` field.
    pub fn add_send(&mut self, data: Bytes) {
        self.send_list.push(data);
    }

    /// Write the frame (header, body, attached bulk regions) to the
    /// connection. The caller must be the only writer on the stream.
    pub async fn send(&self, conn: &mut Connection) -> Result<(), ProtoError> {
        let mut frame = BytesMut::with_capacity(HEADER_LEN + self.body.len());
        frame.put_slice(&MAGIC);
        frame.put_u32_le(self.op);
        frame.put_u32_le(self.flags);
        frame.put_u32_le(self.body.len() as u32);
        frame.put_u32_le(self.count);
        frame.put_slice(&self.body);
        conn.write_all(&frame).await?;

        for region in &self.send_list {
            conn.write_all(region).await?;
        }

        Ok(())
    }

    // -------------------------------------------------------------------
    // Receiver side
    // -------------------------------------------------------------------

    /// Read one frame (header and body) from the connection.
    ///
    /// Validates the magic and the body length bound. Bulk payload that
    /// follows a frame (read replies) is not consumed here; the caller reads
    /// it from the connection guided by the decoded sub-operations.
    pub async fn receive(conn: &mut Connection) -> Result<Self, ProtoError> {
        let mut header = [0u8; HEADER_LEN];
        conn.read_exact(&mut header).await?;

        let magic: [u8; 4] = header[0..4].try_into().expect("4 bytes");
        if magic != MAGIC {
            return Err(ProtoError::BadMagic { found: magic });
        }

        let op = u32::from_le_bytes(header[4..8].try_into().expect("4 bytes"));
        let flags = u32::from_le_bytes(header[8..12].try_into().expect("4 bytes"));
        let length = u32::from_le_bytes(header[12..16].try_into().expect("4 bytes")) as usize;
        let count = u32::from_le_bytes(header[16..20].try_into().expect("4 bytes"));

        if length > MAX_BODY_LEN {
            return Err(ProtoError::BodyTooLarge {
                len: length,
                max: MAX_BODY_LEN,
            });
        }

        let mut body = BytesMut::zeroed(length);
        conn.read_exact(&mut body).await?;

        Ok(Self {
            op,
            flags,
            count,
            body,
            send_list: Vec::new(),
            cursor: 0,
        })
    }

    /// Start building a reply frame for a received request.
    ///
    /// The reply carries the request's operation code; its count grows with
    /// `add_operation` as per-sub-operation results are appended.
    pub fn reply_to(request: &Message) -> Self {
        Self {
            op: request.op,
            flags: 0,
            count: 0,
            body: BytesMut::new(),
            send_list: Vec::new(),
            cursor: 0,
        }
    }

    /// Read a `u32` at the cursor.
    pub fn get_4(&mut self) -> Result<u32, ProtoError> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes(bytes.try_into().expect("4 bytes")))
    }

    /// Read a `u64` at the cursor.
    pub fn get_8(&mut self) -> Result<u64, ProtoError> {
        let bytes = self.take(8)?;
        Ok(u64::from_le_bytes(bytes.try_into().expect("8 bytes")))
    }

    /// Read `len` raw bytes at the cursor. The returned slice borrows from
    /// the frame body.
    pub fn get_n(&mut self, len: usize) -> Result<&[u8], ProtoError> {
        self.take(len)
    }

    /// Read a null-terminated string at the cursor, advancing past the
    /// terminator.
    pub fn get_str(&mut self) -> Result<&str, ProtoError> {
        let start = self.cursor;
        let rest = &self.body[start..];
        let nul = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or(ProtoError::UnterminatedString { offset: start })?;
        self.cursor = start + nul + 1;
        Ok(std::str::from_utf8(&self.body[start..start + nul])?)
    }

    fn take(&mut self, len: usize) -> Result<&[u8], ProtoError> {
        if self.body.len() - self.cursor < len {
            return Err(ProtoError::Truncated {
                offset: self.cursor,
                needed: len - (self.body.len() - self.cursor),
            });
        }
        let slice = &self.body[self.cursor..self.cursor + len];
        self.cursor += len;
        Ok(slice)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skiff_types::Template;

    #[test]
    fn test_safety_flags_from_semantics() {
        let mut message = Message::new(OpCode::KvPut);
        message.set_safety(&Semantics::default().with_safety(Safety::None));
        assert_eq!(message.flags(), 0);
        assert!(!message.wants_reply());

        message.set_safety(&Semantics::default().with_safety(Safety::Network));
        assert_eq!(message.flags(), SAFETY_NETWORK);
        assert!(message.wants_reply());
        assert!(!message.wants_storage());

        message.set_safety(&Semantics::default().with_safety(Safety::Storage));
        assert_eq!(message.flags(), SAFETY_NETWORK | SAFETY_STORAGE);
        assert!(message.wants_reply());
        assert!(message.wants_storage());
    }

    #[test]
    fn test_force_safety_only_raises() {
        let mut message = Message::new(OpCode::ObjectCreate);
        message.set_safety(&Semantics::from_template(Template::TemporaryLocal));
        assert_eq!(message.flags(), 0);

        message.force_safety(Safety::Network);
        assert!(message.wants_reply());

        // Forcing network on a storage-safety message keeps storage.
        let mut message = Message::new(OpCode::ObjectCreate);
        message.set_safety(&Semantics::default().with_safety(Safety::Storage));
        message.force_safety(Safety::Network);
        assert!(message.wants_storage());
    }

    #[test]
    fn test_add_operation_increments_count() {
        let mut message = Message::new(OpCode::KvDelete);
        assert_eq!(message.count(), 0);
        message.add_operation(4);
        message.append_str("a");
        message.add_operation(4);
        message.append_str("b");
        assert_eq!(message.count(), 2);
    }

    #[test]
    fn test_cursor_reads_in_append_order() {
        let mut message = Message::new(OpCode::ObjectStatus);
        message.append_str("namespace");
        message.add_operation(0);
        message.append_4(7);
        message.append_8(u64::MAX - 1);
        message.append_n(&[1, 2, 3]);

        // Cursor reads over a locally built body mirror the peer's view.
        assert_eq!(message.get_str().unwrap(), "namespace");
        assert_eq!(message.get_4().unwrap(), 7);
        assert_eq!(message.get_8().unwrap(), u64::MAX - 1);
        assert_eq!(message.get_n(3).unwrap(), &[1, 2, 3]);
        assert!(matches!(
            message.get_4(),
            Err(ProtoError::Truncated { .. })
        ));
    }

    #[test]
    fn test_get_str_unterminated() {
        let mut message = Message::new(OpCode::KvGet);
        message.append_n(b"no-terminator");
        assert!(matches!(
            message.get_str(),
            Err(ProtoError::UnterminatedString { .. })
        ));
    }
}
