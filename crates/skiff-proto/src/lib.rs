//! Framed request/reply protocol between skiff clients and servers.
//!
//! Every exchange is a length-prefixed frame with a fixed header followed by
//! a number of sub-operation payloads:
//!
//! ```text
//! [magic:4][op:4][flags:4][length:4][count:4] <body: length bytes> <bulk...>
//! ```
//!
//! All integers are little-endian. Write payloads travel as out-of-band bulk
//! regions *after* the frame body; read replies stream their bulk bytes on
//! the connection directly after each reply frame. See [`Message`] for the
//! builder/cursor API and [`Connection`] for the transport.

mod error;
mod message;
mod wire;

pub use error::ProtoError;
pub use message::{Message, SAFETY_NETWORK, SAFETY_STORAGE};
pub use wire::Connection;

/// Frame magic, first four bytes of every frame.
pub const MAGIC: [u8; 4] = *b"SKF1";

/// Fixed frame header size in bytes.
pub const HEADER_LEN: usize = 20;

/// Upper bound for a frame body. Bulk regions are not counted against this;
/// they are bounded per sub-operation by the declared lengths.
pub const MAX_BODY_LEN: usize = 64 * 1024 * 1024;

/// Operation codes carried in the frame header.
///
/// The numeric values are part of the wire protocol and must stay stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum OpCode {
    None = 0,
    ObjectCreate = 1,
    ObjectDelete = 2,
    ObjectOpen = 3,
    ObjectClose = 4,
    ObjectStatus = 5,
    ObjectSync = 6,
    ObjectRead = 7,
    ObjectWrite = 8,
    KvPut = 9,
    KvDelete = 10,
    KvGet = 11,
}

impl OpCode {
    /// Decode a raw opcode, returning `None` for values this peer does not
    /// know. Unknown opcodes are tolerated at the dispatch layer rather than
    /// rejected at the framing layer.
    pub fn from_raw(raw: u32) -> Option<Self> {
        Some(match raw {
            0 => Self::None,
            1 => Self::ObjectCreate,
            2 => Self::ObjectDelete,
            3 => Self::ObjectOpen,
            4 => Self::ObjectClose,
            5 => Self::ObjectStatus,
            6 => Self::ObjectSync,
            7 => Self::ObjectRead,
            8 => Self::ObjectWrite,
            9 => Self::KvPut,
            10 => Self::KvDelete,
            11 => Self::KvGet,
            _ => return None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_values_are_stable() {
        assert_eq!(OpCode::None as u32, 0);
        assert_eq!(OpCode::ObjectCreate as u32, 1);
        assert_eq!(OpCode::ObjectDelete as u32, 2);
        assert_eq!(OpCode::ObjectOpen as u32, 3);
        assert_eq!(OpCode::ObjectClose as u32, 4);
        assert_eq!(OpCode::ObjectStatus as u32, 5);
        assert_eq!(OpCode::ObjectSync as u32, 6);
        assert_eq!(OpCode::ObjectRead as u32, 7);
        assert_eq!(OpCode::ObjectWrite as u32, 8);
        assert_eq!(OpCode::KvPut as u32, 9);
        assert_eq!(OpCode::KvDelete as u32, 10);
        assert_eq!(OpCode::KvGet as u32, 11);
    }

    #[test]
    fn test_opcode_round_trip() {
        for raw in 0..=11u32 {
            let op = OpCode::from_raw(raw).unwrap();
            assert_eq!(op as u32, raw);
        }
        assert_eq!(OpCode::from_raw(12), None);
        assert_eq!(OpCode::from_raw(u32::MAX), None);
    }
}
