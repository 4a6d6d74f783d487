//! Error types for the wire protocol.

/// Errors that can occur while framing, sending, or receiving messages.
#[derive(Debug, thiserror::Error)]
pub enum ProtoError {
    /// An I/O error on the underlying connection.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer sent a frame that does not start with the protocol magic.
    #[error("bad frame magic: {found:02x?}")]
    BadMagic {
        /// The four bytes found where the magic was expected.
        found: [u8; 4],
    },

    /// The declared body length exceeds the protocol maximum.
    #[error("frame body too large: {len} bytes (max {max})")]
    BodyTooLarge { len: usize, max: usize },

    /// A cursor read ran past the end of the frame body.
    #[error("truncated frame: needed {needed} more bytes at offset {offset}")]
    Truncated { offset: usize, needed: usize },

    /// A string field was not terminated inside the frame body.
    #[error("unterminated string at offset {offset}")]
    UnterminatedString { offset: usize },

    /// A string field contained invalid UTF-8.
    #[error("invalid utf-8 in string field: {0}")]
    InvalidUtf8(#[from] std::str::Utf8Error),

    /// Failed to connect to a remote server.
    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

impl ProtoError {
    /// Whether this error indicates the peer closed the connection cleanly
    /// (EOF at a frame boundary) rather than a protocol violation.
    pub fn is_closed(&self) -> bool {
        matches!(
            self,
            ProtoError::Io(e) if e.kind() == std::io::ErrorKind::UnexpectedEof
        )
    }
}
