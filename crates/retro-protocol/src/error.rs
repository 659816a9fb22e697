use thiserror::Error;

/// Wire-level protocol violations: malformed frames, oversized messages,
/// unrecognised packet types.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("packet too short: expected at least {expected} bytes, got {got}")]
    PacketTooShort { expected: usize, got: usize },

    #[error("unknown packet type: 0x{0:02x}")]
    UnknownPacketType(u8),

    #[error("frame too large: {0} bytes (max {MAX_FRAME_SIZE})")]
    FrameTooLarge(usize),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Size ceiling for a single framed payload. Generous enough for the
/// largest legitimate chat/file-control payload; guards against a
/// malicious or corrupt length prefix causing unbounded buffering.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Outcome of a deadline-bounded packet read: a timeout is a recoverable
/// signal distinct from an I/O error or a clean EOF.
#[derive(Debug, Error)]
pub enum RecvError {
    #[error("read deadline elapsed")]
    Timeout,

    #[error("connection closed")]
    Eof,

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
