//! Protocol error taxonomy.
//!
//! `Closed` is the one non-fault case: the peer went away at a frame
//! boundary or mid-frame. Everything else is either a malformed frame
//! (fatal to the connection, never retried) or a plain I/O failure.

use crate::event::ProtocolVersion;

#[derive(Debug, thiserror::Error)]
pub enum ProtoError {
    /// Zero-length or truncated read: the peer closed the socket.
    #[error("connection closed by peer")]
    Closed,

    #[error("unknown event tag: {0:#06x}")]
    BadTag(u16),

    #[error("frame of {0} bytes exceeds maximum")]
    Oversize(u32),

    #[error("protocol version mismatch: ours {ours}, theirs {theirs}")]
    VersionMismatch {
        ours: ProtocolVersion,
        theirs: ProtocolVersion,
    },

    #[error("payload decode failed: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    #[error("payload encode failed: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtoError {
    /// True when the condition means "peer gone", as opposed to
    /// "peer sent garbage".
    pub fn is_disconnect(&self) -> bool {
        matches!(self, ProtoError::Closed)
    }
}

/// Failure to hand an event to a connection's outbound queue.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    /// Close was requested; the event was not accepted.
    #[error("connection is closed, event not sent")]
    Closed,
}
