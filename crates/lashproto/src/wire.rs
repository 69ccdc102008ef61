//! Wire framing and version handshake.
//!
//! ## Frame format
//!
//! ```text
//! 4 bytes  frame length (big-endian u32, counts tag + payload)
//! 2 bytes  event tag (big-endian u16)
//! N bytes  MsgPack payload (empty for tag-only events)
//! ```
//!
//! One event per logical send. Frames are capped at [`MAX_FRAME_SIZE`] to
//! bound memory on a hostile or corrupted peer.
//!
//! ## Handshake
//!
//! The first bytes on any new connection are each side's 4-byte protocol
//! version. On mismatch the side that is ahead sends
//! [`CommEvent::ProtocolMismatch`] with its own version and both sides close
//! the socket. There is no negotiation or fallback; version-1 peers never
//! send the field at all and fail the fixed-size exchange.

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::ProtoError;
use crate::event::{
    CommEvent, Config, ConnectParams, Event, EventTag, ExecParams, ProtocolVersion,
    PROTOCOL_VERSION,
};

/// Maximum frame length (tag + payload). 16 MiB.
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Encode one event into a complete frame (length word included).
pub fn encode(event: &CommEvent) -> Result<Bytes, ProtoError> {
    let payload = match event {
        CommEvent::Connect(p) => rmp_serde::to_vec(p)?,
        CommEvent::Event(e) => rmp_serde::to_vec(e)?,
        CommEvent::Config(c) => rmp_serde::to_vec(c)?,
        CommEvent::Exec(p) => rmp_serde::to_vec(p)?,
        CommEvent::ProtocolMismatch(v) => rmp_serde::to_vec(v)?,
        CommEvent::IfaceConnect | CommEvent::Ping | CommEvent::Pong | CommEvent::Close => {
            Vec::new()
        }
    };

    let body_len = 2 + payload.len() as u32;
    let mut buf = BytesMut::with_capacity(4 + body_len as usize);
    buf.put_u32(body_len);
    buf.put_u16(event.tag().to_u16());
    buf.put_slice(&payload);
    Ok(buf.freeze())
}

/// Decode one complete frame (length word included) back into an event.
pub fn decode(frame: &[u8]) -> Result<CommEvent, ProtoError> {
    if frame.len() < 6 {
        return Err(ProtoError::Closed);
    }
    let body_len = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]);
    if body_len as usize != frame.len() - 4 {
        return Err(ProtoError::Closed);
    }
    decode_body(&frame[4..])
}

/// Decode a frame body (tag + payload, length word already consumed).
fn decode_body(body: &[u8]) -> Result<CommEvent, ProtoError> {
    let tag = EventTag::from_u16(u16::from_be_bytes([body[0], body[1]]))?;
    let payload = &body[2..];

    let event = match tag {
        EventTag::Connect => CommEvent::Connect(rmp_serde::from_slice::<ConnectParams>(payload)?),
        EventTag::IfaceConnect => CommEvent::IfaceConnect,
        EventTag::Event => CommEvent::Event(rmp_serde::from_slice::<Event>(payload)?),
        EventTag::Config => CommEvent::Config(rmp_serde::from_slice::<Config>(payload)?),
        EventTag::Exec => CommEvent::Exec(rmp_serde::from_slice::<ExecParams>(payload)?),
        EventTag::Ping => CommEvent::Ping,
        EventTag::Pong => CommEvent::Pong,
        EventTag::Close => CommEvent::Close,
        EventTag::ProtocolMismatch => {
            CommEvent::ProtocolMismatch(rmp_serde::from_slice::<ProtocolVersion>(payload)?)
        }
    };
    Ok(event)
}

/// Read one event from the stream.
///
/// A zero-length or truncated read maps to [`ProtoError::Closed`] — the peer
/// went away — which is distinct from a malformed frame.
pub async fn read_event<R: AsyncRead + Unpin>(reader: &mut R) -> Result<CommEvent, ProtoError> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await.map_err(map_eof)?;
    let body_len = u32::from_be_bytes(len_buf);

    if body_len > MAX_FRAME_SIZE {
        return Err(ProtoError::Oversize(body_len));
    }
    if body_len < 2 {
        // A frame without even a tag is not something any peer sends.
        return Err(ProtoError::BadTag(0));
    }

    let mut body = vec![0u8; body_len as usize];
    reader.read_exact(&mut body).await.map_err(map_eof)?;
    decode_body(&body)
}

/// Write one event to the stream, retrying until the frame is fully sent.
pub async fn write_event<W: AsyncWrite + Unpin>(
    writer: &mut W,
    event: &CommEvent,
) -> Result<(), ProtoError> {
    let frame = encode(event)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Perform the version exchange on a fresh connection.
///
/// Returns the peer's version on success. On skew, the side that is ahead
/// sends `ProtocolMismatch(its_version)`; the side that is behind reads it so
/// the operator can see which version the peer wanted. Either way the caller
/// must close the socket.
pub async fn handshake<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
) -> Result<ProtocolVersion, ProtoError> {
    handshake_as(stream, PROTOCOL_VERSION).await
}

/// Version exchange with an explicit local version (tests exercise skew).
pub async fn handshake_as<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    ours: ProtocolVersion,
) -> Result<ProtocolVersion, ProtoError> {
    stream.write_all(&ours.to_bytes()).await?;
    stream.flush().await?;

    let mut buf = [0u8; 4];
    stream.read_exact(&mut buf).await.map_err(map_eof)?;
    let theirs = ProtocolVersion::from_bytes(buf);

    if theirs == ours {
        return Ok(theirs);
    }

    if ours > theirs {
        // We are ahead: tell the peer what we speak, then bail.
        write_event(stream, &CommEvent::ProtocolMismatch(ours)).await?;
    } else {
        // We are behind: the peer reports its version before closing.
        if let Ok(CommEvent::ProtocolMismatch(server)) = read_event(stream).await {
            return Err(ProtoError::VersionMismatch {
                ours,
                theirs: server,
            });
        }
    }

    Err(ProtoError::VersionMismatch { ours, theirs })
}

fn map_eof(err: std::io::Error) -> ProtoError {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        ProtoError::Closed
    } else {
        ProtoError::Io(err)
    }
}
