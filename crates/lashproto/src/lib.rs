//! lashproto - wire protocol and connection pair for the LASH session layer.
//!
//! Both the daemon and client processes link this crate: it defines the
//! [`CommEvent`] message family, the length-prefixed MsgPack framing, the
//! fixed 4-byte version handshake, and the per-socket reader/writer pair
//! that everything above builds on.
//!
//! ## Protocol shape
//!
//! A connection starts with the version exchange (see [`wire::handshake`]),
//! then the client sends `Connect` with its identity (UUID, class, project,
//! argv). From there traffic is opaque `Event` and `Config` frames in both
//! directions until either side sends `Close` or drops the socket.
//!
//! The daemon-to-loader control channel reuses the same framing but carries
//! only `Exec` events; see the daemon crate.

pub mod client;
pub mod conn;
pub mod error;
pub mod event;
pub mod wire;

pub use conn::{Connection, EventSender, Inbound};
pub use error::{ProtoError, SendError};
pub use event::{
    CommEvent, Config, ConnectParams, Event, EventKind, EventTag, ExecParams, ProtocolVersion,
    PROTOCOL_VERSION,
};
