//! Session protocol message family.
//!
//! Every message between a client and the daemon is one [`CommEvent`]: a
//! tagged union with exactly one active payload. The enum representation
//! makes the "one payload at a time, switching releases the old one"
//! invariant structural rather than something the code has to police.
//!
//! Payload ownership transfers out through the by-value `into_*` accessors;
//! after extraction the event no longer exists, so a payload can never be
//! freed twice.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ProtoError;

/// Two-part protocol version exchanged at handshake.
///
/// Version 1 predates the version field entirely and is rejected by never
/// completing the fixed-size exchange. Current is 2.0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProtocolVersion {
    pub major: u16,
    pub minor: u16,
}

/// The version this build speaks.
pub const PROTOCOL_VERSION: ProtocolVersion = ProtocolVersion { major: 2, minor: 0 };

impl ProtocolVersion {
    /// Encode as 4 bytes, both fields big-endian.
    pub fn to_bytes(self) -> [u8; 4] {
        let mut buf = [0u8; 4];
        buf[..2].copy_from_slice(&self.major.to_be_bytes());
        buf[2..].copy_from_slice(&self.minor.to_be_bytes());
        buf
    }

    pub fn from_bytes(buf: [u8; 4]) -> Self {
        Self {
            major: u16::from_be_bytes([buf[0], buf[1]]),
            minor: u16::from_be_bytes([buf[2], buf[3]]),
        }
    }
}

impl std::fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Type tags on the wire (2 bytes, big-endian), one per [`CommEvent`] variant.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventTag {
    Connect = 0x0001,
    IfaceConnect = 0x0002,
    Event = 0x0003,
    Config = 0x0004,
    Exec = 0x0005,
    Ping = 0x0006,
    Pong = 0x0007,
    Close = 0x0008,
    ProtocolMismatch = 0x0009,
}

impl EventTag {
    pub fn from_u16(value: u16) -> Result<Self, ProtoError> {
        match value {
            0x0001 => Ok(EventTag::Connect),
            0x0002 => Ok(EventTag::IfaceConnect),
            0x0003 => Ok(EventTag::Event),
            0x0004 => Ok(EventTag::Config),
            0x0005 => Ok(EventTag::Exec),
            0x0006 => Ok(EventTag::Ping),
            0x0007 => Ok(EventTag::Pong),
            0x0008 => Ok(EventTag::Close),
            0x0009 => Ok(EventTag::ProtocolMismatch),
            other => Err(ProtoError::BadTag(other)),
        }
    }

    pub fn to_u16(self) -> u16 {
        self as u16
    }
}

/// One-shot handshake payload, consumed when the daemon registers the client.
///
/// Only the fields copied into the daemon's Client record survive the
/// handshake; the params themselves are not retained.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectParams {
    pub protocol_version: ProtocolVersion,
    pub flags: u32,
    pub project: String,
    pub working_dir: String,
    pub class: String,
    pub id: Uuid,
    pub argv: Vec<String>,
}

/// Relaunch payload handed to the loader helper (daemon -> helper only).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecParams {
    pub working_dir: String,
    /// Address the relaunched client should reconnect to.
    pub server: String,
    pub project: String,
    pub argv: Vec<String>,
    pub id: Uuid,
}

/// Session event kinds carried by [`Event`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    Save,
    Restore,
    Quit,
    ProjectAdd,
    ProjectRemove,
    ProjectDir,
    ProjectName,
    ClientName,
    Percentage,
}

/// A session event. The meaning of `string` depends on `kind`
/// (new project name for `ProjectName`, completion percentage for
/// `Percentage`, and so on).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub kind: EventKind,
    pub string: String,
    pub project: String,
    /// Nil when the event is not specific to one client.
    pub client_id: Uuid,
}

impl Event {
    pub fn new(kind: EventKind, project: impl Into<String>) -> Self {
        Self {
            kind,
            string: String::new(),
            project: project.into(),
            client_id: Uuid::nil(),
        }
    }

    pub fn with_string(mut self, string: impl Into<String>) -> Self {
        self.string = string.into();
        self
    }

    pub fn with_client(mut self, client_id: Uuid) -> Self {
        self.client_id = client_id;
        self
    }
}

/// A key/value setting. The value is an opaque byte buffer; the daemon
/// stores and replays configs without interpreting them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    pub key: String,
    #[serde(with = "serde_bytes")]
    pub value: Vec<u8>,
}

impl Config {
    pub fn new(key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn value_size(&self) -> usize {
        self.value.len()
    }
}

/// The single wire-level envelope exchanged between client and daemon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CommEvent {
    /// Client handshake after the version exchange.
    Connect(ConnectParams),
    /// Handshake from a GUI/interface peer rather than a managed client.
    IfaceConnect,
    /// Session event (save/restore/quit/...).
    Event(Event),
    /// Opaque key/value setting.
    Config(Config),
    /// Relaunch request (daemon -> loader control channel only).
    Exec(ExecParams),
    Ping,
    Pong,
    /// Graceful shutdown of the connection.
    Close,
    /// Sent by the newer side on version skew, then the socket closes.
    ProtocolMismatch(ProtocolVersion),
}

impl CommEvent {
    pub fn tag(&self) -> EventTag {
        match self {
            CommEvent::Connect(_) => EventTag::Connect,
            CommEvent::IfaceConnect => EventTag::IfaceConnect,
            CommEvent::Event(_) => EventTag::Event,
            CommEvent::Config(_) => EventTag::Config,
            CommEvent::Exec(_) => EventTag::Exec,
            CommEvent::Ping => EventTag::Ping,
            CommEvent::Pong => EventTag::Pong,
            CommEvent::Close => EventTag::Close,
            CommEvent::ProtocolMismatch(_) => EventTag::ProtocolMismatch,
        }
    }

    /// Take the event payload, consuming the envelope.
    pub fn into_event(self) -> Option<Event> {
        match self {
            CommEvent::Event(e) => Some(e),
            _ => None,
        }
    }

    /// Take the config payload, consuming the envelope.
    pub fn into_config(self) -> Option<Config> {
        match self {
            CommEvent::Config(c) => Some(c),
            _ => None,
        }
    }

    /// Take the connect params, consuming the envelope.
    pub fn into_connect(self) -> Option<ConnectParams> {
        match self {
            CommEvent::Connect(p) => Some(p),
            _ => None,
        }
    }

    /// Take the exec params, consuming the envelope.
    pub fn into_exec(self) -> Option<ExecParams> {
        match self {
            CommEvent::Exec(p) => Some(p),
            _ => None,
        }
    }
}
