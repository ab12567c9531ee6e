//! Message envelope and typed protocol messages.
//!
//! Every message on a connection starts with a one-byte `MessageType` tag.
//! Table updates are laid out by hand through `ByteWriter`; the small typed
//! control messages (kick, file requests, user commands) carry a JSON body.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::wire::{ByteReader, ByteWriter, WireError};

/// Message type discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// One piece of a split reliable message. See `wire::ChunkHeader`.
    Chunk = 1,
    /// StringTable delta for a named table.
    StringTableUpdate = 2,
    /// StringTable full snapshot for a named table.
    StringTableSnapshot = 3,
    /// NetworkTable changed/all slots for a named table.
    NetworkTableUpdate = 4,
    Kick = 5,
    /// RPC request: `u64 request_id` followed by an inner message.
    Request = 6,
    /// RPC response: `u64 request_id`, `i32 len`, `data`.
    Response = 7,
    UserCommand = 8,
    RequestFile = 9,
}

impl MessageType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Chunk),
            2 => Some(Self::StringTableUpdate),
            3 => Some(Self::StringTableSnapshot),
            4 => Some(Self::NetworkTableUpdate),
            5 => Some(Self::Kick),
            6 => Some(Self::Request),
            7 => Some(Self::Response),
            8 => Some(Self::UserCommand),
            9 => Some(Self::RequestFile),
            _ => None,
        }
    }
}

impl TryFrom<u8> for MessageType {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::from_u8(value).ok_or(WireError::UnknownMessageType(value))
    }
}

/// Split a received message into its tag and body.
pub fn split_tag(data: &[u8]) -> Result<(MessageType, &[u8]), WireError> {
    let (&tag, body) = data.split_first().ok_or(WireError::EmptyMessage)?;
    Ok((MessageType::try_from(tag)?, body))
}

/// Delivery flags for a send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct NetFlags(u8);

impl NetFlags {
    pub const UNRELIABLE: NetFlags = NetFlags(0);
    pub const RELIABLE: NetFlags = NetFlags(0x01);
    /// Skip Nagle-style batching in the transport.
    pub const NO_DELAY: NetFlags = NetFlags(0x02);

    pub fn is_reliable(self) -> bool {
        self.0 & Self::RELIABLE.0 != 0
    }

    pub fn contains(self, other: NetFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn bits(self) -> u8 {
        self.0
    }
}

impl std::ops::BitOr for NetFlags {
    type Output = NetFlags;

    fn bitor(self, rhs: NetFlags) -> NetFlags {
        NetFlags(self.0 | rhs.0)
    }
}

// ── Typed messages ────────────────────────────────────────────────────────────

/// A control message with a fixed tag and a JSON body.
pub trait NetMessage: Serialize + DeserializeOwned {
    const TYPE: MessageType;

    /// Write tag and body.
    fn encode(&self, w: &mut ByteWriter) -> Result<(), WireError> {
        let body = serde_json::to_vec(self).map_err(|e| WireError::Body(e.to_string()))?;
        w.write_u8(Self::TYPE as u8);
        w.write_raw(&body);
        Ok(())
    }

    /// Decode a body (the bytes after the tag).
    fn decode(body: &[u8]) -> Result<Self, WireError> {
        serde_json::from_slice(body).map_err(|e| WireError::Body(e.to_string()))
    }
}

/// Sent by the host; the receiving peer closes its own connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KickMessage {
    pub reason: String,
}

impl NetMessage for KickMessage {
    const TYPE: MessageType = MessageType::Kick;
}

/// Ask the host for the bytes of a replicated large file.
/// The response is the raw file; an empty response means "not found".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestFile {
    pub filename: String,
}

impl NetMessage for RequestFile {
    const TYPE: MessageType = MessageType::RequestFile;
}

/// One tick of client input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UserCommand {
    /// Monotonic per-client counter; wraps at 2^32.
    pub command_number: u32,
    /// Bitmask of held actions, one bit per registered action.
    pub actions: u64,
}

impl NetMessage for UserCommand {
    const TYPE: MessageType = MessageType::UserCommand;
}

// ── RPC envelope ──────────────────────────────────────────────────────────────

/// Wrap an already-encoded inner message in a request envelope.
pub fn encode_request(request_id: u64, inner: &[u8], w: &mut ByteWriter) {
    w.write_u8(MessageType::Request as u8);
    w.write_u64(request_id);
    w.write_raw(inner);
}

/// Split a request body into its id and inner message.
pub fn decode_request(body: &[u8]) -> Result<(u64, &[u8]), WireError> {
    let mut r = ByteReader::new(body);
    let id = r.read_u64()?;
    Ok((id, r.read_rest()))
}

pub fn encode_response(request_id: u64, data: &[u8], w: &mut ByteWriter) {
    w.write_u8(MessageType::Response as u8);
    w.write_u64(request_id);
    w.write_bytes(data);
}

pub fn decode_response(body: &[u8], max_bytes: usize) -> Result<(u64, bytes::Bytes), WireError> {
    let mut r = ByteReader::new(body);
    let id = r.read_u64()?;
    let data = r.read_bytes(max_bytes)?;
    Ok((id, data))
}

// ── Table envelopes ──────────────────────────────────────────────────────────

/// Start a table message: tag plus table name. The table body follows.
pub fn begin_table_message(kind: MessageType, table: &str) -> ByteWriter {
    let mut w = ByteWriter::new();
    w.write_u8(kind as u8);
    w.write_string(table);
    w
}
