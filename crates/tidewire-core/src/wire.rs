//! Tidewire wire format — the byte stream every replicated structure is
//! written through, plus the chunk header used to split large messages.
//!
//! All multi-byte integers written by `ByteWriter` are little-endian.
//! Strings and byte arrays carry an `i32` length prefix; a string length of
//! `-1` encodes a null string, which the StringTable snapshot uses as its
//! terminator. Changing anything here is a protocol break for every peer.

use bytes::Bytes;
use static_assertions::assert_eq_size;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

// ── Constants ─────────────────────────────────────────────────────────────────

/// Largest payload sent without chunking. Reliable payloads at or above
/// this size are split into chunks of at most this many bytes.
pub const MAX_UNSPLIT_PAYLOAD: usize = 128 * 1024;

/// Upper bound on a single StringTable snapshot entry.
/// Bounds the allocation a malicious or corrupt snapshot can force.
pub const MAX_SNAPSHOT_ENTRY: usize = 8 * 1024 * 1024;

/// Length prefix value that encodes a null string.
pub const NULL_LENGTH: i32 = -1;

// ── Chunk Header ─────────────────────────────────────────────────────────────

/// Prefix of every chunk of a split message, following the
/// `MessageType::Chunk` tag byte.
///
/// Fields are host-endian, as laid out in memory.
/// Wire size: 8 bytes.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct ChunkHeader {
    /// Zero-based position of this chunk.
    pub chunk_index: u32,

    /// Total number of chunks making up the message.
    /// Always `ceil(total_len / MAX_UNSPLIT_PAYLOAD)` for the sender's limit.
    pub chunk_count: u32,
}

// Compile-time size guard. If this fails, the wire format has silently changed.
assert_eq_size!(ChunkHeader, [u8; 8]);

/// Wire size of `ChunkHeader`.
pub const CHUNK_HEADER_LEN: usize = std::mem::size_of::<ChunkHeader>();

impl ChunkHeader {
    /// Read a header from the front of `data`, returning it and the remainder.
    pub fn split(data: &[u8]) -> Result<(ChunkHeader, &[u8]), WireError> {
        if data.len() < CHUNK_HEADER_LEN {
            return Err(WireError::UnexpectedEof {
                needed: CHUNK_HEADER_LEN,
                remaining: data.len(),
            });
        }
        let header = ChunkHeader::read_from_prefix(data).ok_or(WireError::UnexpectedEof {
            needed: CHUNK_HEADER_LEN,
            remaining: data.len(),
        })?;
        Ok((header, &data[CHUNK_HEADER_LEN..]))
    }
}

// ── Writer ───────────────────────────────────────────────────────────────────

/// Append-only binary writer.
#[derive(Debug, Default, Clone)]
pub struct ByteWriter {
    buf: Vec<u8>,
}

impl ByteWriter {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    pub fn write_bool(&mut self, value: bool) {
        self.buf.push(value as u8);
    }

    pub fn write_u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_i32(&mut self, value: i32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_u64(&mut self, value: u64) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    /// Write a length for a collection. Lengths beyond `i32::MAX` are a
    /// caller bug; tables never get close.
    pub fn write_len(&mut self, len: usize) {
        self.write_i32(i32::try_from(len).unwrap_or(i32::MAX));
    }

    /// Length-prefixed UTF-8 string.
    pub fn write_string(&mut self, value: &str) {
        self.write_len(value.len());
        self.buf.extend_from_slice(value.as_bytes());
    }

    /// The null string: a `-1` length with no body.
    pub fn write_null_string(&mut self) {
        self.write_i32(NULL_LENGTH);
    }

    /// Length-prefixed byte array. A zero-length array is a real value.
    pub fn write_bytes(&mut self, data: &[u8]) {
        self.write_len(data.len());
        self.buf.extend_from_slice(data);
    }

    /// Raw bytes with no prefix.
    pub fn write_raw(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> Bytes {
        Bytes::from(self.buf)
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buf
    }
}

// ── Reader ───────────────────────────────────────────────────────────────────

/// Cursor over a received byte slice.
///
/// Every read is bounds-checked; a short buffer is a `WireError`, never a
/// panic, since input comes straight off the network.
#[derive(Debug, Clone)]
pub struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn read_raw(&mut self, len: usize) -> Result<&'a [u8], WireError> {
        if self.remaining() < len {
            return Err(WireError::UnexpectedEof {
                needed: len,
                remaining: self.remaining(),
            });
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    /// Everything not yet consumed.
    pub fn read_rest(&mut self) -> &'a [u8] {
        let slice = &self.data[self.pos..];
        self.pos = self.data.len();
        slice
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N], WireError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read_raw(N)?);
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8, WireError> {
        Ok(self.read_array::<1>()?[0])
    }

    pub fn read_bool(&mut self) -> Result<bool, WireError> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_u32(&mut self) -> Result<u32, WireError> {
        Ok(u32::from_le_bytes(self.read_array()?))
    }

    pub fn read_i32(&mut self) -> Result<i32, WireError> {
        Ok(i32::from_le_bytes(self.read_array()?))
    }

    pub fn read_u64(&mut self) -> Result<u64, WireError> {
        Ok(u64::from_le_bytes(self.read_array()?))
    }

    /// Read a collection count. Negative counts are rejected.
    pub fn read_len(&mut self) -> Result<usize, WireError> {
        let len = self.read_i32()?;
        usize::try_from(len).map_err(|_| WireError::NegativeLength(len))
    }

    /// Read a string that may be null (`-1` length).
    pub fn read_optional_string(&mut self) -> Result<Option<String>, WireError> {
        let len = self.read_i32()?;
        if len == NULL_LENGTH {
            return Ok(None);
        }
        let len = usize::try_from(len).map_err(|_| WireError::NegativeLength(len))?;
        let raw = self.read_raw(len)?;
        let s = std::str::from_utf8(raw).map_err(|_| WireError::InvalidUtf8)?;
        Ok(Some(s.to_owned()))
    }

    /// Read a non-null string.
    pub fn read_string(&mut self) -> Result<String, WireError> {
        self.read_optional_string()?.ok_or(WireError::UnexpectedNull)
    }

    /// Read a length-prefixed byte array of at most `max_bytes`.
    ///
    /// The limit is checked before anything is copied, so a hostile length
    /// prefix can't force a large allocation.
    pub fn read_bytes(&mut self, max_bytes: usize) -> Result<Bytes, WireError> {
        let len = self.read_len()?;
        if len > max_bytes {
            return Err(WireError::LengthExceeded { len, max: max_bytes });
        }
        Ok(Bytes::copy_from_slice(self.read_raw(len)?))
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can arise when interpreting wire-format data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("unexpected end of stream: needed {needed} bytes, {remaining} remaining")]
    UnexpectedEof { needed: usize, remaining: usize },

    #[error("negative length prefix: {0}")]
    NegativeLength(i32),

    #[error("length {len} exceeds maximum {max}")]
    LengthExceeded { len: usize, max: usize },

    #[error("string is not valid UTF-8")]
    InvalidUtf8,

    #[error("unexpected null string")]
    UnexpectedNull,

    #[error("unknown message type: 0x{0:02x}")]
    UnknownMessageType(u8),

    #[error("empty message")]
    EmptyMessage,

    #[error("message body could not be decoded: {0}")]
    Body(String),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
