//! Checksums and identifiers for Tidewire.
//!
//! Provides two things:
//!   1. CRC-32 (IEEE) — the key of the content cache and the second half of
//!      the `(size, crc)` identity that gates large-file downloads
//!   2. Random GUIDs — connection and handshake identifiers
//!
//! CRC is not a security boundary. It answers "do I already have these
//! bytes", nothing more.

use std::fmt;
use std::io::Read;
use std::path::Path;

use rand::RngCore;
use serde::{Deserialize, Serialize};

// ── CRC-32 ───────────────────────────────────────────────────────────────────

/// CRC-32 of a byte slice.
pub fn crc32(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

/// Incremental CRC-32 for payloads that arrive in pieces.
///
/// # Example
/// ```
/// use tidewire_core::checksum::Hasher;
/// let mut h = Hasher::new();
/// h.update(b"hello ");
/// h.update(b"world");
/// assert_eq!(h.finalize(), tidewire_core::checksum::crc32(b"hello world"));
/// ```
pub struct Hasher(crc32fast::Hasher);

impl Hasher {
    pub fn new() -> Self {
        Self(crc32fast::Hasher::new())
    }

    pub fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    pub fn finalize(self) -> u32 {
        self.0.finalize()
    }
}

impl Default for Hasher {
    fn default() -> Self {
        Self::new()
    }
}

/// Size and CRC of a file on disk, streamed in 64 KiB blocks.
pub fn file_size_and_crc(path: &Path) -> std::io::Result<(u64, u32)> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Hasher::new();
    let mut buf = vec![0u8; 64 * 1024];
    let mut size = 0u64;
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }
    Ok((size, hasher.finalize()))
}

// ── GUID ─────────────────────────────────────────────────────────────────────

/// A random 128-bit identifier.
///
/// Allocated randomly rather than sequentially so nothing can come to depend
/// on creation order.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Guid([u8; 16]);

impl Guid {
    /// The all-zero GUID. Never produced by `new_random`.
    pub const NIL: Guid = Guid([0u8; 16]);

    pub fn new_random() -> Self {
        let mut bytes = [0u8; 16];
        loop {
            rand::thread_rng().fill_bytes(&mut bytes);
            if bytes != [0u8; 16] {
                return Self(bytes);
            }
        }
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    pub fn is_nil(&self) -> bool {
        self.0 == [0u8; 16]
    }

    /// Parse the 32-character hex form produced by `Display`.
    pub fn parse(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        let arr: [u8; 16] = bytes.try_into().ok()?;
        Some(Self(arr))
    }
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Guid({})", hex::encode(&self.0[..4]))
    }
}
