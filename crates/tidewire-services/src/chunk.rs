//! Chunking — splitting large reliable payloads and reassembling them.
//!
//! Chunks of one message travel on the reliable channel back to back, so a
//! connection has at most one message in reassembly at a time. The header
//! carries only `(chunk_index, chunk_count)`; there's no message id.

use bytes::{Bytes, BytesMut};
use std::time::{Duration, Instant};
use zerocopy::AsBytes;

use tidewire_core::wire::{ChunkHeader, WireError, CHUNK_HEADER_LEN};
use tidewire_core::MessageType;

/// Upper bound on chunks in one message. Caps what a hostile header can
/// make the receiver allocate up front.
pub const MAX_CHUNKS: u32 = 8192;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChunkError {
    #[error("chunk header invalid: {0}")]
    Header(#[from] WireError),

    #[error("chunk index {index} out of range for {count} chunks")]
    IndexOutOfRange { index: u32, count: u32 },

    #[error("chunk count changed mid-message: expected {expected}, got {got}")]
    CountMismatch { expected: u32, got: u32 },

    #[error("message of {len} bytes needs more than {MAX_CHUNKS} chunks")]
    TooLarge { len: usize },

    #[error("chunk count {0} exceeds limit of {MAX_CHUNKS}")]
    TooManyChunks(u32),
}

/// Number of chunks a payload of `len` bytes splits into.
pub fn chunk_count(len: usize, max_chunk: usize) -> usize {
    len.div_ceil(max_chunk.max(1))
}

/// Split a payload into framed chunks: `Chunk` tag, header, then at most
/// `max_chunk` bytes of payload.
pub fn split_message(payload: &[u8], max_chunk: usize) -> Result<Vec<Bytes>, ChunkError> {
    let max_chunk = max_chunk.max(1);
    let count = u32::try_from(chunk_count(payload.len(), max_chunk))
        .ok()
        .filter(|&c| c <= MAX_CHUNKS)
        .ok_or(ChunkError::TooLarge { len: payload.len() })?;

    let chunks = payload
        .chunks(max_chunk)
        .enumerate()
        .map(|(index, piece)| {
            let header = ChunkHeader {
                chunk_index: index as u32,
                chunk_count: count,
            };
            let mut buf = BytesMut::with_capacity(1 + CHUNK_HEADER_LEN + piece.len());
            buf.extend_from_slice(&[MessageType::Chunk as u8]);
            buf.extend_from_slice(header.as_bytes());
            buf.extend_from_slice(piece);
            buf.freeze()
        })
        .collect();
    Ok(chunks)
}

// ── Reassembly ───────────────────────────────────────────────────────────────

struct Assembly {
    count: u32,
    pieces: Vec<Option<Bytes>>,
    received: u32,
    started_at: Instant,
}

/// Per-connection reassembly state.
#[derive(Default)]
pub struct ChunkAssembler {
    active: Option<Assembly>,
}

impl ChunkAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk body (the bytes after the `Chunk` tag).
    ///
    /// Returns the whole message once the last missing chunk arrives.
    /// Duplicate indices are ignored.
    pub fn push(&mut self, body: &[u8]) -> Result<Option<Bytes>, ChunkError> {
        let (header, piece) = ChunkHeader::split(body)?;
        let index = header.chunk_index;
        let count = header.chunk_count;

        if count == 0 || index >= count {
            return Err(ChunkError::IndexOutOfRange { index, count });
        }
        if count > MAX_CHUNKS {
            return Err(ChunkError::TooManyChunks(count));
        }

        if let Some(active) = &self.active {
            if active.count != count {
                let expected = active.count;
                // A fresh message starting means the old one is never finishing.
                if index == 0 {
                    tracing::warn!(
                        expected,
                        got = count,
                        "dropping incomplete chunked message"
                    );
                    self.active = None;
                } else {
                    return Err(ChunkError::CountMismatch { expected, got: count });
                }
            }
        }

        let assembly = self.active.get_or_insert_with(|| Assembly {
            count,
            pieces: vec![None; count as usize],
            received: 0,
            started_at: Instant::now(),
        });

        let slot = &mut assembly.pieces[index as usize];
        if slot.is_some() {
            tracing::debug!(index, count, "duplicate chunk ignored");
            return Ok(None);
        }
        *slot = Some(Bytes::copy_from_slice(piece));
        assembly.received += 1;

        if assembly.received < assembly.count {
            return Ok(None);
        }

        let Some(done) = self.active.take() else {
            return Ok(None);
        };
        let total: usize = done.pieces.iter().flatten().map(Bytes::len).sum();
        let mut out = BytesMut::with_capacity(total);
        for piece in done.pieces.iter().flatten() {
            out.extend_from_slice(piece);
        }
        Ok(Some(out.freeze()))
    }

    pub fn is_assembling(&self) -> bool {
        self.active.is_some()
    }

    /// Drop an assembly that has been waiting longer than `timeout`.
    /// Returns true if something was dropped.
    pub fn purge_stale(&mut self, timeout: Duration) -> bool {
        let stale = self
            .active
            .as_ref()
            .is_some_and(|a| a.started_at.elapsed() >= timeout);
        if stale {
            if let Some(a) = self.active.take() {
                tracing::warn!(
                    received = a.received,
                    count = a.count,
                    "removing stale chunk assembly (timed out)"
                );
            }
        }
        stale
    }

    pub fn clear(&mut self) {
        self.active = None;
    }
}
