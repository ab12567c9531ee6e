//! Transport seam — the abstract send primitive beneath `Connection`.
//!
//! Sockets, encryption and congestion control live below this trait.
//! `Connection` hands it fully framed payloads (already chunked if needed)
//! and expects them delivered to the peer's message pump in order when
//! flagged reliable.

use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};

use tidewire_core::{Guid, NetFlags};

use crate::dispatch::InboxSender;

/// Errors a transport can report for a send.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("peer is closed")]
    Closed,

    #[error("transport failure: {0}")]
    Failed(String),
}

/// Trait for the per-peer send side of a transport.
///
/// Intentionally minimal. Request/response and chunking are built on top by
/// `Connection`.
pub trait MessageTransport: Send + Sync {
    /// Queue one payload for the peer.
    fn send(&self, payload: Bytes, flags: NetFlags) -> Result<(), TransportError>;

    /// Tear down the underlying socket. Further sends fail with `Closed`.
    fn close(&self);
}

// ── In-process transport ─────────────────────────────────────────────────────

/// Transport that delivers straight into a peer's `MessageInbox`.
///
/// Used for the host's local self-connection and for in-process peers.
/// Ordering is the channel's FIFO order regardless of flags.
pub struct ChannelTransport {
    peer_inbox: InboxSender,
    /// Id of the connection object on the receiving side.
    remote_connection: Guid,
    closed: AtomicBool,
}

impl ChannelTransport {
    pub fn new(peer_inbox: InboxSender, remote_connection: Guid) -> Self {
        Self {
            peer_inbox,
            remote_connection,
            closed: AtomicBool::new(false),
        }
    }
}

impl MessageTransport for ChannelTransport {
    fn send(&self, payload: Bytes, _flags: NetFlags) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        if self
            .peer_inbox
            .process_message_in_thread(self.remote_connection, payload)
        {
            Ok(())
        } else {
            Err(TransportError::Closed)
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}
