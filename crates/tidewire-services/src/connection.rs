//! Connection — one per peer, including the host's self-connection.
//!
//! Owns the channel state machine, outbound framing (chunking of large
//! reliable payloads), inbound reassembly, the request/response table and
//! the peer's input edges. Shared behind an `Arc` between the tick and any
//! async download tasks, so all mutable state sits behind locks or atomics.

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use tidewire_core::message::{self, KickMessage, UserCommand};
use tidewire_core::{ByteWriter, Guid, MessageType, NetFlags, NetMessage, WireError};

use crate::chunk::{self, ChunkAssembler, ChunkError};
use crate::connection_info::ConnectionInfo;
use crate::context::NetContext;
use crate::input::{InputContext, InputState};
use crate::transport::{MessageTransport, TransportError};

// ── Channel state ─────────────────────────────────────────────────────────────

/// Join progress of a connection. Ordered: every state before `Connected`
/// is part of connecting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum ChannelState {
    Unconnected = 0,
    LoadingServerInformation = 1,
    Welcome = 2,
    MountVpks = 3,
    Snapshot = 4,
    Connected = 5,
}

impl ChannelState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::LoadingServerInformation,
            2 => Self::Welcome,
            3 => Self::MountVpks,
            4 => Self::Snapshot,
            5 => Self::Connected,
            _ => Self::Unconnected,
        }
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    #[error("connection is closed")]
    Closed,

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error(transparent)]
    Chunk(#[from] ChunkError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RequestError {
    /// The peer went away. Fatal for everything in flight on this connection.
    #[error("connection lost before the response arrived")]
    Disconnected,

    #[error("request cancelled")]
    Cancelled,

    #[error("request timed out")]
    Timeout,

    #[error("request could not be sent: {0}")]
    Send(#[from] SendError),
}

// ── Connection ───────────────────────────────────────────────────────────────

/// Live connections by id, shared between the tick and async tasks.
pub type ConnectionTable = Arc<DashMap<Guid, Arc<Connection>>>;

pub fn new_connection_table() -> ConnectionTable {
    Arc::new(DashMap::new())
}

pub struct Connection {
    id: Guid,
    handshake_id: Mutex<Guid>,
    state: AtomicU8,
    is_local: bool,
    closed: AtomicBool,
    context: Arc<NetContext>,
    transport: Arc<dyn MessageTransport>,
    info: Mutex<ConnectionInfo>,
    input: Mutex<InputState>,
    assembler: Mutex<ChunkAssembler>,
    pending: DashMap<u64, oneshot::Sender<Bytes>>,
    next_request_id: AtomicU64,
}

impl Connection {
    pub fn new(context: Arc<NetContext>, transport: Arc<dyn MessageTransport>) -> Self {
        Self::with_id(Guid::new_random(), false, context, transport)
    }

    /// The host's connection to itself. Input reads go to `LocalInput`.
    pub fn new_local(context: Arc<NetContext>, transport: Arc<dyn MessageTransport>) -> Self {
        let id = context.local_connection().unwrap_or_else(Guid::new_random);
        Self::with_id(id, true, context, transport)
    }

    pub fn with_id(
        id: Guid,
        is_local: bool,
        context: Arc<NetContext>,
        transport: Arc<dyn MessageTransport>,
    ) -> Self {
        Self {
            id,
            handshake_id: Mutex::new(Guid::new_random()),
            state: AtomicU8::new(ChannelState::Unconnected as u8),
            is_local,
            closed: AtomicBool::new(false),
            context,
            transport,
            info: Mutex::new(ConnectionInfo::default()),
            input: Mutex::new(InputState::new()),
            assembler: Mutex::new(ChunkAssembler::new()),
            pending: DashMap::new(),
            next_request_id: AtomicU64::new(1),
        }
    }

    pub fn id(&self) -> Guid {
        self.id
    }

    pub fn is_local(&self) -> bool {
        self.is_local
    }

    pub fn context(&self) -> &Arc<NetContext> {
        &self.context
    }

    pub fn handshake_id(&self) -> Guid {
        *self.handshake_id.lock()
    }

    /// Issue a new handshake id; replies carrying the old one are stale.
    pub fn reset_handshake(&self) -> Guid {
        let id = Guid::new_random();
        *self.handshake_id.lock() = id;
        id
    }

    // ── State machine ────────────────────────────────────────────────────────

    pub fn state(&self) -> ChannelState {
        ChannelState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Move to `state`. Returns false, and does nothing, if already there.
    pub fn set_state(&self, state: ChannelState) -> bool {
        let prev = ChannelState::from_u8(self.state.swap(state as u8, Ordering::AcqRel));
        if prev == state {
            return false;
        }
        tracing::debug!(connection = %self.id, from = ?prev, to = ?state, "channel state changed");
        true
    }

    /// True for every state up to and including `Snapshot`.
    pub fn is_connecting(&self) -> bool {
        self.state() <= ChannelState::Snapshot
    }

    pub fn is_active(&self) -> bool {
        self.state() == ChannelState::Connected
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Back to `Unconnected` for a reconnect. Input, partial chunks and
    /// pending requests are discarded.
    pub fn reset(&self) {
        self.set_state(ChannelState::Unconnected);
        self.input.lock().reset();
        self.assembler.lock().clear();
        self.fail_pending();
    }

    /// Close for good. Every in-flight request fails with `Disconnected`.
    pub fn close(&self, reason: &str) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::info!(connection = %self.id, reason, "connection closed");
        self.transport.close();
        self.set_state(ChannelState::Unconnected);
        self.fail_pending();
    }

    fn fail_pending(&self) {
        // Dropping the senders wakes every waiter with a RecvError.
        self.pending.clear();
    }

    // ── Info ─────────────────────────────────────────────────────────────────

    pub fn info(&self) -> ConnectionInfo {
        self.info.lock().clone()
    }

    /// Mutate the connection's info. Only the host may do this; clients
    /// receive info through the connection info table.
    pub fn update_info(&self, f: impl FnOnce(&mut ConnectionInfo)) -> bool {
        if !self.context.is_host() {
            return false;
        }
        f(&mut self.info.lock());
        true
    }

    pub(crate) fn replace_info(&self, info: ConnectionInfo) {
        *self.info.lock() = info;
    }

    // ── Outbound ─────────────────────────────────────────────────────────────

    pub fn send_message<T: NetMessage>(&self, msg: &T) -> Result<(), SendError> {
        self.send_message_with(msg, NetFlags::RELIABLE)
    }

    pub fn send_message_with<T: NetMessage>(
        &self,
        msg: &T,
        flags: NetFlags,
    ) -> Result<(), SendError> {
        let mut w = ByteWriter::new();
        msg.encode(&mut w)?;
        self.send_raw_message(w.into_bytes(), flags)
    }

    /// Send a framed payload, chunking reliable payloads at or above the
    /// unsplit limit.
    pub fn send_raw_message(&self, payload: Bytes, flags: NetFlags) -> Result<(), SendError> {
        if self.is_closed() {
            return Err(SendError::Closed);
        }

        let limit = self.context.config().network.max_unsplit_payload;
        if !flags.is_reliable() || payload.len() < limit {
            return Ok(self.transport.send(payload, flags)?);
        }

        let chunks = chunk::split_message(&payload, limit)?;
        tracing::trace!(
            connection = %self.id,
            bytes = payload.len(),
            chunks = chunks.len(),
            "sending chunked message"
        );
        for piece in chunks {
            self.transport.send(piece, flags)?;
        }
        Ok(())
    }

    /// Ask the peer to leave. Host only; never closes the local side.
    pub fn kick(&self, reason: &str) -> Result<bool, SendError> {
        if !self.context.is_host() {
            return Ok(false);
        }
        tracing::info!(connection = %self.id, reason, "kicking connection");
        self.send_message(&KickMessage {
            reason: reason.to_owned(),
        })?;
        Ok(true)
    }

    // ── Inbound ──────────────────────────────────────────────────────────────

    /// Pass a received payload through chunk reassembly.
    ///
    /// Non-chunk payloads come straight back. Chunks return `None` until the
    /// message they belong to is complete.
    pub fn receive_raw(&self, payload: Bytes) -> Result<Option<Bytes>, ChunkError> {
        match payload.first() {
            Some(&tag) if tag == MessageType::Chunk as u8 => {
                self.assembler.lock().push(&payload[1..])
            }
            _ => Ok(Some(payload)),
        }
    }

    /// Periodic housekeeping: drops chunk assemblies that stalled.
    pub fn tick(&self) {
        let timeout = self.context.config().network.chunk_timeout();
        self.assembler.lock().purge_stale(timeout);
    }

    // ── Request / response ───────────────────────────────────────────────────

    /// Send `msg` as a request and wait for the matching response.
    pub async fn request<T: NetMessage>(
        &self,
        msg: &T,
        cancel: &CancellationToken,
    ) -> Result<Bytes, RequestError> {
        if self.is_closed() {
            return Err(RequestError::Disconnected);
        }

        let id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);
        // close() may have drained the table between the check and insert.
        if self.is_closed() {
            self.pending.remove(&id);
            return Err(RequestError::Disconnected);
        }

        let mut inner = ByteWriter::new();
        let sent = msg
            .encode(&mut inner)
            .map_err(SendError::from)
            .and_then(|()| {
                let mut w = ByteWriter::with_capacity(inner.len() + 9);
                message::encode_request(id, inner.as_slice(), &mut w);
                self.send_raw_message(w.into_bytes(), NetFlags::RELIABLE)
            });
        if let Err(e) = sent {
            self.pending.remove(&id);
            return Err(e.into());
        }

        let timeout = self.context.config().downloads.request_timeout();
        let result = tokio::select! {
            _ = cancel.cancelled() => Err(RequestError::Cancelled),
            r = tokio::time::timeout(timeout, rx) => match r {
                Ok(Ok(data)) => Ok(data),
                Ok(Err(_)) => Err(RequestError::Disconnected),
                Err(_) => Err(RequestError::Timeout),
            },
        };
        self.pending.remove(&id);
        result
    }

    /// Resolve a pending request. Returns false for unknown or already
    /// abandoned ids.
    pub fn complete_request(&self, id: u64, data: Bytes) -> bool {
        match self.pending.remove(&id) {
            Some((_, tx)) => tx.send(data).is_ok(),
            None => {
                tracing::debug!(
                    connection = %self.id,
                    request_id = id,
                    "response for unknown request"
                );
                false
            }
        }
    }

    /// Answer a request received from the peer.
    pub fn respond(&self, id: u64, data: &[u8]) -> Result<(), SendError> {
        let mut w = ByteWriter::with_capacity(data.len() + 13);
        message::encode_response(id, data, &mut w);
        self.send_raw_message(w.into_bytes(), NetFlags::RELIABLE)
    }

    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    // ── Input ────────────────────────────────────────────────────────────────

    pub fn apply_user_command(&self, cmd: UserCommand) -> bool {
        self.input.lock().apply_user_command(cmd)
    }

    pub fn down(&self, action: &str) -> bool {
        if let Some(local) = self.local_input() {
            return local.down(action);
        }
        self.action_bit(action)
            .is_some_and(|bit| self.input.lock().down(bit))
    }

    pub fn pressed(&self, action: &str, ctx: InputContext) -> bool {
        if let Some(local) = self.local_input() {
            return local.pressed(action, ctx);
        }
        self.action_bit(action)
            .is_some_and(|bit| self.input.lock().pressed(bit, ctx))
    }

    pub fn released(&self, action: &str, ctx: InputContext) -> bool {
        if let Some(local) = self.local_input() {
            return local.released(action, ctx);
        }
        self.action_bit(action)
            .is_some_and(|bit| self.input.lock().released(bit, ctx))
    }

    pub fn clear_update_context(&self) {
        self.input.lock().clear_update_context();
    }

    pub fn clear_fixed_update_context(&self) {
        self.input.lock().clear_fixed_update_context();
    }

    fn local_input(&self) -> Option<&Arc<dyn crate::input::LocalInput>> {
        if self.is_local {
            self.context.local_input()
        } else {
            None
        }
    }

    fn action_bit(&self, action: &str) -> Option<u32> {
        let bit = self.context.actions().index_of(action);
        if bit.is_none() {
            tracing::trace!(action, "unknown action");
        }
        bit
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("is_local", &self.is_local)
            .field("closed", &self.is_closed())
            .finish()
    }
}
