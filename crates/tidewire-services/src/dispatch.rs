//! Routes incoming messages to tables, pending requests and input.
//!
//! Transport worker threads never touch replicated state. They stage raw
//! payloads in a `MessageInbox`; the tick drains it and hands each payload
//! to `MessageDispatcher`, which reassembles chunks and routes by tag.
//! A malformed payload is logged and dropped; it never takes the tick down.

use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

use tidewire_core::message::{self, KickMessage, UserCommand};
use tidewire_core::{ByteReader, Guid, MessageType, NetMessage, WireError};

use crate::chunk::ChunkError;
use crate::connection::{Connection, ConnectionTable, SendError};
use crate::connection_info::ConnectionInfoTable;
use crate::large_files::LargeNetworkFiles;
use crate::network_table::NetworkTable;
use crate::packages::ServerPackages;
use crate::small_files::SmallNetworkFiles;
use crate::string_table::StringTable;

// ── Staging ──────────────────────────────────────────────────────────────────

/// Inbound payload tagged with the receiver-side connection it arrived on.
pub type Inbound = (Guid, Bytes);

/// Sending half of a `MessageInbox`. Cheap to clone and safe to use from
/// transport worker threads.
#[derive(Clone)]
pub struct InboxSender {
    tx: mpsc::UnboundedSender<Inbound>,
}

impl InboxSender {
    /// Stage one received payload for the tick. The only thing a worker
    /// thread may do with a message.
    pub fn process_message_in_thread(&self, connection: Guid, payload: Bytes) -> bool {
        self.tx.send((connection, payload)).is_ok()
    }
}

/// Receive queue drained once per tick.
pub struct MessageInbox {
    tx: mpsc::UnboundedSender<Inbound>,
    rx: mpsc::UnboundedReceiver<Inbound>,
}

impl Default for MessageInbox {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageInbox {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self { tx, rx }
    }

    pub fn sender(&self) -> InboxSender {
        InboxSender {
            tx: self.tx.clone(),
        }
    }

    /// Everything staged since the last drain, in arrival order.
    pub fn drain(&mut self) -> Vec<Inbound> {
        let mut out = Vec::new();
        while let Ok(item) = self.rx.try_recv() {
            out.push(item);
        }
        out
    }

    /// Wait for at least one staged message, then drain.
    pub async fn recv_batch(&mut self) -> Vec<Inbound> {
        let mut out = Vec::new();
        if let Some(first) = self.rx.recv().await {
            out.push(first);
            out.extend(self.drain());
        }
        out
    }
}

// ── Handlers ─────────────────────────────────────────────────────────────────

/// A replicated table that accepts network data.
pub trait TableHandler: Send {
    fn apply_update(&mut self, r: &mut ByteReader<'_>) -> Result<(), WireError>;
    fn apply_snapshot(&mut self, r: &mut ByteReader<'_>) -> Result<(), WireError>;
}

pub type SharedTable = Arc<Mutex<dyn TableHandler>>;

/// Answers one kind of request. Returns the response payload.
pub type RequestHandler =
    Box<dyn Fn(&Connection, &[u8]) -> Result<Bytes, WireError> + Send + Sync>;

impl TableHandler for StringTable {
    fn apply_update(&mut self, r: &mut ByteReader<'_>) -> Result<(), WireError> {
        self.read_update(r, &mut ())
    }

    fn apply_snapshot(&mut self, r: &mut ByteReader<'_>) -> Result<(), WireError> {
        self.read_snapshot(r, &mut ())
    }
}

impl TableHandler for NetworkTable {
    fn apply_update(&mut self, r: &mut ByteReader<'_>) -> Result<(), WireError> {
        self.read(r)
    }

    fn apply_snapshot(&mut self, r: &mut ByteReader<'_>) -> Result<(), WireError> {
        self.read(r)
    }
}

macro_rules! table_handler {
    ($($ty:ty),*) => {$(
        impl TableHandler for $ty {
            fn apply_update(&mut self, r: &mut ByteReader<'_>) -> Result<(), WireError> {
                self.read_update(r)
            }

            fn apply_snapshot(&mut self, r: &mut ByteReader<'_>) -> Result<(), WireError> {
                self.read_snapshot(r)
            }
        }
    )*};
}

table_handler!(LargeNetworkFiles, SmallNetworkFiles, ServerPackages, ConnectionInfoTable);

// ── Dispatcher ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error(transparent)]
    Chunk(#[from] ChunkError),

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error("no table named {0:?}")]
    UnknownTable(String),

    #[error("chunk inside a reassembled message")]
    NestedChunk,

    #[error("response could not be sent: {0}")]
    Send(#[from] SendError),
}

/// What a dispatched payload turned into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatched {
    /// A chunk of a message still being reassembled.
    Pending,
    /// Applied to a table.
    Applied,
    /// A request was answered.
    Responded,
    /// A response arrived; false if nobody was waiting for it.
    Completed(bool),
    /// The peer kicked us. The connection has been closed.
    Kicked(String),
    /// A user command; false if it was stale.
    Input(bool),
    /// Well-formed but nothing handles it.
    Unhandled(MessageType),
}

pub struct MessageDispatcher {
    tables: HashMap<String, SharedTable>,
    requests: HashMap<MessageType, RequestHandler>,
    max_response_bytes: usize,
}

impl MessageDispatcher {
    pub fn new(max_response_bytes: usize) -> Self {
        Self {
            tables: HashMap::new(),
            requests: HashMap::new(),
            max_response_bytes,
        }
    }

    /// Route table messages named `name` to `table`.
    pub fn register_table(&mut self, name: impl Into<String>, table: SharedTable) {
        self.tables.insert(name.into(), table);
    }

    /// Answer requests whose inner message has tag `kind`.
    pub fn register_request(
        &mut self,
        kind: MessageType,
        handler: impl Fn(&Connection, &[u8]) -> Result<Bytes, WireError> + Send + Sync + 'static,
    ) {
        self.requests.insert(kind, Box::new(handler));
    }

    /// Dispatch one payload received on `conn`.
    pub fn dispatch(&self, conn: &Connection, payload: Bytes) -> Result<Dispatched, DispatchError> {
        let Some(msg) = conn.receive_raw(payload)? else {
            return Ok(Dispatched::Pending);
        };
        let (kind, body) = message::split_tag(&msg)?;

        match kind {
            MessageType::Chunk => Err(DispatchError::NestedChunk),

            MessageType::StringTableUpdate
            | MessageType::StringTableSnapshot
            | MessageType::NetworkTableUpdate => {
                let mut r = ByteReader::new(body);
                let name = r.read_string()?;
                let table = self
                    .tables
                    .get(&name)
                    .ok_or(DispatchError::UnknownTable(name))?;
                let mut table = table.lock();
                if kind == MessageType::StringTableSnapshot {
                    table.apply_snapshot(&mut r)?;
                } else {
                    table.apply_update(&mut r)?;
                }
                Ok(Dispatched::Applied)
            }

            MessageType::Kick => {
                let kick = KickMessage::decode(body)?;
                conn.close(&kick.reason);
                Ok(Dispatched::Kicked(kick.reason))
            }

            MessageType::Request => {
                let (id, inner) = message::decode_request(body)?;
                let (inner_kind, inner_body) = message::split_tag(inner)?;
                match self.requests.get(&inner_kind) {
                    Some(handler) => {
                        let data = handler(conn, inner_body)?;
                        conn.respond(id, &data)?;
                        Ok(Dispatched::Responded)
                    }
                    None => {
                        tracing::warn!(
                            connection = %conn.id(),
                            kind = ?inner_kind,
                            "no handler for request"
                        );
                        // Still answer, so the requester isn't left waiting.
                        conn.respond(id, &[])?;
                        Ok(Dispatched::Unhandled(inner_kind))
                    }
                }
            }

            MessageType::Response => {
                let (id, data) = message::decode_response(body, self.max_response_bytes)?;
                Ok(Dispatched::Completed(conn.complete_request(id, data)))
            }

            MessageType::UserCommand => {
                let cmd = UserCommand::decode(body)?;
                Ok(Dispatched::Input(conn.apply_user_command(cmd)))
            }

            MessageType::RequestFile => Ok(Dispatched::Unhandled(kind)),
        }
    }

    /// Drain the inbox and dispatch everything in it.
    ///
    /// Payloads for unknown connections and payloads that fail to dispatch
    /// are logged and dropped. Returns every successful outcome in order.
    pub fn process(
        &self,
        inbox: &mut MessageInbox,
        connections: &ConnectionTable,
    ) -> Vec<(Guid, Dispatched)> {
        let mut out = Vec::new();
        for (id, payload) in inbox.drain() {
            let Some(conn) = connections.get(&id).map(|c| c.value().clone()) else {
                tracing::debug!(connection = %id, "message for unknown connection dropped");
                continue;
            };
            match self.dispatch(&conn, payload) {
                Ok(outcome) => out.push((id, outcome)),
                Err(e) => {
                    tracing::warn!(connection = %id, error = %e, "failed to dispatch message");
                }
            }
        }
        out
    }
}
