//! Tidewire integration test harness.
//!
//! Tests wire a host and its clients together in-process through
//! `ChannelTransport` and pump each side's inbox the way a game tick would.
//! No sockets are involved, so everything runs under plain `cargo test`.
//!
//! Each test owns its peers; temp directories are unique per test.

use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tidewire_core::config::TidewireConfig;
use tidewire_core::Guid;
use tidewire_services::connection::new_connection_table;
use tidewire_services::input::ActionRegistry;
use tidewire_services::{
    ChannelTransport, Connection, ConnectionTable, Dispatched, MessageDispatcher, MessageInbox,
    NetContext,
};

mod connection;
mod files;
mod packages;
mod tables;

// ── Harness ───────────────────────────────────────────────────────────────────

pub const ACTIONS: [&str; 3] = ["jump", "attack1", "reload"];

/// One side of a session: its inbox, its connections and its dispatcher.
pub struct Peer {
    pub context: Arc<NetContext>,
    pub inbox: MessageInbox,
    pub connections: ConnectionTable,
    pub dispatcher: MessageDispatcher,
}

impl Peer {
    pub fn host() -> Self {
        Self::new(NetContext::host(TidewireConfig::default(), ActionRegistry::new(ACTIONS)))
    }

    pub fn client() -> Self {
        Self::new(NetContext::client(TidewireConfig::default(), ActionRegistry::new(ACTIONS)))
    }

    fn new(context: NetContext) -> Self {
        let dispatcher = MessageDispatcher::new(context.config().downloads.max_file_bytes);
        Self {
            context: context.into_shared(),
            inbox: MessageInbox::new(),
            connections: new_connection_table(),
            dispatcher,
        }
    }

    /// One tick's worth of message processing.
    pub fn pump(&mut self) -> Vec<(Guid, Dispatched)> {
        self.dispatcher.process(&mut self.inbox, &self.connections)
    }
}

/// Connect `client` to `host`. Both sides share the connection id.
///
/// Returns the host's connection to the client and the client's
/// connection to the host.
pub fn link(host: &Peer, client: &Peer) -> (Arc<Connection>, Arc<Connection>) {
    let id = Guid::new_random();
    let host_side = Arc::new(Connection::with_id(
        id,
        false,
        host.context.clone(),
        Arc::new(ChannelTransport::new(client.inbox.sender(), id)),
    ));
    let client_side = Arc::new(Connection::with_id(
        id,
        false,
        client.context.clone(),
        Arc::new(ChannelTransport::new(host.inbox.sender(), id)),
    ));
    host.connections.insert(id, host_side.clone());
    client.connections.insert(id, client_side.clone());
    (host_side, client_side)
}

/// Run `task` on the runtime while pumping both peers until it finishes.
pub async fn pump_until<T, F>(host: &mut Peer, client: &mut Peer, task: F) -> T
where
    T: Send + 'static,
    F: Future<Output = T> + Send + 'static,
{
    let handle = tokio::spawn(task);
    let deadline = Instant::now() + Duration::from_secs(10);
    while !handle.is_finished() {
        host.pump();
        client.pump();
        assert!(Instant::now() < deadline, "task did not finish in time");
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    handle.await.expect("task panicked")
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

static COUNTER: AtomicU64 = AtomicU64::new(0);

/// Fresh, empty directory unique to this process and call.
pub fn temp_dir(tag: &str) -> PathBuf {
    let id = COUNTER.fetch_add(1, Ordering::Relaxed);
    let dir = std::env::temp_dir().join(format!(
        "tidewire-it-{tag}-{}-{}",
        std::process::id(),
        id
    ));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).expect("create temp dir");
    dir
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[test]
fn link_registers_both_sides() {
    let host = Peer::host();
    let client = Peer::client();
    let (host_side, client_side) = link(&host, &client);

    assert_eq!(host_side.id(), client_side.id());
    assert!(host.connections.contains_key(&host_side.id()));
    assert!(client.connections.contains_key(&client_side.id()));
    assert!(host_side.context().is_host());
    assert!(client_side.context().is_client());
}
