use crate::*;

use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;

use tidewire_core::message::{RequestFile, UserCommand};
use tidewire_core::{MessageType, NetFlags, NetMessage};
use tidewire_services::input::InputContext;
use tidewire_services::{ChannelState, RequestError, StringTable};
use tokio_util::sync::CancellationToken;

/// A 300 KiB table update crosses the link in chunks and applies once.
#[test]
fn test_chunked_message_round_trip() {
    let host = Peer::host();
    let mut client = Peer::client();
    let (to_client, _) = link(&host, &client);

    let blob: Vec<u8> = (0..300 * 1024).map(|i| (i % 251) as u8).collect();
    let mut table = StringTable::new("assets");
    table.set("lightmap", blob.clone());

    let replica = Arc::new(Mutex::new(StringTable::new("assets")));
    client.dispatcher.register_table("assets", replica.clone());

    to_client
        .send_raw_message(table.update_message(), NetFlags::RELIABLE)
        .unwrap();

    let outcomes = client.pump();
    let applied: Vec<_> = outcomes
        .iter()
        .filter(|(_, d)| *d == Dispatched::Applied)
        .collect();
    assert_eq!(applied.len(), 1);
    assert_eq!(outcomes.len(), 3, "three chunks, the last one applies");
    assert_eq!(&replica.lock().get("lightmap").unwrap()[..], &blob[..]);
}

/// Unreliable payloads are never chunked, whatever their size.
#[test]
fn test_unreliable_payload_is_not_chunked() {
    let host = Peer::host();
    let mut client = Peer::client();
    let (to_client, _) = link(&host, &client);

    let mut table = StringTable::new("assets");
    table.set("big", vec![0u8; 200 * 1024]);
    let replica = Arc::new(Mutex::new(StringTable::new("assets")));
    client.dispatcher.register_table("assets", replica.clone());

    to_client
        .send_raw_message(table.update_message(), NetFlags::UNRELIABLE)
        .unwrap();
    let outcomes = client.pump();
    assert_eq!(outcomes.len(), 1);
    assert!(replica.lock().contains("big"));
}

/// Kicking sends a message; the client closes its own side on receipt.
#[test]
fn test_kick_closes_client_side() {
    let host = Peer::host();
    let mut client = Peer::client();
    let (to_client, from_host) = link(&host, &client);
    from_host.set_state(ChannelState::Connected);

    // Clients can't kick.
    assert!(!from_host.kick("nope").unwrap());

    assert!(to_client.kick("server restarting").unwrap());
    assert!(!to_client.is_closed());

    let outcomes = client.pump();
    assert_eq!(
        outcomes,
        [(from_host.id(), Dispatched::Kicked("server restarting".into()))]
    );
    assert!(from_host.is_closed());
    assert_eq!(from_host.state(), ChannelState::Unconnected);
    assert!(from_host
        .send_raw_message(Bytes::from_static(&[5]), NetFlags::RELIABLE)
        .is_err());
}

/// User commands drive the host's view of the client's input, including
/// across the command number wrap.
#[test]
fn test_user_commands_drive_host_input() {
    let mut host = Peer::host();
    let client = Peer::client();
    let (to_client, from_host) = link(&host, &client);

    let jump = 1u64 << 0;
    let reload = 1u64 << 2;
    let send = |n: u32, actions: u64| {
        from_host
            .send_message_with(
                &UserCommand {
                    command_number: n,
                    actions,
                },
                NetFlags::UNRELIABLE,
            )
            .unwrap();
    };

    send(u32::MAX, jump);
    host.pump();
    assert!(to_client.down("jump"));
    assert!(to_client.pressed("jump", InputContext::Update));
    assert!(to_client.pressed("jump", InputContext::FixedUpdate));

    to_client.clear_update_context();
    assert!(!to_client.pressed("jump", InputContext::Update));
    assert!(to_client.pressed("jump", InputContext::FixedUpdate));

    // Wraps to 0: still newer.
    send(0, reload);
    host.pump();
    assert!(!to_client.down("jump"));
    assert!(to_client.down("reload"));
    assert!(to_client.released("jump", InputContext::Update));

    // A straggler from before the wrap is stale.
    send(u32::MAX - 1, jump);
    let outcomes = host.pump();
    assert_eq!(outcomes, [(to_client.id(), Dispatched::Input(false))]);
    assert!(to_client.down("reload"));
}

/// Requests round-trip through both dispatchers.
#[tokio::test]
async fn test_request_response_over_link() {
    let mut host = Peer::host();
    let mut client = Peer::client();
    let (_, from_host) = link(&host, &client);

    host.dispatcher
        .register_request(MessageType::RequestFile, |_, body| {
            let req = RequestFile::decode(body)?;
            Ok(Bytes::from(req.filename.to_uppercase()))
        });

    let cancel = CancellationToken::new();
    let conn = from_host.clone();
    let data = pump_until(&mut host, &mut client, async move {
        conn.request(
            &RequestFile {
                filename: "readme".into(),
            },
            &cancel,
        )
        .await
    })
    .await
    .unwrap();

    assert_eq!(&data[..], b"README");
    assert_eq!(from_host.pending_requests(), 0);
}

/// Closing the connection fails every request in flight.
#[tokio::test]
async fn test_close_fails_pending_requests() {
    let host = Peer::host();
    let client = Peer::client();
    let (_, from_host) = link(&host, &client);

    let cancel = CancellationToken::new();
    let conn = from_host.clone();
    let pending = tokio::spawn(async move {
        conn.request(
            &RequestFile {
                filename: "never".into(),
            },
            &cancel,
        )
        .await
    });

    while from_host.pending_requests() == 0 {
        tokio::task::yield_now().await;
    }
    from_host.close("host went away");

    assert_eq!(pending.await.unwrap(), Err(RequestError::Disconnected));
}
