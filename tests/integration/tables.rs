use crate::*;

use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;

use tidewire_core::NetFlags;
use tidewire_services::connection_info::{self, ConnectionInfoTable};
use tidewire_services::{NetworkTable, StringTable};

/// Host sets Foo=Bar, the client sees it; host removes it, the client drops it.
#[test]
fn test_string_table_delta_end_to_end() {
    init_tracing();
    let mut host = Peer::host();
    let mut client = Peer::client();
    let (to_client, _) = link(&host, &client);

    let replica = Arc::new(Mutex::new(StringTable::new("settings")));
    client.dispatcher.register_table("settings", replica.clone());

    let mut table = StringTable::new("settings");
    table.set("Foo", Bytes::from_static(b"Bar"));
    assert!(table.has_any_changes());
    to_client
        .send_raw_message(table.update_message(), NetFlags::RELIABLE)
        .unwrap();
    table.clear_changes();
    host.pump();

    let outcomes = client.pump();
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].1, Dispatched::Applied);
    assert_eq!(replica.lock().get("Foo"), Some(&Bytes::from_static(b"Bar")));

    assert!(table.remove("Foo"));
    to_client
        .send_raw_message(table.update_message(), NetFlags::RELIABLE)
        .unwrap();
    table.clear_changes();
    client.pump();
    assert!(replica.lock().is_empty());
}

/// A client joining late gets the whole table in one snapshot.
#[test]
fn test_string_table_snapshot_for_late_joiner() {
    let host = Peer::host();
    let mut client = Peer::client();
    let (to_client, _) = link(&host, &client);

    let mut table = StringTable::new("maps");
    table.set("current", Bytes::from_static(b"harbor"));
    table.set("next", Bytes::from_static(b"quarry"));
    table.set("empty", Bytes::new());
    table.clear_changes();

    let replica = Arc::new(Mutex::new(StringTable::new("maps")));
    replica.lock().set("stale", Bytes::from_static(b"x"));
    client.dispatcher.register_table("maps", replica.clone());

    to_client
        .send_raw_message(table.snapshot_message(), NetFlags::RELIABLE)
        .unwrap();
    client.pump();

    let replica = replica.lock();
    assert_eq!(replica.names().collect::<Vec<_>>(), ["current", "empty", "next"]);
    assert_eq!(replica.get("empty"), Some(&Bytes::new()));
    assert!(!replica.has_any_changes());
}

/// Client controls slot 1, host controls slot 2. Each side's change lands
/// on the other and is not sent back.
#[test]
fn test_network_table_ownership_and_no_echo() {
    let mut host = Peer::host();
    let mut client = Peer::client();
    let (to_client, to_host) = link(&host, &client);

    let host_aim = Arc::new(Mutex::new(0.0f32));
    let host_score = Arc::new(Mutex::new(0u32));
    let mut host_table = NetworkTable::new("player", |slot| slot == 2);
    {
        let (g, s) = (host_aim.clone(), host_aim.clone());
        host_table
            .register(1, move || *g.lock(), move |v| *s.lock() = v)
            .unwrap();
        let (g, s) = (host_score.clone(), host_score.clone());
        host_table
            .register(2, move || *g.lock(), move |v| *s.lock() = v)
            .unwrap();
    }

    let client_aim = Arc::new(Mutex::new(0.0f32));
    let client_score = Arc::new(Mutex::new(0u32));
    let mut client_table = NetworkTable::new("player", |slot| slot == 1);
    {
        let (g, s) = (client_aim.clone(), client_aim.clone());
        client_table
            .register(1, move || *g.lock(), move |v| *s.lock() = v)
            .unwrap();
        let (g, s) = (client_score.clone(), client_score.clone());
        client_table
            .register(2, move || *g.lock(), move |v| *s.lock() = v)
            .unwrap();
    }
    let host_table = Arc::new(Mutex::new(host_table));
    let client_table = Arc::new(Mutex::new(client_table));
    host.dispatcher.register_table("player", host_table.clone());
    client.dispatcher.register_table("player", client_table.clone());

    *client_aim.lock() = 0.5;
    *host_score.lock() = 7;

    client_table.lock().query_values();
    let msg = client_table.lock().update_message().unwrap().unwrap();
    to_host.send_raw_message(msg, NetFlags::RELIABLE).unwrap();

    host_table.lock().query_values();
    let msg = host_table.lock().update_message().unwrap().unwrap();
    to_client.send_raw_message(msg, NetFlags::RELIABLE).unwrap();

    host.pump();
    client.pump();
    assert_eq!(*host_aim.lock(), 0.5);
    assert_eq!(*client_score.lock(), 7);

    // Applied values refreshed the caches: nothing to send back.
    host_table.lock().query_values();
    client_table.lock().query_values();
    assert!(host_table.lock().update_message().unwrap().is_none());
    assert!(client_table.lock().update_message().unwrap().is_none());
}

/// Host publishes per-connection info; the client resolves it by id.
#[test]
fn test_connection_info_replicates() {
    let host = Peer::host();
    let mut client = Peer::client();
    let (to_client, from_host) = link(&host, &client);

    assert!(to_client.update_info(|info| {
        info.display_name = "Ada".into();
        info.ping = 42;
        info.can_spawn_objects = true;
    }));
    // Clients never edit info locally.
    assert!(!from_host.update_info(|info| info.ping = 1));

    let mut host_infos = ConnectionInfoTable::new(true);
    assert!(host_infos.update(&to_client));

    let client_infos = Arc::new(Mutex::new(ConnectionInfoTable::new(false)));
    client
        .dispatcher
        .register_table(connection_info::TABLE_NAME, client_infos.clone());

    to_client
        .send_raw_message(host_infos.table().update_message(), NetFlags::RELIABLE)
        .unwrap();
    host_infos.table_mut().clear_changes();
    client.pump();

    assert!(client_infos.lock().sync_connection(&from_host));
    let info = from_host.info();
    assert_eq!(info.display_name, "Ada");
    assert_eq!(info.ping, 42);
    assert!(info.can_spawn_objects);
    assert!(!info.can_destroy_objects);
}
