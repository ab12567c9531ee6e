//! Connection info — per-connection metadata replicated to every client.
//!
//! The host is the only writer. It publishes each connection's
//! `ConnectionInfo` as JSON into a StringTable keyed by the connection id;
//! clients decode entries lazily the first time someone asks.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use tidewire_core::{ByteReader, Guid, WireError};

use crate::connection::Connection;
use crate::string_table::{Entry, StringTable, TableObserver};

pub const TABLE_NAME: &str = "connection_info";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionInfo {
    pub display_name: String,
    /// Round trip in milliseconds, as measured by the host.
    pub ping: u32,
    pub can_spawn_objects: bool,
    pub can_refresh_objects: bool,
    pub can_destroy_objects: bool,
    pub user_data: BTreeMap<String, String>,
}

/// Drops decoded entries whose table row changed.
struct Invalidate<'a>(&'a mut HashMap<Guid, ConnectionInfo>);

impl TableObserver for Invalidate<'_> {
    fn on_change_or_add(&mut self, entry: &Entry) {
        if let Some(id) = Guid::parse(&entry.name) {
            self.0.remove(&id);
        }
    }

    fn on_removed(&mut self, entry: &Entry) {
        if let Some(id) = Guid::parse(&entry.name) {
            self.0.remove(&id);
        }
    }

    fn on_snapshot(&mut self, _table: &StringTable) {
        self.0.clear();
    }
}

pub struct ConnectionInfoTable {
    table: StringTable,
    is_host: bool,
    resolved: HashMap<Guid, ConnectionInfo>,
}

impl ConnectionInfoTable {
    pub fn new(is_host: bool) -> Self {
        Self {
            table: StringTable::new(TABLE_NAME),
            is_host,
            resolved: HashMap::new(),
        }
    }

    pub fn table(&self) -> &StringTable {
        &self.table
    }

    pub fn table_mut(&mut self) -> &mut StringTable {
        &mut self.table
    }

    /// Publish a connection's current info. Host only.
    pub fn update(&mut self, connection: &Connection) -> bool {
        if !self.is_host {
            return false;
        }
        let info = connection.info();
        let data = match serde_json::to_vec(&info) {
            Ok(data) => data,
            Err(e) => {
                tracing::warn!(
                    connection = %connection.id(),
                    error = %e,
                    "failed to encode connection info"
                );
                return false;
            }
        };
        self.table.set(connection.id().to_string(), data);
        self.resolved.insert(connection.id(), info);
        true
    }

    /// Drop a departed connection. Host only.
    pub fn remove(&mut self, id: Guid) -> bool {
        if !self.is_host {
            return false;
        }
        self.resolved.remove(&id);
        self.table.remove(&id.to_string())
    }

    /// Resolve a connection's info, decoding its table entry on first use.
    pub fn get(&mut self, id: Guid) -> Option<ConnectionInfo> {
        if let Some(info) = self.resolved.get(&id) {
            return Some(info.clone());
        }
        let data = self.table.get(&id.to_string())?;
        match serde_json::from_slice::<ConnectionInfo>(data) {
            Ok(info) => {
                self.resolved.insert(id, info.clone());
                Some(info)
            }
            Err(e) => {
                tracing::warn!(connection = %id, error = %e, "malformed connection info entry");
                None
            }
        }
    }

    /// Copy resolved info onto a client-side connection object.
    pub fn sync_connection(&mut self, connection: &Connection) -> bool {
        match self.get(connection.id()) {
            Some(info) => {
                connection.replace_info(info);
                true
            }
            None => false,
        }
    }

    pub fn read_update(&mut self, r: &mut ByteReader<'_>) -> Result<(), WireError> {
        self.table.read_update(r, &mut Invalidate(&mut self.resolved))
    }

    pub fn read_snapshot(&mut self, r: &mut ByteReader<'_>) -> Result<(), WireError> {
        self.table.read_snapshot(r, &mut Invalidate(&mut self.resolved))
    }
}
