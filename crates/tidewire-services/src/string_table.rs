//! StringTable — a replicated map of names to opaque byte payloads.
//!
//! The host mutates the table locally and ships either a delta (removals,
//! then changes) or a full snapshot. Clients apply what they receive and
//! are told about it through a `TableObserver`.
//!
//! Delta layout:
//!   i32 removed_count, [string name]*,
//!   i32 changed_count, [string name, i32 len, bytes]*
//!
//! Snapshot layout:
//!   [string name, i32 len, bytes]*, null string
//!
//! A snapshot fires only `on_snapshot`. Consumers that derive state from
//! individual entries must rescan the table there, since no per-entry
//! callbacks are raised.

use bytes::Bytes;
use std::collections::{BTreeMap, BTreeSet};

use tidewire_core::config::TableConfig;
use tidewire_core::message::begin_table_message;
use tidewire_core::wire::MAX_SNAPSHOT_ENTRY;
use tidewire_core::{ByteReader, ByteWriter, MessageType, WireError};

/// A single table entry as seen by observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub name: String,
    pub data: Bytes,
}

/// Receives notifications while a table applies network data.
/// Every method defaults to a no-op.
pub trait TableObserver {
    fn on_change_or_add(&mut self, _entry: &Entry) {}
    fn on_removed(&mut self, _entry: &Entry) {}
    fn on_snapshot(&mut self, _table: &StringTable) {}
    fn post_network_update(&mut self) {}
}

/// Observer for tables nobody needs to watch.
impl TableObserver for () {}

#[derive(Debug, Clone)]
pub struct StringTable {
    name: String,
    entries: BTreeMap<String, Bytes>,
    changed: BTreeSet<String>,
    removed: BTreeSet<String>,
    max_entry_bytes: usize,
}

impl StringTable {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_entry_limit(name, MAX_SNAPSHOT_ENTRY)
    }

    /// A table capped by `[tables] max_snapshot_entry_bytes`.
    pub fn with_config(name: impl Into<String>, config: &TableConfig) -> Self {
        Self::with_entry_limit(name, config.max_snapshot_entry_bytes)
    }

    pub fn with_entry_limit(name: impl Into<String>, max_entry_bytes: usize) -> Self {
        Self {
            name: name.into(),
            entries: BTreeMap::new(),
            changed: BTreeSet::new(),
            removed: BTreeSet::new(),
            max_entry_bytes,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    // ── Local mutation ───────────────────────────────────────────────────────

    pub fn set(&mut self, name: impl Into<String>, data: impl Into<Bytes>) {
        let name = name.into();
        self.removed.remove(&name);
        self.changed.insert(name.clone());
        self.entries.insert(name, data.into());
    }

    /// Remove an entry. Returns false if it wasn't there.
    pub fn remove(&mut self, name: &str) -> bool {
        if self.entries.remove(name).is_none() {
            return false;
        }
        self.changed.remove(name);
        self.removed.insert(name.to_owned());
        true
    }

    pub fn get(&self, name: &str) -> Option<&Bytes> {
        self.entries.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn entries(&self) -> impl Iterator<Item = Entry> + '_ {
        self.entries.iter().map(|(name, data)| Entry {
            name: name.clone(),
            data: data.clone(),
        })
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every entry and all pending change tracking.
    pub fn reset(&mut self) {
        self.entries.clear();
        self.clear_changes();
    }

    // ── Change tracking ──────────────────────────────────────────────────────

    pub fn has_changed(&self, name: &str) -> bool {
        self.changed.contains(name) || self.removed.contains(name)
    }

    pub fn has_any_changes(&self) -> bool {
        !self.changed.is_empty() || !self.removed.is_empty()
    }

    /// Called by the sender once a delta has gone out.
    pub fn clear_changes(&mut self) {
        self.changed.clear();
        self.removed.clear();
    }

    // ── Delta ────────────────────────────────────────────────────────────────

    pub fn build_update_message(&self, w: &mut ByteWriter) {
        w.write_len(self.removed.len());
        for name in &self.removed {
            w.write_string(name);
        }

        // `changed` only ever names live entries; `remove` drops it from the set.
        let changed: Vec<(&String, &Bytes)> = self
            .changed
            .iter()
            .filter_map(|name| self.entries.get_key_value(name))
            .collect();
        w.write_len(changed.len());
        for (name, data) in changed {
            w.write_string(name);
            w.write_bytes(data);
        }
    }

    /// Apply a delta. Removals are applied before changes.
    ///
    /// The whole delta is parsed before anything is applied, so a malformed
    /// one leaves the table and the observer untouched.
    pub fn read_update(
        &mut self,
        r: &mut ByteReader<'_>,
        observer: &mut dyn TableObserver,
    ) -> Result<(), WireError> {
        let removed_count = r.read_len()?;
        let mut removed = Vec::with_capacity(removed_count.min(1024));
        for _ in 0..removed_count {
            removed.push(r.read_string()?);
        }

        let changed_count = r.read_len()?;
        let mut changed = Vec::with_capacity(changed_count.min(1024));
        for _ in 0..changed_count {
            let name = r.read_string()?;
            let data = r.read_bytes(self.max_entry_bytes)?;
            changed.push(Entry { name, data });
        }

        for name in removed {
            if let Some(data) = self.entries.remove(&name) {
                observer.on_removed(&Entry { name, data });
            }
        }
        for entry in changed {
            self.entries.insert(entry.name.clone(), entry.data.clone());
            observer.on_change_or_add(&entry);
        }

        observer.post_network_update();
        Ok(())
    }

    // ── Snapshot ─────────────────────────────────────────────────────────────

    pub fn build_snapshot_message(&self, w: &mut ByteWriter) {
        for (name, data) in &self.entries {
            w.write_string(name);
            w.write_bytes(data);
        }
        w.write_null_string();
    }

    /// Replace the whole table. Only `on_snapshot` fires. A malformed
    /// snapshot leaves the table as it was.
    pub fn read_snapshot(
        &mut self,
        r: &mut ByteReader<'_>,
        observer: &mut dyn TableObserver,
    ) -> Result<(), WireError> {
        let mut entries = BTreeMap::new();
        while let Some(name) = r.read_optional_string()? {
            let data = r.read_bytes(self.max_entry_bytes)?;
            entries.insert(name, data);
        }
        self.reset();
        self.entries = entries;
        observer.on_snapshot(self);
        Ok(())
    }

    // ── Envelopes ────────────────────────────────────────────────────────────

    /// Full outbound delta message: tag, table name, delta body.
    pub fn update_message(&self) -> Bytes {
        let mut w = begin_table_message(MessageType::StringTableUpdate, &self.name);
        self.build_update_message(&mut w);
        w.into_bytes()
    }

    /// Full outbound snapshot message: tag, table name, snapshot body.
    pub fn snapshot_message(&self) -> Bytes {
        let mut w = begin_table_message(MessageType::StringTableSnapshot, &self.name);
        self.build_snapshot_message(&mut w);
        w.into_bytes()
    }
}
