//! NetworkTable — a fixed set of typed value slots with one owner each.
//!
//! Each slot is a getter/setter pair over some live value plus a cached
//! copy of the last value seen or sent. The side that controls a slot
//! detects changes by polling its getters; the other side only ever applies
//! incoming values. Applying an incoming value also refreshes the cache, so
//! the next poll sees no difference and nothing is echoed back.
//!
//! Wire: `i32 count, [i32 slot, i32 len, json]*`.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::any::Any;
use std::collections::{BTreeSet, HashMap};

use tidewire_core::message::begin_table_message;
use tidewire_core::{ByteReader, ByteWriter, MessageType, WireError};

pub type SlotId = i32;

/// Values a slot can carry.
pub trait SlotValue: Serialize + DeserializeOwned + PartialEq + Clone + Send + 'static {}

impl<T> SlotValue for T where
    T: Serialize + DeserializeOwned + PartialEq + Clone + Send + 'static
{
}

/// Upper bound on one encoded slot value.
const MAX_SLOT_BYTES: usize = 1024 * 1024;

trait Slot: Send {
    /// Re-read the live value. True if it differed from the cache.
    fn poll(&mut self) -> bool;
    fn encode(&self) -> Result<Vec<u8>, WireError>;
    /// Decode, push to the live setter and refresh the cache.
    fn apply(&mut self, data: &[u8]) -> Result<(), WireError>;
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

struct TypedSlot<T> {
    getter: Box<dyn Fn() -> T + Send>,
    setter: Box<dyn FnMut(T) + Send>,
    cached: T,
}

impl<T: SlotValue> Slot for TypedSlot<T> {
    fn poll(&mut self) -> bool {
        let live = (self.getter)();
        if live == self.cached {
            return false;
        }
        self.cached = live;
        true
    }

    fn encode(&self) -> Result<Vec<u8>, WireError> {
        serde_json::to_vec(&self.cached).map_err(|e| WireError::Body(e.to_string()))
    }

    fn apply(&mut self, data: &[u8]) -> Result<(), WireError> {
        let value: T = serde_json::from_slice(data).map_err(|e| WireError::Body(e.to_string()))?;
        self.cached = value.clone();
        (self.setter)(value);
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SlotError {
    #[error("slot {0} is already registered")]
    Duplicate(SlotId),
}

pub struct NetworkTable {
    name: String,
    order: Vec<SlotId>,
    slots: HashMap<SlotId, Box<dyn Slot>>,
    changed: BTreeSet<SlotId>,
    authority: Box<dyn Fn(SlotId) -> bool + Send>,
}

impl NetworkTable {
    /// `authority` answers whether this side controls a slot.
    pub fn new(
        name: impl Into<String>,
        authority: impl Fn(SlotId) -> bool + Send + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            order: Vec::new(),
            slots: HashMap::new(),
            changed: BTreeSet::new(),
            authority: Box::new(authority),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Add a slot. The getter is read once to seed the cache.
    pub fn register<T: SlotValue>(
        &mut self,
        slot: SlotId,
        getter: impl Fn() -> T + Send + 'static,
        setter: impl FnMut(T) + Send + 'static,
    ) -> Result<(), SlotError> {
        if self.slots.contains_key(&slot) {
            return Err(SlotError::Duplicate(slot));
        }
        let cached = getter();
        self.slots.insert(
            slot,
            Box::new(TypedSlot {
                getter: Box::new(getter),
                setter: Box::new(setter),
                cached,
            }),
        );
        self.order.push(slot);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn has_control(&self, slot: SlotId) -> bool {
        (self.authority)(slot)
    }

    pub fn has_changed(&self, slot: SlotId) -> bool {
        self.changed.contains(&slot)
    }

    pub fn has_any_changes(&self) -> bool {
        !self.changed.is_empty()
    }

    /// Poll every live getter. Controlled slots that differ from their cache
    /// are marked changed; uncontrolled ones just refresh the cache.
    pub fn query_values(&mut self) {
        for id in &self.order {
            let Some(slot) = self.slots.get_mut(id) else {
                continue;
            };
            if slot.poll() && (self.authority)(*id) {
                self.changed.insert(*id);
            }
        }
    }

    /// Cached value of a slot, if it exists and holds a `T`.
    pub fn get_value<T: SlotValue>(&self, slot: SlotId) -> Option<T> {
        self.slots
            .get(&slot)?
            .as_any()
            .downcast_ref::<TypedSlot<T>>()
            .map(|s| s.cached.clone())
    }

    /// Set a controlled slot: updates the cache, calls the live setter and
    /// marks the slot changed, even when the value is unchanged. Refused for
    /// slots this side doesn't control or of a different type.
    pub fn set_value<T: SlotValue>(&mut self, slot: SlotId, value: T) -> bool {
        if !self.has_control(slot) {
            return false;
        }
        let Some(typed) = self
            .slots
            .get_mut(&slot)
            .and_then(|s| s.as_any_mut().downcast_mut::<TypedSlot<T>>())
        else {
            return false;
        };
        self.changed.insert(slot);
        typed.cached = value.clone();
        (typed.setter)(value);
        true
    }

    // ── Wire ─────────────────────────────────────────────────────────────────

    /// Write changed slots and clear the changed set.
    pub fn write_changed(&mut self, w: &mut ByteWriter) -> Result<(), WireError> {
        let ids: Vec<SlotId> = self
            .order
            .iter()
            .copied()
            .filter(|id| self.changed.contains(id))
            .collect();
        self.write_slots(&ids, w)?;
        self.changed.clear();
        Ok(())
    }

    /// Write every slot regardless of change state.
    pub fn write_all(&self, w: &mut ByteWriter) -> Result<(), WireError> {
        self.write_slots(&self.order, w)
    }

    fn write_slots(&self, ids: &[SlotId], w: &mut ByteWriter) -> Result<(), WireError> {
        let mut body = ByteWriter::new();
        let mut count = 0usize;
        for id in ids {
            if let Some(slot) = self.slots.get(id) {
                body.write_i32(*id);
                body.write_bytes(&slot.encode()?);
                count += 1;
            }
        }
        w.write_len(count);
        w.write_raw(body.as_slice());
        Ok(())
    }

    /// Apply incoming values. Nothing applied here is marked changed.
    /// Slots this side controls or doesn't know are skipped.
    pub fn read(&mut self, r: &mut ByteReader<'_>) -> Result<(), WireError> {
        let count = r.read_len()?;
        for _ in 0..count {
            let id = r.read_i32()?;
            let data = r.read_bytes(MAX_SLOT_BYTES)?;

            if (self.authority)(id) {
                tracing::debug!(table = %self.name, slot = id, "ignoring update for owned slot");
                continue;
            }
            match self.slots.get_mut(&id) {
                Some(slot) => slot.apply(&data)?,
                None => {
                    tracing::warn!(table = %self.name, slot = id, "update for unknown slot");
                }
            }
        }
        Ok(())
    }

    /// Outbound message with the changed slots, or `None` if nothing changed.
    pub fn update_message(&mut self) -> Result<Option<bytes::Bytes>, WireError> {
        if !self.has_any_changes() {
            return Ok(None);
        }
        let mut w = begin_table_message(MessageType::NetworkTableUpdate, &self.name);
        self.write_changed(&mut w)?;
        Ok(Some(w.into_bytes()))
    }

    /// Outbound message with every slot, sent to a joining peer.
    pub fn full_message(&self) -> Result<bytes::Bytes, WireError> {
        let mut w = begin_table_message(MessageType::NetworkTableUpdate, &self.name);
        self.write_all(&mut w)?;
        Ok(w.into_bytes())
    }
}
