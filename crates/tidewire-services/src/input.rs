//! Input edge tracking for client user commands.
//!
//! A client sends one `UserCommand` per tick carrying the bitmask of held
//! actions. The host keeps the last accepted command and folds the
//! difference into two edge accumulators, one read from per-frame update
//! code and one from fixed-step simulation. Each side clears its own
//! accumulator, so a press is seen exactly once by each.

use std::collections::HashMap;

use tidewire_core::message::UserCommand;

/// Largest forward step between two accepted command numbers.
/// Anything further ahead is treated as having wrapped around behind us.
const MAX_COMMAND_DELTA: u32 = 0x7FFF_FFFF;

/// Which edge accumulator a query reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputContext {
    Update,
    FixedUpdate,
}

#[derive(Debug, Default, Clone, Copy)]
struct Edges {
    pressed: u64,
    released: u64,
}

impl Edges {
    fn clear(&mut self) {
        *self = Edges::default();
    }
}

/// Double-buffered edge detector for one connection.
#[derive(Debug, Default)]
pub struct InputState {
    last: Option<UserCommand>,
    update: Edges,
    fixed: Edges,
}

impl InputState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold a command into the edge accumulators.
    ///
    /// Returns `false` for a stale or duplicate command, which leaves every
    /// piece of state untouched.
    pub fn apply_user_command(&mut self, cmd: UserCommand) -> bool {
        let held = match self.last {
            Some(last) => {
                let delta = cmd.command_number.wrapping_sub(last.command_number);
                if delta == 0 || delta > MAX_COMMAND_DELTA {
                    return false;
                }
                last.actions
            }
            None => 0,
        };

        let pressed = !held & cmd.actions;
        let released = held & !cmd.actions;
        for edges in [&mut self.update, &mut self.fixed] {
            edges.pressed |= pressed;
            edges.released |= released;
        }
        self.last = Some(cmd);
        true
    }

    /// Held actions as of the last accepted command.
    pub fn actions(&self) -> u64 {
        self.last.map(|c| c.actions).unwrap_or(0)
    }

    pub fn last_command_number(&self) -> Option<u32> {
        self.last.map(|c| c.command_number)
    }

    pub fn down(&self, bit: u32) -> bool {
        self.actions() & mask(bit) != 0
    }

    pub fn pressed(&self, bit: u32, ctx: InputContext) -> bool {
        self.edges(ctx).pressed & mask(bit) != 0
    }

    pub fn released(&self, bit: u32, ctx: InputContext) -> bool {
        self.edges(ctx).released & mask(bit) != 0
    }

    pub fn clear_update_context(&mut self) {
        self.update.clear();
    }

    pub fn clear_fixed_update_context(&mut self) {
        self.fixed.clear();
    }

    /// Forget the baseline and both accumulators.
    pub fn reset(&mut self) {
        *self = InputState::default();
    }

    fn edges(&self, ctx: InputContext) -> &Edges {
        match ctx {
            InputContext::Update => &self.update,
            InputContext::FixedUpdate => &self.fixed,
        }
    }
}

fn mask(bit: u32) -> u64 {
    1u64.checked_shl(bit).unwrap_or(0)
}

// ── Action registry ──────────────────────────────────────────────────────────

/// Maps action names to bit indices in `UserCommand::actions`.
///
/// Built once from the game's action list; indices never change for the
/// lifetime of the registry, so both peers must build it from the same list.
#[derive(Debug, Default, Clone)]
pub struct ActionRegistry {
    indices: HashMap<String, u32>,
}

impl ActionRegistry {
    /// Only the first 64 names fit in the action mask; the rest are dropped.
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut indices = HashMap::new();
        for name in names {
            let name = name.into();
            if indices.contains_key(&name) {
                continue;
            }
            let index = indices.len() as u32;
            if index >= u64::BITS {
                tracing::warn!(action = %name, "action mask is full, ignoring action");
                continue;
            }
            indices.insert(name, index);
        }
        Self { indices }
    }

    pub fn index_of(&self, action: &str) -> Option<u32> {
        self.indices.get(action).copied()
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// Build an action mask from held action names. Unknown names are ignored.
    pub fn mask_of<'a, I>(&self, held: I) -> u64
    where
        I: IntoIterator<Item = &'a str>,
    {
        held.into_iter()
            .filter_map(|name| self.index_of(name))
            .fold(0, |acc, bit| acc | mask(bit))
    }
}

/// Live input of the local player, read directly on the host's
/// self-connection instead of going through user commands.
pub trait LocalInput: Send + Sync {
    fn down(&self, action: &str) -> bool;
    fn pressed(&self, action: &str, ctx: InputContext) -> bool;
    fn released(&self, action: &str, ctx: InputContext) -> bool;
}
