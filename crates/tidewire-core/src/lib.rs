//! tidewire-core — byte stream, wire constants, message envelope, checksums
//! and configuration. All other Tidewire crates depend on this one.

pub mod checksum;
pub mod config;
pub mod message;
pub mod wire;

pub use checksum::Guid;
pub use message::{MessageType, NetFlags, NetMessage};
pub use wire::{ByteReader, ByteWriter, WireError};
