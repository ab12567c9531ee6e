//! tidewire-services — connections, replicated tables and the file and
//! package services built on them.

pub mod cache;
pub mod chunk;
pub mod connection;
pub mod connection_info;
pub mod context;
pub mod dispatch;
pub mod filesystem;
pub mod input;
pub mod large_files;
pub mod network_table;
pub mod packages;
pub mod small_files;
pub mod string_table;
pub mod transport;

pub use connection::{ChannelState, Connection, ConnectionTable, RequestError, SendError};
pub use context::NetContext;
pub use dispatch::{Dispatched, MessageDispatcher, MessageInbox};
pub use large_files::LargeNetworkFiles;
pub use network_table::NetworkTable;
pub use packages::ServerPackages;
pub use small_files::SmallNetworkFiles;
pub use string_table::StringTable;
pub use transport::{ChannelTransport, MessageTransport};
