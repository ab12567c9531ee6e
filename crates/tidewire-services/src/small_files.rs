//! Small replicated files, carried inline in the table.
//!
//! Each entry's data is the whole file. Clients mirror the table into a
//! `MemoryFileSystem` that the rest of the game reads from.

use bytes::Bytes;
use std::sync::Arc;

use tidewire_core::{ByteReader, WireError};

use crate::filesystem::{normalize_path, FileSystem, MemoryFileSystem};
use crate::string_table::{Entry, StringTable, TableObserver};

pub const TABLE_NAME: &str = "smallfiles";

/// Largest file accepted inline. Anything bigger belongs in large files.
pub const MAX_SMALL_FILE: usize = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SmallFileError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("{name} is {len} bytes, over the {MAX_SMALL_FILE} byte limit")]
    TooLarge { name: String, len: usize },
}

struct Mirror<'a>(&'a MemoryFileSystem);

impl TableObserver for Mirror<'_> {
    fn on_change_or_add(&mut self, entry: &Entry) {
        self.0.write(&entry.name, entry.data.clone());
    }

    fn on_removed(&mut self, entry: &Entry) {
        self.0.remove(&entry.name);
    }

    fn on_snapshot(&mut self, table: &StringTable) {
        self.0.clear();
        for entry in table.entries() {
            self.0.write(&entry.name, entry.data);
        }
    }
}

pub struct SmallNetworkFiles {
    table: StringTable,
    fs: Arc<MemoryFileSystem>,
}

impl Default for SmallNetworkFiles {
    fn default() -> Self {
        Self::new()
    }
}

impl SmallNetworkFiles {
    pub fn new() -> Self {
        Self {
            table: StringTable::with_entry_limit(TABLE_NAME, MAX_SMALL_FILE),
            fs: Arc::new(MemoryFileSystem::new()),
        }
    }

    pub fn table(&self) -> &StringTable {
        &self.table
    }

    pub fn table_mut(&mut self) -> &mut StringTable {
        &mut self.table
    }

    /// The mirrored files, for mounting into the game's filesystem.
    pub fn filesystem(&self) -> Arc<MemoryFileSystem> {
        self.fs.clone()
    }

    /// Replicate a file read from `source`.
    pub fn add_file(&mut self, name: &str, source: &dyn FileSystem) -> Result<(), SmallFileError> {
        let path = normalize_path(name);
        let data = source
            .read(&path)
            .ok_or_else(|| SmallFileError::NotFound(path.clone()))?;
        self.add_bytes(&path, data)
    }

    pub fn add_bytes(&mut self, name: &str, data: impl Into<Bytes>) -> Result<(), SmallFileError> {
        let data = data.into();
        let path = normalize_path(name);
        if data.len() > MAX_SMALL_FILE {
            return Err(SmallFileError::TooLarge {
                name: path,
                len: data.len(),
            });
        }
        self.table.set(path, data);
        Ok(())
    }

    pub fn remove_file(&mut self, name: &str) -> bool {
        self.table.remove(&normalize_path(name))
    }

    pub fn read_update(&mut self, r: &mut ByteReader<'_>) -> Result<(), WireError> {
        self.table.read_update(r, &mut Mirror(&self.fs))
    }

    pub fn read_snapshot(&mut self, r: &mut ByteReader<'_>) -> Result<(), WireError> {
        self.table.read_snapshot(r, &mut Mirror(&self.fs))
    }
}
