//! Filesystem views used by replicated files.
//!
//! Logical paths are forward-slash, relative and case-sensitive. Three
//! implementations cover the cases replication needs:
//!   - `LocalFileSystem` reads from a directory on disk (the host's content)
//!   - `MemoryFileSystem` holds small replicated files entirely in memory
//!   - `RedirectFileSystem` maps logical paths onto cached download files

use bytes::Bytes;
use dashmap::DashMap;
use std::path::{Component, Path, PathBuf};

use tidewire_core::checksum::{self, crc32};

pub trait FileSystem: Send + Sync {
    fn read(&self, path: &str) -> Option<Bytes>;

    fn exists(&self, path: &str) -> bool {
        self.size(path).is_some()
    }

    fn size(&self, path: &str) -> Option<u64>;

    fn crc(&self, path: &str) -> Option<u32> {
        self.read(path).map(|data| crc32(&data))
    }
}

/// Normalize a logical path: backslashes to forward slashes, no leading
/// slash, no empty or `.` segments.
pub fn normalize_path(path: &str) -> String {
    path.replace('\\', "/")
        .split('/')
        .filter(|seg| !seg.is_empty() && *seg != ".")
        .collect::<Vec<_>>()
        .join("/")
}

/// Resolve a logical path under `root`, refusing anything that would
/// escape it.
fn resolve_under(root: &Path, path: &str) -> Option<PathBuf> {
    let rel = PathBuf::from(normalize_path(path));
    if rel.as_os_str().is_empty() {
        return None;
    }
    if rel.components().any(|c| !matches!(c, Component::Normal(_))) {
        return None;
    }
    Some(root.join(rel))
}

// ── Local ────────────────────────────────────────────────────────────────────

/// Read-only view of a directory.
#[derive(Debug, Clone)]
pub struct LocalFileSystem {
    root: PathBuf,
}

impl LocalFileSystem {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl FileSystem for LocalFileSystem {
    fn read(&self, path: &str) -> Option<Bytes> {
        let full = resolve_under(&self.root, path)?;
        std::fs::read(full).ok().map(Bytes::from)
    }

    fn size(&self, path: &str) -> Option<u64> {
        let full = resolve_under(&self.root, path)?;
        let meta = std::fs::metadata(full).ok()?;
        meta.is_file().then(|| meta.len())
    }

    fn crc(&self, path: &str) -> Option<u32> {
        let full = resolve_under(&self.root, path)?;
        checksum::file_size_and_crc(&full).ok().map(|(_, crc)| crc)
    }
}

// ── Memory ───────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct MemoryFileSystem {
    files: DashMap<String, Bytes>,
}

impl MemoryFileSystem {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write(&self, path: &str, data: Bytes) {
        self.files.insert(normalize_path(path), data);
    }

    pub fn remove(&self, path: &str) -> bool {
        self.files.remove(&normalize_path(path)).is_some()
    }

    pub fn clear(&self) {
        self.files.clear();
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.files.iter().map(|e| e.key().clone()).collect();
        paths.sort();
        paths
    }
}

impl FileSystem for MemoryFileSystem {
    fn read(&self, path: &str) -> Option<Bytes> {
        self.files.get(&normalize_path(path)).map(|e| e.value().clone())
    }

    fn size(&self, path: &str) -> Option<u64> {
        self.files
            .get(&normalize_path(path))
            .map(|e| e.value().len() as u64)
    }
}

// ── Redirect ─────────────────────────────────────────────────────────────────

/// Logical paths mounted onto arbitrary files on disk.
#[derive(Debug, Default)]
pub struct RedirectFileSystem {
    redirects: DashMap<String, PathBuf>,
}

impl RedirectFileSystem {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mount `target` at `path`, replacing any previous mount.
    pub fn mount(&self, path: &str, target: impl Into<PathBuf>) {
        let target = target.into();
        tracing::debug!(path, target = %target.display(), "mounted file");
        self.redirects.insert(normalize_path(path), target);
    }

    pub fn unmount(&self, path: &str) -> bool {
        self.redirects.remove(&normalize_path(path)).is_some()
    }

    pub fn resolve(&self, path: &str) -> Option<PathBuf> {
        self.redirects
            .get(&normalize_path(path))
            .map(|e| e.value().clone())
    }

    pub fn len(&self) -> usize {
        self.redirects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.redirects.is_empty()
    }
}

impl FileSystem for RedirectFileSystem {
    fn read(&self, path: &str) -> Option<Bytes> {
        std::fs::read(self.resolve(path)?).ok().map(Bytes::from)
    }

    fn size(&self, path: &str) -> Option<u64> {
        std::fs::metadata(self.resolve(path)?).ok().map(|m| m.len())
    }

    fn crc(&self, path: &str) -> Option<u32> {
        checksum::file_size_and_crc(&self.resolve(path)?)
            .ok()
            .map(|(_, crc)| crc)
    }
}
