//! Large replicated files — advertised by size and CRC, fetched on demand.
//!
//! The host puts `(size, crc)` for each file into a StringTable. A client
//! receiving an entry checks, in order:
//!   1. a file already mounted with the same size and CRC → nothing to do
//!   2. the path isn't a legal download → silently ignored
//!   3. the CRC is in the content cache → mounted from the cache
//!   4. otherwise → queued
//!
//! The queue is drained one file at a time with `RequestFile` requests on
//! the host connection. Per-file problems (empty response, CRC mismatch,
//! cache write failure, timeout) skip that file. Losing the host aborts the
//! whole drain and leaves the queue as it was for the next attempt.

use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use tidewire_core::config::TidewireConfig;
use tidewire_core::message::RequestFile;
use tidewire_core::{ByteReader, ByteWriter, WireError};

use crate::cache::FileCache;
use crate::connection::{Connection, RequestError};
use crate::filesystem::{normalize_path, FileSystem, RedirectFileSystem};
use crate::string_table::{Entry, StringTable, TableObserver};

pub const TABLE_NAME: &str = "largefiles";

/// Extensions never accepted from a host.
const BLOCKED_EXTENSIONS: &[&str] = &["exe", "dll", "so", "dylib", "bat", "cmd", "sh", "ps1"];

/// Identity of a replicated file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileMeta {
    pub size: u64,
    pub crc: u32,
}

impl FileMeta {
    pub fn encode(&self) -> Bytes {
        let mut w = ByteWriter::with_capacity(12);
        w.write_u64(self.size);
        w.write_u32(self.crc);
        w.into_bytes()
    }

    pub fn decode(data: &[u8]) -> Result<Self, WireError> {
        let mut r = ByteReader::new(data);
        Ok(Self {
            size: r.read_u64()?,
            crc: r.read_u32()?,
        })
    }

    fn matches(&self, fs: &dyn FileSystem, path: &str) -> bool {
        fs.size(path) == Some(self.size) && fs.crc(path) == Some(self.crc)
    }
}

/// Whether a client should accept a file at `path` from a host.
///
/// Rejects empty, absolute and drive-qualified paths, parent traversal and
/// executable extensions.
pub fn is_legal_download(path: &str) -> bool {
    if path.starts_with('/') || path.starts_with('\\') || path.contains(':') {
        return false;
    }
    let norm = normalize_path(path);
    if norm.is_empty() || norm.split('/').any(|seg| seg == "..") {
        return false;
    }
    let ext = norm
        .rsplit('/')
        .next()
        .and_then(|file| file.rsplit_once('.'))
        .map(|(_, ext)| ext.to_ascii_lowercase());
    !ext.is_some_and(|ext| BLOCKED_EXTENSIONS.contains(&ext.as_str()))
}

// ── Errors and outcomes ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LargeFileError {
    #[error("{0} not found in local content")]
    NotFound(String),

    #[error("{0} is not a legal download path")]
    Illegal(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DownloadError {
    /// The host connection went away. Remaining files stay queued.
    #[error("download aborted: {0}")]
    Aborted(RequestError),

    #[error("download cancelled")]
    Cancelled,

    #[error("download queue is already being drained")]
    AlreadyRunning,
}

/// What happened to a table entry on arrival.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountOutcome {
    AlreadyMounted,
    MountedFromCache,
    Queued,
    Ignored,
}

/// What happened to one file pulled off the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileOutcome {
    Downloaded,
    Skipped(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadProgress {
    pub name: String,
    /// One-based position in this drain.
    pub index: usize,
    pub total: usize,
    pub size: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DownloadSummary {
    pub downloaded: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct QueuedFile {
    name: String,
    meta: FileMeta,
}

// ── Store ────────────────────────────────────────────────────────────────────

/// Client-side mount state, shared between the tick and a running drain.
struct FileStore {
    local: Arc<dyn FileSystem>,
    redirect: Arc<RedirectFileSystem>,
    cache: FileCache,
    queue: Mutex<VecDeque<QueuedFile>>,
    draining: AtomicBool,
}

impl FileStore {
    fn add_file_to_filesystem(&self, entry: &Entry, legal: fn(&str) -> bool) -> MountOutcome {
        let meta = match FileMeta::decode(&entry.data) {
            Ok(meta) => meta,
            Err(e) => {
                tracing::warn!(file = %entry.name, error = %e, "malformed large file entry");
                return MountOutcome::Ignored;
            }
        };
        if !legal(&entry.name) {
            return MountOutcome::Ignored;
        }
        let path = normalize_path(&entry.name);

        if meta.matches(self.redirect.as_ref(), &path) || meta.matches(self.local.as_ref(), &path) {
            self.dequeue(&path);
            return MountOutcome::AlreadyMounted;
        }
        if self.cache.try_mount(&self.redirect, &path, meta.crc) {
            self.dequeue(&path);
            return MountOutcome::MountedFromCache;
        }

        // Whatever is mounted there now is the old version.
        self.redirect.unmount(&path);
        let mut queue = self.queue.lock();
        match queue.iter_mut().find(|q| q.name == path) {
            Some(queued) => queued.meta = meta,
            None => queue.push_back(QueuedFile { name: path, meta }),
        }
        MountOutcome::Queued
    }

    fn forget(&self, name: &str) {
        let path = normalize_path(name);
        self.dequeue(&path);
        self.redirect.unmount(&path);
    }

    fn dequeue(&self, path: &str) {
        self.queue.lock().retain(|q| q.name != path);
    }

    /// Remove `file` from the queue if it is still queued with the same
    /// identity. Returns whether it was.
    fn take_if_current(&self, file: &QueuedFile) -> bool {
        let mut queue = self.queue.lock();
        match queue.iter().position(|q| q == file) {
            Some(i) => {
                queue.remove(i);
                true
            }
            None => false,
        }
    }

    fn finish(&self, file: &QueuedFile, data: Bytes) -> FileOutcome {
        let skip = |reason: String| {
            tracing::warn!(file = %file.name, reason = %reason, "skipping download");
            self.take_if_current(file);
            FileOutcome::Skipped(reason)
        };

        if data.is_empty() {
            return skip("host returned an empty response".into());
        }
        if data.len() as u64 != file.meta.size {
            return skip(format!(
                "size mismatch: expected {}, got {}",
                file.meta.size,
                data.len()
            ));
        }
        let target = match self.cache.store_file(&file.name, file.meta.crc, &data) {
            Ok(target) => target,
            Err(e) => return skip(format!("{e:#}")),
        };

        // The entry may have been removed or replaced while we waited.
        if self.take_if_current(file) {
            self.redirect.mount(&file.name, target);
        }
        tracing::info!(file = %file.name, bytes = data.len(), "downloaded");
        FileOutcome::Downloaded
    }
}

/// Resets the draining flag when a drain ends, including by being dropped.
struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Routes table callbacks into the store.
struct Mounter<'a> {
    store: &'a FileStore,
    legal: fn(&str) -> bool,
}

impl TableObserver for Mounter<'_> {
    fn on_change_or_add(&mut self, entry: &Entry) {
        self.store.add_file_to_filesystem(entry, self.legal);
    }

    fn on_removed(&mut self, entry: &Entry) {
        self.store.forget(&entry.name);
    }

    fn on_snapshot(&mut self, table: &StringTable) {
        self.store.queue.lock().clear();
        for entry in table.entries() {
            self.store.add_file_to_filesystem(&entry, self.legal);
        }
    }
}

// ── LargeNetworkFiles ────────────────────────────────────────────────────────

pub struct LargeNetworkFiles {
    table: StringTable,
    store: Arc<FileStore>,
    legal: fn(&str) -> bool,
}

impl LargeNetworkFiles {
    /// `local` is the content this side already has: the host's files to
    /// advertise, or the client's own mounted content.
    pub fn new(
        local: Arc<dyn FileSystem>,
        redirect: Arc<RedirectFileSystem>,
        cache: FileCache,
    ) -> Self {
        Self {
            table: StringTable::new(TABLE_NAME),
            store: Arc::new(FileStore {
                local,
                redirect,
                cache,
                queue: Mutex::new(VecDeque::new()),
                draining: AtomicBool::new(false),
            }),
            legal: is_legal_download,
        }
    }

    /// Build from config: the cache comes from `[cache]`, the table's
    /// entry cap from `[tables]`.
    pub fn from_config(
        config: &TidewireConfig,
        local: Arc<dyn FileSystem>,
        redirect: Arc<RedirectFileSystem>,
    ) -> anyhow::Result<Self> {
        let mut files = Self::new(local, redirect, FileCache::from_config(&config.cache)?);
        files.table = StringTable::with_config(TABLE_NAME, &config.tables);
        Ok(files)
    }

    /// Replace the download path filter.
    pub fn with_legality(mut self, legal: fn(&str) -> bool) -> Self {
        self.legal = legal;
        self
    }

    pub fn table(&self) -> &StringTable {
        &self.table
    }

    pub fn table_mut(&mut self) -> &mut StringTable {
        &mut self.table
    }

    // ── Host ─────────────────────────────────────────────────────────────────

    /// Advertise a local file.
    pub fn add_file(&mut self, name: &str) -> Result<FileMeta, LargeFileError> {
        let path = normalize_path(name);
        if path.is_empty() {
            return Err(LargeFileError::Illegal(name.to_owned()));
        }
        let local = &self.store.local;
        let (Some(size), Some(crc)) = (local.size(&path), local.crc(&path)) else {
            return Err(LargeFileError::NotFound(path));
        };
        let meta = FileMeta { size, crc };
        tracing::debug!(file = %path, size, crc = %format!("{crc:08x}"), "advertising large file");
        self.table.set(path, meta.encode());
        Ok(meta)
    }

    pub fn remove_file(&mut self, name: &str) -> bool {
        self.table.remove(&normalize_path(name))
    }

    /// Answer a client's `RequestFile`. Unknown or unreadable files get an
    /// empty response.
    pub fn serve_file_request(&self, req: &RequestFile) -> Bytes {
        let path = normalize_path(&req.filename);
        if !self.table.contains(&path) {
            tracing::warn!(file = %path, "request for a file that isn't advertised");
            return Bytes::new();
        }
        match self.store.local.read(&path) {
            Some(data) => data,
            None => {
                tracing::warn!(file = %path, "advertised file is missing locally");
                Bytes::new()
            }
        }
    }

    // ── Client ───────────────────────────────────────────────────────────────

    pub fn read_update(&mut self, r: &mut ByteReader<'_>) -> Result<(), WireError> {
        let mut mounter = Mounter {
            store: &self.store,
            legal: self.legal,
        };
        self.table.read_update(r, &mut mounter)
    }

    /// Apply a snapshot; every entry is rescanned afterwards.
    pub fn read_snapshot(&mut self, r: &mut ByteReader<'_>) -> Result<(), WireError> {
        let mut mounter = Mounter {
            store: &self.store,
            legal: self.legal,
        };
        self.table.read_snapshot(r, &mut mounter)
    }

    pub fn add_file_to_filesystem(&self, entry: &Entry) -> MountOutcome {
        self.store.add_file_to_filesystem(entry, self.legal)
    }

    /// Rescan every entry, e.g. after local content changed.
    pub fn refresh(&self) {
        Mounter {
            store: &self.store,
            legal: self.legal,
        }
        .on_snapshot(&self.table);
    }

    /// Names waiting to be downloaded, in order.
    pub fn queued(&self) -> Vec<String> {
        self.store.queue.lock().iter().map(|q| q.name.clone()).collect()
    }

    pub fn is_downloading(&self) -> bool {
        self.store.draining.load(Ordering::Acquire)
    }

    /// Handle for draining the queue from another task.
    pub fn downloader(&self) -> Downloader {
        Downloader {
            store: self.store.clone(),
        }
    }

    pub async fn run_download_queue(
        &self,
        host: &Connection,
        cancel: &CancellationToken,
        progress: impl FnMut(&DownloadProgress),
    ) -> Result<DownloadSummary, DownloadError> {
        self.downloader().run(host, cancel, progress).await
    }
}

/// Drains the download queue. Cheap to clone; only one drain runs at a time.
#[derive(Clone)]
pub struct Downloader {
    store: Arc<FileStore>,
}

impl Downloader {
    pub async fn run(
        &self,
        host: &Connection,
        cancel: &CancellationToken,
        mut progress: impl FnMut(&DownloadProgress),
    ) -> Result<DownloadSummary, DownloadError> {
        if self.store.draining.swap(true, Ordering::AcqRel) {
            return Err(DownloadError::AlreadyRunning);
        }
        let _guard = DrainGuard(&self.store.draining);

        let mut summary = DownloadSummary::default();
        let mut total = self.store.queue.lock().len();
        let mut index = 0;

        loop {
            let Some(file) = self.store.queue.lock().front().cloned() else {
                break;
            };
            index += 1;
            total = total.max(index);
            progress(&DownloadProgress {
                name: file.name.clone(),
                index,
                total,
                size: file.meta.size,
            });

            let req = RequestFile {
                filename: file.name.clone(),
            };
            match host.request(&req, cancel).await {
                Ok(data) => match self.store.finish(&file, data) {
                    FileOutcome::Downloaded => summary.downloaded += 1,
                    FileOutcome::Skipped(_) => summary.skipped += 1,
                },
                Err(RequestError::Cancelled) => return Err(DownloadError::Cancelled),
                Err(RequestError::Timeout) => {
                    tracing::warn!(file = %file.name, "download timed out, skipping");
                    self.store.take_if_current(&file);
                    summary.skipped += 1;
                }
                Err(e) => {
                    tracing::warn!(file = %file.name, error = %e, "host lost, aborting downloads");
                    return Err(DownloadError::Aborted(e));
                }
            }
        }

        tracing::info!(
            downloaded = summary.downloaded,
            skipped = summary.skipped,
            "download queue drained"
        );
        Ok(summary)
    }
}
