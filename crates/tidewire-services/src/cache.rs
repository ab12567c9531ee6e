//! Content-addressed download cache.
//!
//! Downloaded files are stored by CRC-32 in a two-level directory layout:
//!   {cache_root}/{crc[0..2]}/{crc}
//!
//! Entries are write-once. If a CRC exists, its content matched that CRC
//! when written; nothing is ever invalidated. The cache outlives sessions,
//! so a file downloaded from one server is reused for any other server
//! advertising the same CRC.
//!
//! A cache with a byte budget refuses new entries once full rather than
//! evicting old ones.

use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{bail, Context, Result};
use bytes::Bytes;

use tidewire_core::checksum::crc32;
use tidewire_core::config::CacheConfig;

use crate::filesystem::RedirectFileSystem;

/// Disambiguates concurrent writers of the same CRC.
static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone)]
pub struct FileCache {
    root: PathBuf,
    /// 0 = unlimited.
    max_bytes: u64,
}

impl FileCache {
    /// Create a cache rooted at the given directory.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .with_context(|| format!("failed to create cache root: {}", root.display()))?;
        Ok(Self { root, max_bytes: 0 })
    }

    /// Create the cache described by `[cache]`.
    pub fn from_config(config: &CacheConfig) -> Result<Self> {
        Ok(Self::new(&config.root)?.with_max_bytes(config.max_bytes))
    }

    pub fn with_max_bytes(mut self, max_bytes: u64) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    pub fn root(&self) -> &std::path::Path {
        &self.root
    }

    pub fn has(&self, crc: u32) -> bool {
        self.path_for(crc).exists()
    }

    pub fn get(&self, crc: u32) -> Result<Option<Bytes>> {
        let path = self.path_for(crc);
        if !path.exists() {
            return Ok(None);
        }
        let data = fs::read(&path)
            .with_context(|| format!("failed to read cached file: {}", path.display()))?;
        Ok(Some(Bytes::from(data)))
    }

    /// Store downloaded bytes for `path` under `crc` and return the cache
    /// file they live in.
    ///
    /// The data must hash to `crc`. Writes go to a temp file and are renamed
    /// into place, so readers never see a partial file. Storing a CRC that
    /// already exists is a no-op. New entries that would push the cache
    /// past its byte budget are refused.
    pub fn store_file(&self, path: &str, crc: u32, data: &[u8]) -> Result<PathBuf> {
        let actual = crc32(data);
        if actual != crc {
            bail!("crc mismatch for {path}: expected {crc:08x}, got {actual:08x}");
        }

        let target = self.path_for(crc);
        if target.exists() {
            return Ok(target);
        }

        if self.max_bytes > 0 {
            let used = self.size();
            if used + data.len() as u64 > self.max_bytes {
                bail!(
                    "cache full: {path} needs {} bytes, {used} of {} used",
                    data.len(),
                    self.max_bytes
                );
            }
        }

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create cache dir: {}", parent.display()))?;
        }

        let tmp = target.with_extension(format!(
            "tmp.{}.{}",
            std::process::id(),
            TMP_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        {
            let mut file = fs::File::create(&tmp)
                .with_context(|| format!("failed to create temp file: {}", tmp.display()))?;
            file.write_all(data).context("failed to write cached file")?;
            file.sync_all().context("failed to sync cached file to disk")?;
        }

        if let Err(e) = fs::rename(&tmp, &target) {
            let _ = fs::remove_file(&tmp);
            return Err(e).with_context(|| {
                format!("failed to rename {} to {}", tmp.display(), target.display())
            });
        }

        tracing::debug!(path, crc = %format!("{crc:08x}"), bytes = data.len(), "file cached");
        Ok(target)
    }

    /// Mount the cached copy of `crc` at `path`, if there is one.
    pub fn try_mount(&self, fs: &RedirectFileSystem, path: &str, crc: u32) -> bool {
        let target = self.path_for(crc);
        if !target.exists() {
            return false;
        }
        fs.mount(path, target);
        true
    }

    fn path_for(&self, crc: u32) -> PathBuf {
        let hex = hex::encode(crc.to_be_bytes());
        self.root.join(&hex[0..2]).join(&hex)
    }

    /// Number of cached files.
    pub fn count(&self) -> usize {
        self.files().count()
    }

    /// Total cached bytes.
    pub fn size(&self) -> u64 {
        self.files()
            .filter_map(|entry| entry.metadata().ok())
            .map(|meta| meta.len())
            .sum()
    }

    fn files(&self) -> impl Iterator<Item = fs::DirEntry> {
        fs::read_dir(&self.root)
            .into_iter()
            .flatten()
            .flatten()
            .filter_map(|dir| fs::read_dir(dir.path()).ok())
            .flat_map(|sub| sub.flatten())
            .filter(|entry| entry.path().extension().is_none())
    }

    pub fn clear(&self) {
        if let Ok(entries) = fs::read_dir(&self.root) {
            for entry in entries.flatten() {
                let _ = fs::remove_dir_all(entry.path());
            }
        }
    }
}
