//! Server packages — the content packages a client must install to join.
//!
//! The host lists package idents in a StringTable. Each ident a client
//! sees is installed through `PackageInstaller`, which runs at most one
//! fetch per ident no matter how many callers ask: the first caller starts
//! the fetch and stores it as a shared future, later callers await that
//! same future.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use tidewire_core::config::{PackageConfig, TidewireConfig};
use tidewire_core::{ByteReader, WireError};

use crate::filesystem::{FileSystem, LocalFileSystem};
use crate::string_table::{Entry, StringTable, TableObserver};

pub const TABLE_NAME: &str = "serverpackages";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PackageError {
    #[error("package {0} not found")]
    NotFound(String),

    #[error("fetching {ident} failed: {reason}")]
    Failed { ident: String, reason: String },

    #[error("install cancelled")]
    Cancelled,
}

/// Fetches and unpacks a package, returning its mounted contents.
#[async_trait]
pub trait PackageFetcher: Send + Sync {
    async fn fetch(
        &self,
        ident: &str,
        cancel: &CancellationToken,
    ) -> Result<Arc<dyn FileSystem>, PackageError>;
}

type FetchResult = Result<Arc<dyn FileSystem>, PackageError>;

/// Mounts packages already unpacked under an install root, one directory
/// per ident: `{install_root}/{ident}/...`.
#[derive(Debug, Clone)]
pub struct InstalledPackages {
    root: PathBuf,
}

impl InstalledPackages {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn from_config(config: &PackageConfig) -> Self {
        Self::new(&config.install_root)
    }

    pub fn root(&self) -> &std::path::Path {
        &self.root
    }
}

/// An ident names exactly one directory under the install root.
fn is_plain_ident(ident: &str) -> bool {
    !ident.is_empty()
        && ident != "."
        && ident != ".."
        && !ident.contains(['/', '\\', ':'])
}

#[async_trait]
impl PackageFetcher for InstalledPackages {
    async fn fetch(
        &self,
        ident: &str,
        cancel: &CancellationToken,
    ) -> Result<Arc<dyn FileSystem>, PackageError> {
        if !is_plain_ident(ident) {
            return Err(PackageError::NotFound(ident.to_owned()));
        }
        let dir = self.root.join(ident);
        let meta = tokio::select! {
            _ = cancel.cancelled() => return Err(PackageError::Cancelled),
            meta = tokio::fs::metadata(&dir) => meta,
        };
        match meta {
            Ok(meta) if meta.is_dir() => Ok(Arc::new(LocalFileSystem::new(dir))),
            Ok(_) => Err(PackageError::Failed {
                ident: ident.to_owned(),
                reason: format!("{} is not a directory", dir.display()),
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(PackageError::NotFound(ident.to_owned()))
            }
            Err(e) => Err(PackageError::Failed {
                ident: ident.to_owned(),
                reason: e.to_string(),
            }),
        }
    }
}

// ── PackageDownload ──────────────────────────────────────────────────────────

/// One package's install state. Shared by every caller asking for it.
pub struct PackageDownload {
    ident: String,
    fetch: Shared<BoxFuture<'static, FetchResult>>,
    /// Child of the starting caller's token; cancelled when that caller is.
    token: CancellationToken,
    active_package: Mutex<Option<Arc<dyn FileSystem>>>,
    error: Mutex<Option<PackageError>>,
}

impl PackageDownload {
    pub fn ident(&self) -> &str {
        &self.ident
    }

    pub fn active_package(&self) -> Option<Arc<dyn FileSystem>> {
        self.active_package.lock().clone()
    }

    pub fn is_errored(&self) -> bool {
        self.error.lock().is_some()
    }

    pub fn error(&self) -> Option<PackageError> {
        self.error.lock().clone()
    }

    pub fn is_downloading(&self) -> bool {
        self.fetch.peek().is_none()
    }
}

impl std::fmt::Debug for PackageDownload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PackageDownload")
            .field("ident", &self.ident)
            .field("mounted", &self.active_package.lock().is_some())
            .field("error", &self.error.lock())
            .finish()
    }
}

// ── PackageInstaller ─────────────────────────────────────────────────────────

pub struct PackageInstaller {
    fetcher: Arc<dyn PackageFetcher>,
    downloads: DashMap<String, Arc<PackageDownload>>,
}

impl PackageInstaller {
    pub fn new(fetcher: Arc<dyn PackageFetcher>) -> Self {
        Self {
            fetcher,
            downloads: DashMap::new(),
        }
    }

    pub fn get(&self, ident: &str) -> Option<Arc<PackageDownload>> {
        self.downloads.get(ident).map(|d| d.value().clone())
    }

    /// Install `ident` and return its contents.
    ///
    /// Concurrent callers share one fetch. A failed install stays failed and
    /// returns `None` until `forget` is called. Cancelling the caller that
    /// started a fetch cancels the fetch and drops its entry.
    pub async fn download_and_mount(
        &self,
        ident: &str,
        cancel: &CancellationToken,
    ) -> Option<Arc<dyn FileSystem>> {
        loop {
            let download = self.get_or_start(ident, cancel);
            if let Some(fs) = download.active_package() {
                return Some(fs);
            }
            if download.is_errored() {
                return None;
            }

            let result = tokio::select! {
                _ = cancel.cancelled() => {
                    // Only the caller that started the fetch takes it down.
                    // A joiner giving up leaves it running for the others.
                    if download.token.is_cancelled() {
                        self.abandon(&download);
                    }
                    return None;
                }
                r = download.fetch.clone() => r,
            };

            match result {
                Ok(fs) => {
                    *download.active_package.lock() = Some(fs.clone());
                    return Some(fs);
                }
                Err(PackageError::Cancelled) => {
                    self.abandon(&download);
                    if cancel.is_cancelled() {
                        return None;
                    }
                    // Another caller started this fetch and gave up on it.
                    tracing::debug!(package = ident, "shared fetch was cancelled, restarting");
                }
                Err(e) => {
                    tracing::warn!(package = ident, error = %e, "package install failed");
                    *download.error.lock() = Some(e);
                    return None;
                }
            }
        }
    }

    /// Drop any state for `ident`, allowing a fresh attempt.
    pub fn forget(&self, ident: &str) -> bool {
        self.downloads.remove(ident).is_some()
    }

    fn get_or_start(&self, ident: &str, cancel: &CancellationToken) -> Arc<PackageDownload> {
        self.downloads
            .entry(ident.to_owned())
            .or_insert_with(|| Arc::new(self.start(ident, cancel)))
            .value()
            .clone()
    }

    fn start(&self, ident: &str, cancel: &CancellationToken) -> PackageDownload {
        tracing::info!(package = ident, "fetching package");
        let token = cancel.child_token();
        let fetch_token = token.clone();
        let fetcher = self.fetcher.clone();
        let owned = ident.to_owned();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = fetch_token.cancelled() => Err(PackageError::Cancelled),
                r = fetcher.fetch(&owned, &fetch_token) => r,
            }
        });

        let failed_ident = ident.to_owned();
        let fetch = async move {
            match handle.await {
                Ok(result) => result,
                Err(e) => Err(PackageError::Failed {
                    ident: failed_ident,
                    reason: e.to_string(),
                }),
            }
        }
        .boxed()
        .shared();

        PackageDownload {
            ident: ident.to_owned(),
            fetch,
            token,
            active_package: Mutex::new(None),
            error: Mutex::new(None),
        }
    }

    fn abandon(&self, download: &Arc<PackageDownload>) {
        self.downloads
            .remove_if(&download.ident, |_, current| Arc::ptr_eq(current, download));
    }
}

// ── ServerPackages ───────────────────────────────────────────────────────────

/// Collects idents that need installing.
struct Required<'a>(&'a mut Vec<String>);

impl Required<'_> {
    fn push(&mut self, ident: &str) {
        if !self.0.iter().any(|p| p == ident) {
            self.0.push(ident.to_owned());
        }
    }
}

impl TableObserver for Required<'_> {
    fn on_change_or_add(&mut self, entry: &Entry) {
        self.push(&entry.name);
    }

    fn on_removed(&mut self, entry: &Entry) {
        self.0.retain(|p| p != &entry.name);
    }

    fn on_snapshot(&mut self, table: &StringTable) {
        self.0.clear();
        for ident in table.names() {
            self.push(ident);
        }
    }
}

pub struct ServerPackages {
    table: StringTable,
    installer: Arc<PackageInstaller>,
    pending: Vec<String>,
}

impl ServerPackages {
    pub fn new(fetcher: Arc<dyn PackageFetcher>) -> Self {
        Self {
            table: StringTable::new(TABLE_NAME),
            installer: Arc::new(PackageInstaller::new(fetcher)),
            pending: Vec::new(),
        }
    }

    /// Install from `[packages] install_root`, with the table capped by
    /// `[tables]`.
    pub fn from_config(config: &TidewireConfig) -> Self {
        let mut packages = Self::new(Arc::new(InstalledPackages::from_config(&config.packages)));
        packages.table = StringTable::with_config(TABLE_NAME, &config.tables);
        packages
    }

    pub fn table(&self) -> &StringTable {
        &self.table
    }

    pub fn table_mut(&mut self) -> &mut StringTable {
        &mut self.table
    }

    pub fn installer(&self) -> Arc<PackageInstaller> {
        self.installer.clone()
    }

    /// Require clients to install `ident`.
    pub fn add_package(&mut self, ident: &str) {
        self.table.set(ident, Bytes::new());
    }

    pub fn remove_package(&mut self, ident: &str) -> bool {
        self.table.remove(ident)
    }

    pub fn read_update(&mut self, r: &mut ByteReader<'_>) -> Result<(), WireError> {
        self.table.read_update(r, &mut Required(&mut self.pending))
    }

    pub fn read_snapshot(&mut self, r: &mut ByteReader<'_>) -> Result<(), WireError> {
        self.table.read_snapshot(r, &mut Required(&mut self.pending))
    }

    /// Idents received since the last call that haven't been installed.
    pub fn take_pending(&mut self) -> Vec<String> {
        std::mem::take(&mut self.pending)
    }

    pub async fn client_install_package(&self, ident: &str, cancel: &CancellationToken) -> bool {
        install(&self.installer, ident, cancel).await
    }

    /// Start an install task for every pending ident.
    pub fn spawn_pending_installs(&mut self, cancel: &CancellationToken) -> Vec<JoinHandle<bool>> {
        self.take_pending()
            .into_iter()
            .map(|ident| {
                let installer = self.installer.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move { install(&installer, &ident, &cancel).await })
            })
            .collect()
    }
}

async fn install(installer: &PackageInstaller, ident: &str, cancel: &CancellationToken) -> bool {
    match installer.download_and_mount(ident, cancel).await {
        Some(_) => {
            tracing::info!(package = ident, "package installed");
            true
        }
        None => false,
    }
}
