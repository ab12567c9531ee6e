use crate::*;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tidewire_core::NetFlags;
use tidewire_services::filesystem::{FileSystem, MemoryFileSystem};
use tidewire_services::packages::{self, PackageError, PackageFetcher};
use tidewire_services::ServerPackages;
use tokio_util::sync::CancellationToken;

/// Serves a one-file package per ident after a short delay. Idents ending
/// in ".missing" fail.
#[derive(Default)]
struct SlowRegistry {
    fetches: AtomicUsize,
}

#[async_trait]
impl PackageFetcher for SlowRegistry {
    async fn fetch(
        &self,
        ident: &str,
        _cancel: &CancellationToken,
    ) -> Result<Arc<dyn FileSystem>, PackageError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        if ident.ends_with(".missing") {
            return Err(PackageError::NotFound(ident.to_owned()));
        }
        let fs = MemoryFileSystem::new();
        fs.write("manifest.txt", Bytes::from(ident.to_owned()));
        Ok(Arc::new(fs))
    }
}

/// The host lists packages; the client installs each once even while
/// other code asks for the same package concurrently.
#[tokio::test]
async fn test_server_packages_install_once() {
    init_tracing();
    let host = Peer::host();
    let mut client = Peer::client();
    let (to_client, _) = link(&host, &client);

    let mut listed = ServerPackages::new(Arc::new(SlowRegistry::default()));
    listed.add_package("core.tpk");
    listed.add_package("maps.tpk");

    let registry = Arc::new(SlowRegistry::default());
    let required = Arc::new(Mutex::new(ServerPackages::new(registry.clone())));
    client
        .dispatcher
        .register_table(packages::TABLE_NAME, required.clone());

    to_client
        .send_raw_message(listed.table().update_message(), NetFlags::RELIABLE)
        .unwrap();
    listed.table_mut().clear_changes();
    client.pump();

    let cancel = CancellationToken::new();
    let handles = required.lock().spawn_pending_installs(&cancel);
    assert_eq!(handles.len(), 2);

    // Game code asking for the same package joins the running fetch.
    let installer = required.lock().installer();
    let extra: Vec<_> = (0..4)
        .map(|_| {
            let installer = installer.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                installer.download_and_mount("core.tpk", &cancel).await.is_some()
            })
        })
        .collect();

    for h in handles.into_iter().chain(extra) {
        assert!(h.await.unwrap());
    }
    assert_eq!(registry.fetches.load(Ordering::SeqCst), 2);

    let core = installer.get("core.tpk").unwrap().active_package().unwrap();
    assert_eq!(core.read("manifest.txt"), Some(Bytes::from_static(b"core.tpk")));
    assert!(required.lock().take_pending().is_empty());
}

/// A package that fails stays failed for every caller until forgotten.
#[tokio::test]
async fn test_failed_package_is_not_refetched() {
    let registry = Arc::new(SlowRegistry::default());
    let packages = ServerPackages::new(registry.clone());
    let cancel = CancellationToken::new();

    assert!(!packages.client_install_package("extra.missing", &cancel).await);
    assert!(!packages.client_install_package("extra.missing", &cancel).await);
    assert_eq!(registry.fetches.load(Ordering::SeqCst), 1);

    let installer = packages.installer();
    let download = installer.get("extra.missing").unwrap();
    assert_eq!(
        download.error(),
        Some(PackageError::NotFound("extra.missing".into()))
    );

    assert!(installer.forget("extra.missing"));
    assert!(!packages.client_install_package("extra.missing", &cancel).await);
    assert_eq!(registry.fetches.load(Ordering::SeqCst), 2);
}
