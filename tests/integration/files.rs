use crate::*;

use bytes::Bytes;
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;

use tidewire_core::message::RequestFile;
use tidewire_core::{MessageType, NetFlags, NetMessage};
use tidewire_services::cache::FileCache;
use tidewire_services::filesystem::{
    FileSystem, LocalFileSystem, MemoryFileSystem, RedirectFileSystem,
};
use tidewire_services::large_files::{self, DownloadError, DownloadSummary};
use tidewire_services::small_files::{self, SmallNetworkFiles};
use tidewire_services::{LargeNetworkFiles, RequestError};
use tokio_util::sync::CancellationToken;

fn write(root: &Path, name: &str, data: &[u8]) {
    let path = root.join(name);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, data).unwrap();
}

/// Host side: advertises files from `root` and answers `RequestFile`.
fn host_files(host: &mut Peer, root: &Path, names: &[&str]) -> Arc<Mutex<LargeNetworkFiles>> {
    let cache = FileCache::new(root.join(".host-cache")).unwrap();
    let mut files = LargeNetworkFiles::new(
        Arc::new(LocalFileSystem::new(root)),
        Arc::new(RedirectFileSystem::new()),
        cache,
    );
    for name in names {
        files.add_file(name).unwrap();
    }
    let files = Arc::new(Mutex::new(files));

    let serving = files.clone();
    host.dispatcher
        .register_request(MessageType::RequestFile, move |_, body| {
            let req = RequestFile::decode(body)?;
            Ok(serving.lock().serve_file_request(&req))
        });
    files
}

struct ClientFiles {
    files: Arc<Mutex<LargeNetworkFiles>>,
    redirect: Arc<RedirectFileSystem>,
}

fn client_files(client: &mut Peer, cache_root: &Path) -> ClientFiles {
    let redirect = Arc::new(RedirectFileSystem::new());
    let files = LargeNetworkFiles::new(
        Arc::new(MemoryFileSystem::new()),
        redirect.clone(),
        FileCache::new(cache_root).unwrap(),
    );
    let files = Arc::new(Mutex::new(files));
    client
        .dispatcher
        .register_table(large_files::TABLE_NAME, files.clone());
    ClientFiles { files, redirect }
}

/// Files download one at a time into the cache; a second client with the
/// same cache mounts them without asking the host.
#[tokio::test]
async fn test_large_file_download_then_cache_hit() {
    init_tracing();
    let host_root = temp_dir("host");
    let cache_root = temp_dir("cache");

    // Large enough that the response itself is chunked.
    let arena: Vec<u8> = (0..200 * 1024).map(|i| (i * 7 % 256) as u8).collect();
    write(&host_root, "maps/arena.bsp", &arena);
    write(&host_root, "sounds/theme.ogg", b"OggS theme");

    let mut host = Peer::host();
    let hosted = host_files(&mut host, &host_root, &["maps/arena.bsp", "sounds/theme.ogg"]);

    let mut client = Peer::client();
    let (to_client, from_host) = link(&host, &client);
    let mine = client_files(&mut client, &cache_root);

    let update = hosted.lock().table().update_message();
    to_client.send_raw_message(update, NetFlags::RELIABLE).unwrap();
    client.pump();
    assert_eq!(
        mine.files.lock().queued(),
        ["maps/arena.bsp", "sounds/theme.ogg"]
    );

    let downloader = mine.files.lock().downloader();
    let cancel = CancellationToken::new();
    let conn = from_host.clone();
    let (summary, seen) = pump_until(&mut host, &mut client, async move {
        let mut seen = Vec::new();
        let summary = downloader
            .run(&conn, &cancel, |p| seen.push((p.name.clone(), p.index, p.total)))
            .await;
        (summary, seen)
    })
    .await;

    assert_eq!(
        summary.unwrap(),
        DownloadSummary {
            downloaded: 2,
            skipped: 0
        }
    );
    assert_eq!(
        seen,
        [
            ("maps/arena.bsp".to_owned(), 1, 2),
            ("sounds/theme.ogg".to_owned(), 2, 2)
        ]
    );
    assert!(mine.files.lock().queued().is_empty());
    assert_eq!(&mine.redirect.read("maps/arena.bsp").unwrap()[..], &arena[..]);
    assert_eq!(
        mine.redirect.read("sounds/theme.ogg"),
        Some(Bytes::from_static(b"OggS theme"))
    );

    // Second client, same cache directory.
    let mut second = Peer::client();
    let (to_second, _) = link(&host, &second);
    let theirs = client_files(&mut second, &cache_root);
    let snapshot = hosted.lock().table().snapshot_message();
    to_second.send_raw_message(snapshot, NetFlags::RELIABLE).unwrap();
    second.pump();

    assert!(theirs.files.lock().queued().is_empty());
    assert_eq!(theirs.redirect.len(), 2);
    assert_eq!(theirs.redirect.size("maps/arena.bsp"), Some(arena.len() as u64));
    assert!(host.pump().is_empty(), "cache hits never reach the host");

    let _ = std::fs::remove_dir_all(&host_root);
    let _ = std::fs::remove_dir_all(&cache_root);
}

/// Losing the host mid-queue aborts the drain and keeps the queue.
#[tokio::test]
async fn test_download_aborts_when_host_lost() {
    let host_root = temp_dir("host-lost");
    let cache_root = temp_dir("cache-lost");
    write(&host_root, "a.pak", b"first");
    write(&host_root, "b.pak", b"second");

    let mut host = Peer::host();
    let hosted = host_files(&mut host, &host_root, &["a.pak", "b.pak"]);
    let mut client = Peer::client();
    let (to_client, from_host) = link(&host, &client);
    let mine = client_files(&mut client, &cache_root);

    let update = hosted.lock().table().update_message();
    to_client.send_raw_message(update, NetFlags::RELIABLE).unwrap();
    client.pump();

    let downloader = mine.files.lock().downloader();
    let conn = from_host.clone();
    let cancel = CancellationToken::new();
    // The host is never pumped, so the first request hangs.
    let drain = tokio::spawn(async move { downloader.run(&conn, &cancel, |_| {}).await });

    while from_host.pending_requests() == 0 {
        tokio::task::yield_now().await;
    }
    assert!(mine.files.lock().is_downloading());
    from_host.close("host lost");

    assert_eq!(
        drain.await.unwrap(),
        Err(DownloadError::Aborted(RequestError::Disconnected))
    );
    assert_eq!(mine.files.lock().queued(), ["a.pak", "b.pak"]);
    assert!(!mine.files.lock().is_downloading());

    let _ = std::fs::remove_dir_all(&host_root);
    let _ = std::fs::remove_dir_all(&cache_root);
}

/// A file the host can no longer read comes back empty; the drain skips
/// it and carries on with the rest of the queue.
#[tokio::test]
async fn test_empty_response_skips_only_that_file() {
    init_tracing();
    let host_root = temp_dir("host-empty");
    let cache_root = temp_dir("cache-empty");
    write(&host_root, "a.pak", b"first");
    write(&host_root, "b.pak", b"second");

    let mut host = Peer::host();
    let hosted = host_files(&mut host, &host_root, &["a.pak", "b.pak"]);
    let mut client = Peer::client();
    let (to_client, from_host) = link(&host, &client);
    let mine = client_files(&mut client, &cache_root);

    let update = hosted.lock().table().update_message();
    to_client.send_raw_message(update, NetFlags::RELIABLE).unwrap();
    client.pump();
    assert_eq!(mine.files.lock().queued(), ["a.pak", "b.pak"]);

    // Still advertised, gone from disk.
    std::fs::remove_file(host_root.join("a.pak")).unwrap();

    let downloader = mine.files.lock().downloader();
    let cancel = CancellationToken::new();
    let conn = from_host.clone();
    let summary = pump_until(&mut host, &mut client, async move {
        downloader.run(&conn, &cancel, |_| {}).await
    })
    .await;

    assert_eq!(
        summary,
        Ok(DownloadSummary {
            downloaded: 1,
            skipped: 1
        })
    );
    assert!(mine.files.lock().queued().is_empty());
    assert!(mine.redirect.read("a.pak").is_none());
    assert_eq!(
        mine.redirect.read("b.pak"),
        Some(Bytes::from_static(b"second"))
    );

    let _ = std::fs::remove_dir_all(&host_root);
    let _ = std::fs::remove_dir_all(&cache_root);
}

/// Executables and paths escaping the content root are never queued.
#[test]
fn test_illegal_names_are_not_queued() {
    let host_root = temp_dir("illegal");
    let cache_root = temp_dir("cache-illegal");
    write(&host_root, "bin/tool.exe", b"MZ");
    write(&host_root, "ok.txt", b"fine");

    let mut host = Peer::host();
    let hosted = host_files(&mut host, &host_root, &["bin/tool.exe", "ok.txt"]);
    let mut client = Peer::client();
    let (to_client, _) = link(&host, &client);
    let mine = client_files(&mut client, &cache_root);

    let update = hosted.lock().table().update_message();
    to_client.send_raw_message(update, NetFlags::RELIABLE).unwrap();
    client.pump();

    assert_eq!(mine.files.lock().queued(), ["ok.txt"]);

    let _ = std::fs::remove_dir_all(&host_root);
    let _ = std::fs::remove_dir_all(&cache_root);
}

/// Small files travel inline and land in the client's memory filesystem.
#[test]
fn test_small_files_mirror_on_client() {
    let host = Peer::host();
    let mut client = Peer::client();
    let (to_client, _) = link(&host, &client);

    let mut hosted = SmallNetworkFiles::new();
    hosted.add_bytes("cfg/rules.json", &b"{\"friendly_fire\":false}"[..]).unwrap();

    let mirrored = Arc::new(Mutex::new(SmallNetworkFiles::new()));
    client
        .dispatcher
        .register_table(small_files::TABLE_NAME, mirrored.clone());
    let fs = mirrored.lock().filesystem();

    to_client
        .send_raw_message(hosted.table().update_message(), NetFlags::RELIABLE)
        .unwrap();
    hosted.table_mut().clear_changes();
    client.pump();
    assert_eq!(
        fs.read("cfg/rules.json"),
        Some(Bytes::from_static(b"{\"friendly_fire\":false}"))
    );

    hosted.remove_file("cfg/rules.json");
    to_client
        .send_raw_message(hosted.table().update_message(), NetFlags::RELIABLE)
        .unwrap();
    client.pump();
    assert!(fs.is_empty());
}
