use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use fetchx::prelude::{
    DataCache, DiskDataCache, MemoryDataCache, RemoteApi, RemoteData, RemoteDataConfig, Session,
    Transport, TransportError, TransportResponse, WireRequest,
};
use fetchx::{Metadata, metadata_key};
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use http::{HeaderMap, StatusCode};

#[derive(Default)]
struct CountingTransport {
    calls: AtomicUsize,
}

impl Transport for CountingTransport {
    fn send(
        &self,
        request: WireRequest,
    ) -> BoxFuture<'static, Result<TransportResponse, TransportError>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let body = format!("payload for {}", request.url.path());
        async move { Ok(TransportResponse::new(StatusCode::OK, HeaderMap::new(), body)) }.boxed()
    }
}

fn metadata(pairs: &[(&str, &str)]) -> Metadata {
    pairs
        .iter()
        .map(|(name, value)| ((*name).to_owned(), (*value).to_owned()))
        .collect()
}

#[test]
fn disk_cache_round_trips_data_and_metadata() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let cache = DiskDataCache::new(dir.path()).expect("create disk cache");
    let key = "https://cdn.example.com/a.png?size=large";

    assert!(cache.get(key).is_none());
    assert!(!cache.exists(key));

    cache.set(key, Bytes::from_static(b"\x89PNG"));
    cache.set_metadata(key, metadata(&[(metadata_key::MIME_TYPE, "image/png")]));

    assert_eq!(cache.get(key), Some(Bytes::from_static(b"\x89PNG")));
    assert_eq!(
        cache
            .metadata(key)
            .and_then(|metadata| metadata.get(metadata_key::MIME_TYPE).cloned())
            .as_deref(),
        Some("image/png")
    );

    let reopened = DiskDataCache::new(dir.path()).expect("reopen disk cache");
    assert_eq!(reopened.get(key), Some(Bytes::from_static(b"\x89PNG")));
}

#[test]
fn disk_cache_file_names_do_not_leak_keys() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let cache = DiskDataCache::new(dir.path()).expect("create disk cache");
    cache.set("https://cdn.example.com/secret/path", Bytes::from_static(b"x"));

    let names: Vec<String> = std::fs::read_dir(dir.path())
        .expect("list cache dir")
        .map(|entry| {
            entry
                .expect("cache dir entry")
                .file_name()
                .to_string_lossy()
                .into_owned()
        })
        .collect();
    assert_eq!(names.len(), 1);
    assert_eq!(names[0].len(), 64);
    assert!(names[0].chars().all(|ch| ch.is_ascii_hexdigit()));
}

#[test]
fn disk_cache_remove_and_clear() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let cache = DiskDataCache::new(dir.path()).expect("create disk cache");

    cache.set("one", Bytes::from_static(b"1"));
    cache.set_metadata("one", metadata(&[("k", "v")]));
    cache.set("two", Bytes::from_static(b"2"));

    cache.remove("one");
    assert!(cache.get("one").is_none());
    assert!(cache.metadata("one").is_none());
    assert!(cache.exists("two"));

    cache.clear();
    assert!(!cache.exists("two"));
    assert_eq!(
        std::fs::read_dir(dir.path()).expect("list cache dir").count(),
        0
    );
}

#[test]
fn expired_disk_entries_read_as_absent() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let cache = DiskDataCache::new(dir.path()).expect("create disk cache");
    cache.set("stale", Bytes::from_static(b"old"));
    assert!(cache.exists("stale"));

    cache.set_content_expiration(Duration::ZERO);
    assert_eq!(cache.content_expiration(), Duration::ZERO);
    assert!(cache.get("stale").is_none());

    cache.set_content_expiration(Duration::from_secs(60));
    assert!(cache.get("stale").is_none(), "expired entries are purged");
}

#[test]
fn expired_disk_entries_take_their_metadata_with_them() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let cache = DiskDataCache::new(dir.path()).expect("create disk cache");
    cache.set("stale", Bytes::from_static(b"old"));
    cache.set_metadata("stale", metadata(&[(metadata_key::MIME_TYPE, "image/png")]));
    cache.set_metadata("meta-only", metadata(&[("k", "v")]));
    assert_eq!(std::fs::read_dir(dir.path()).expect("list cache dir").count(), 3);

    cache.set_content_expiration(Duration::ZERO);
    assert!(cache.get("stale").is_none());
    assert!(cache.get("meta-only").is_none());

    cache.set_content_expiration(Duration::from_secs(60));
    assert!(cache.metadata("stale").is_none());
    assert_eq!(
        cache
            .metadata("meta-only")
            .and_then(|metadata| metadata.get("k").cloned())
            .as_deref(),
        Some("v"),
        "a lookup without data must not drop metadata"
    );
    assert_eq!(std::fs::read_dir(dir.path()).expect("list cache dir").count(), 1);
}

#[test]
fn disk_readers_never_observe_partial_writes() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let cache = Arc::new(DiskDataCache::new(dir.path()).expect("create disk cache"));
    let key = "https://cdn.example.com/large.bin";
    let first = Bytes::from(vec![b'a'; 256 * 1024]);
    let second = Bytes::from(vec![b'b'; 256 * 1024]);
    cache.set(key, first.clone());

    std::thread::scope(|scope| {
        let writer_cache = Arc::clone(&cache);
        scope.spawn(move || {
            for round in 0..200 {
                let data = if round % 2 == 0 { &second } else { &first };
                writer_cache.set(key, data.clone());
            }
        });

        for _ in 0..400 {
            let data = cache.get(key).expect("entry is always present");
            assert_eq!(data.len(), 256 * 1024);
            assert!(data.iter().all(|byte| *byte == data[0]), "read a torn entry");
        }
    });

    let leftovers = std::fs::read_dir(dir.path()).expect("list cache dir").count();
    assert_eq!(leftovers, 1, "staged files are renamed into place");
}

#[test]
fn memory_cache_expires_entries() {
    let cache = MemoryDataCache::with_expiration(Duration::from_millis(30));
    cache.set("k", Bytes::from_static(b"v"));
    cache.set_metadata("k", metadata(&[("a", "b")]));
    assert_eq!(cache.get("k"), Some(Bytes::from_static(b"v")));
    assert_eq!(cache.len(), 1);

    std::thread::sleep(Duration::from_millis(60));
    assert!(cache.get("k").is_none());
    assert!(cache.metadata("k").is_none());
    assert!(cache.is_empty());
}

#[tokio::test]
async fn remote_data_reuses_disk_entries_across_instances() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let transport = Arc::new(CountingTransport::default());
    let key = "http://cdn.test/banner.png";

    let first = RemoteData::new(
        RemoteApi::without_renewal(Session::new(transport.clone())),
        Arc::new(DiskDataCache::new(dir.path()).expect("create disk cache")),
        RemoteDataConfig::default(),
    );
    let downloaded = first.fetch_async(key).await.expect("download");
    assert_eq!(downloaded, Bytes::from_static(b"payload for /banner.png"));

    let second = RemoteData::new(
        RemoteApi::without_renewal(Session::new(transport.clone())),
        Arc::new(DiskDataCache::new(dir.path()).expect("reopen disk cache")),
        RemoteDataConfig::default(),
    );
    assert_eq!(second.fetch(key, None), Some(downloaded));
    assert!(second.metadata(key).is_some());
    assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
}
