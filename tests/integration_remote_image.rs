use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use fetchx::prelude::{
    ErrorCode, MemoryDataCache, RemoteApi, RemoteData, RemoteDataConfig, RemoteImage, Session,
    Transport, TransportError, TransportResponse, WireRequest,
};
use fetchx::{ImageDownloaded, ImageLoadedCallback, metadata_key};
use futures_util::FutureExt;
use futures_util::future::{BoxFuture, join_all};
use http::header::CONTENT_TYPE;
use http::{HeaderMap, HeaderValue, StatusCode};
use tokio::sync::oneshot;

struct ImageServer {
    png: Vec<u8>,
    calls: AtomicUsize,
}

impl ImageServer {
    fn new(width: u32, height: u32) -> Arc<Self> {
        let mut png = Vec::new();
        image::DynamicImage::ImageRgba8(image::RgbaImage::new(width, height))
            .write_to(&mut Cursor::new(&mut png), image::ImageFormat::Png)
            .expect("encode png");
        Arc::new(Self {
            png,
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Transport for ImageServer {
    fn send(
        &self,
        request: WireRequest,
    ) -> BoxFuture<'static, Result<TransportResponse, TransportError>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let body = if request.url.path().starts_with("/garbage") {
            b"definitely not a png".to_vec()
        } else {
            self.png.clone()
        };
        async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let mut headers = HeaderMap::new();
            headers.insert(CONTENT_TYPE, HeaderValue::from_static("image/png"));
            Ok(TransportResponse::new(StatusCode::OK, headers, body))
        }
        .boxed()
    }
}

fn remote_image(server: Arc<ImageServer>) -> RemoteImage {
    RemoteImage::new(RemoteData::new(
        RemoteApi::without_renewal(Session::new(server)),
        Arc::new(MemoryDataCache::new()),
        RemoteDataConfig::default(),
    ))
}

#[tokio::test]
async fn downloads_are_decoded_once_and_sized_in_metadata() {
    let server = ImageServer::new(3, 2);
    let images = remote_image(server.clone());
    let mut events = images.subscribe();
    let key = "http://cdn.test/img/avatar.png";
    assert!(!images.is_downloaded(key));
    assert_eq!(images.image_size(key), None);

    let (sender, receiver) = oneshot::channel();
    let on_complete: ImageLoadedCallback = Box::new(move |outcome| {
        let _ = sender.send(outcome);
    });
    let immediate = images.image(key, Some(on_complete));
    assert!(immediate.is_none());

    let decoded = tokio::time::timeout(Duration::from_secs(5), receiver)
        .await
        .expect("image should arrive in time")
        .expect("callback should run")
        .expect("png should decode");
    assert_eq!((decoded.width(), decoded.height()), (3, 2));
    assert_eq!(
        events.try_recv().expect("decode should be announced"),
        ImageDownloaded {
            remote_path: key.to_owned(),
            width: 3,
            height: 2,
        }
    );

    let metadata = images
        .remote_data()
        .metadata(key)
        .expect("download should leave metadata");
    assert_eq!(metadata.get(metadata_key::IMAGE_WIDTH).map(String::as_str), Some("3"));
    assert_eq!(metadata.get(metadata_key::IMAGE_HEIGHT).map(String::as_str), Some("2"));
    assert_eq!(metadata.get(metadata_key::MIME_TYPE).map(String::as_str), Some("image/png"));

    let again = images.image(key, None).expect("decoded image stays in memory");
    assert!(Arc::ptr_eq(&again, &decoded));
    assert!(images.is_downloaded(key));
    assert_eq!(images.image_size(key), Some((3, 2)));
    assert_eq!(images.cached_count(), 1);
    assert_eq!(server.calls(), 1);
    assert!(events.try_recv().is_err(), "memory hits are not announced");
}

#[tokio::test]
async fn clearing_memory_decodes_again_from_cached_bytes() {
    let server = ImageServer::new(5, 4);
    let images = remote_image(server.clone());
    let key = "http://cdn.test/img/banner.png";

    let first = images.image_async(key).await.expect("first load");
    images.clear_cache();
    assert_eq!(images.cached_count(), 0);
    assert!(images.is_downloaded(key), "bytes remain in the data cache");
    assert_eq!(images.image_size(key), Some((5, 4)));

    let second = images
        .image(key, None)
        .expect("cached bytes decode without a download");
    assert!(!Arc::ptr_eq(&first, &second));
    assert_eq!((second.width(), second.height()), (5, 4));
    assert_eq!(images.cached_count(), 1);
    assert_eq!(server.calls(), 1);
}

#[tokio::test]
async fn undecodable_bytes_fail_with_parse_failure() {
    let server = ImageServer::new(1, 1);
    let images = remote_image(server.clone());
    let key = "http://cdn.test/garbage/blob.png";

    let error = images
        .image_async(key)
        .await
        .expect_err("garbage should not decode");
    assert_eq!(error.code(), ErrorCode::ParseFailure);
    assert_eq!(images.cached_count(), 0);
    assert_eq!(images.image_size(key), None);

    let failures = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&failures);
    let on_complete: ImageLoadedCallback = Box::new(move |outcome| {
        sink.lock()
            .expect("lock failures")
            .push(outcome.map(|_| ()).map_err(|error| error.code()));
    });
    let immediate = images.image(key, Some(on_complete));
    assert!(immediate.is_none());
    assert_eq!(
        *failures.lock().expect("lock failures"),
        [Err(ErrorCode::ParseFailure)],
        "cached bytes that fail to decode report right away"
    );
    assert_eq!(server.calls(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_requests_share_one_download_and_one_decode() {
    let server = ImageServer::new(8, 8);
    let images = remote_image(server.clone());
    let mut events = images.subscribe();
    let key = "http://cdn.test/img/tile.png";

    let loads = (0..20).map(|_| images.image_async(key));
    let decoded: Vec<_> = join_all(loads)
        .await
        .into_iter()
        .map(|outcome| outcome.expect("shared load should succeed"))
        .collect();

    assert!(decoded.iter().all(|image| Arc::ptr_eq(image, &decoded[0])));
    assert_eq!(server.calls(), 1);
    assert!(events.try_recv().is_ok());
    assert!(events.try_recv().is_err(), "one decode, one event");
}
