use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use http::Method;
use image::DynamicImage;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, warn};

use crate::cache::metadata_key;
use crate::error::{Error, Result};
use crate::remote_data::{DataLoadedCallback, RemoteData};
use crate::util::{lock_unpoisoned, redact_uri_for_logs};

const EVENT_CAPACITY: usize = 256;

pub type ImageLoadedCallback = Box<dyn FnOnce(Result<Arc<DynamicImage>>) + Send + 'static>;

/// Sent the first time a downloaded image is decoded.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageDownloaded {
    pub remote_path: String,
    pub width: u32,
    pub height: u32,
}

/// Decoded images on top of a [`RemoteData`] coordinator.
///
/// Bytes come from the coordinator, so concurrent requests for one key still share a download.
/// Each key is decoded once and kept in memory until [`RemoteImage::clear_cache`]; its dimensions
/// are recorded in the data cache metadata under [`metadata_key::IMAGE_WIDTH`] and
/// [`metadata_key::IMAGE_HEIGHT`].
#[derive(Clone)]
pub struct RemoteImage {
    inner: Arc<RemoteImageInner>,
}

struct RemoteImageInner {
    remote_data: RemoteData,
    images: Mutex<HashMap<String, Arc<DynamicImage>>>,
    events: broadcast::Sender<ImageDownloaded>,
}

impl RemoteImage {
    pub fn new(remote_data: RemoteData) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(RemoteImageInner {
                remote_data,
                images: Mutex::new(HashMap::new()),
                events,
            }),
        }
    }

    /// A process-wide instance over [`RemoteData::shared`].
    ///
    /// # Panics
    ///
    /// The first call panics when made outside a tokio runtime.
    #[cfg(feature = "hyper-transport")]
    pub fn shared() -> std::result::Result<&'static RemoteImage, crate::transport::TransportError>
    {
        static SHARED: once_cell::sync::OnceCell<RemoteImage> = once_cell::sync::OnceCell::new();
        SHARED.get_or_try_init(|| Ok(Self::new(RemoteData::shared()?.clone())))
    }

    pub fn remote_data(&self) -> &RemoteData {
        &self.inner.remote_data
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ImageDownloaded> {
        self.inner.events.subscribe()
    }

    /// Returns the decoded image when it is in memory or its bytes are cached, or `None` after
    /// arranging for `on_complete` to receive the download's outcome.
    ///
    /// Cached bytes that fail to decode also yield `None`; `on_complete` then receives the parse
    /// failure right away.
    pub fn image(
        &self,
        key: &str,
        on_complete: Option<ImageLoadedCallback>,
    ) -> Option<Arc<DynamicImage>> {
        if let Some(image) = self.inner.cached(key) {
            return Some(image);
        }

        let slot = Arc::new(Mutex::new(on_complete));
        let inner = Arc::clone(&self.inner);
        let callback_slot = Arc::clone(&slot);
        let callback_key = key.to_owned();
        let callback: DataLoadedCallback = Box::new(move |outcome| {
            let decoded = outcome.and_then(|data| inner.decode(&callback_key, &data));
            if let Some(on_complete) = lock_unpoisoned(&callback_slot).take() {
                on_complete(decoded);
            }
        });

        let data = self.inner.remote_data.fetch(key, Some(callback))?;
        match self.inner.decode(key, &data) {
            Ok(image) => Some(image),
            Err(error) => {
                if let Some(on_complete) = lock_unpoisoned(&slot).take() {
                    on_complete(Err(error));
                }
                None
            }
        }
    }

    pub async fn image_async(&self, key: &str) -> Result<Arc<DynamicImage>> {
        let (sender, receiver) = oneshot::channel();
        let callback: ImageLoadedCallback = Box::new(move |outcome| {
            let _ = sender.send(outcome);
        });
        if let Some(image) = self.image(key, Some(callback)) {
            return Ok(image);
        }
        match receiver.await {
            Ok(outcome) => outcome,
            Err(_) => Err(Error::unknown(
                &Method::GET,
                key,
                "remote image load ended without a result",
            )),
        }
    }

    /// Width and height of a decoded image, or as recorded in the cache metadata.
    pub fn image_size(&self, key: &str) -> Option<(u32, u32)> {
        if let Some(image) = self.inner.cached(key) {
            return Some((image.width(), image.height()));
        }
        let metadata = self.inner.remote_data.metadata(key)?;
        let width = metadata.get(metadata_key::IMAGE_WIDTH)?.parse().ok()?;
        let height = metadata.get(metadata_key::IMAGE_HEIGHT)?.parse().ok()?;
        Some((width, height))
    }

    pub fn is_downloaded(&self, key: &str) -> bool {
        lock_unpoisoned(&self.inner.images).contains_key(key)
            || self.inner.remote_data.cache().exists(key)
    }

    /// Drops the decoded images. Cached bytes are kept and decoded again on the next request.
    pub fn clear_cache(&self) {
        let mut images = lock_unpoisoned(&self.inner.images);
        debug!(count = images.len(), "cleared decoded image cache");
        images.clear();
    }

    pub fn cached_count(&self) -> usize {
        lock_unpoisoned(&self.inner.images).len()
    }
}

impl RemoteImageInner {
    fn cached(&self, key: &str) -> Option<Arc<DynamicImage>> {
        lock_unpoisoned(&self.images).get(key).cloned()
    }

    fn decode(&self, key: &str, data: &Bytes) -> Result<Arc<DynamicImage>> {
        if let Some(image) = self.cached(key) {
            return Ok(image);
        }

        let image = image::load_from_memory(data).map_err(|error| {
            warn!(
                key = %redact_uri_for_logs(key),
                error = %error,
                "remote image failed to decode"
            );
            Error::parse_failure(error, &Method::GET, key, None)
        })?;
        let (width, height) = (image.width(), image.height());

        let (image, inserted) = {
            let mut images = lock_unpoisoned(&self.images);
            match images.get(key) {
                Some(existing) => (Arc::clone(existing), false),
                None => {
                    let image = Arc::new(image);
                    images.insert(key.to_owned(), Arc::clone(&image));
                    (image, true)
                }
            }
        };
        if !inserted {
            return Ok(image);
        }

        let mut metadata = self.remote_data.metadata(key).unwrap_or_default();
        metadata.insert(metadata_key::IMAGE_WIDTH.to_owned(), width.to_string());
        metadata.insert(metadata_key::IMAGE_HEIGHT.to_owned(), height.to_string());
        self.remote_data.set_metadata(key, metadata);
        debug!(key = %redact_uri_for_logs(key), width, height, "decoded remote image");

        // no subscribers is fine
        let _ = self.events.send(ImageDownloaded {
            remote_path: key.to_owned(),
            width,
            height,
        });
        Ok(image)
    }
}
