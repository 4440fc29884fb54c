use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};

use bytes::Bytes;
use http::Method;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, warn};

use crate::auth::RemoteApi;
use crate::cache::{DataCache, Metadata, metadata_key};
use crate::config::RemoteDataConfig;
use crate::error::{Error, Result};
use crate::handler::ResponseHandler;
use crate::request::Request;
use crate::response::Response;
use crate::util::{duration_to_millis, lock_unpoisoned, redact_uri_for_logs};

const SAVED_MIME_TYPE: &str = "raw";

pub type DataLoadedCallback = Box<dyn FnOnce(Result<Bytes>) + Send + 'static>;

#[derive(Clone, Debug)]
pub enum RemoteDataEvent {
    Downloaded {
        remote_path: String,
        mime_type: Option<String>,
        /// HTTP date.
        download_timestamp: String,
    },
    DownloadFailed {
        remote_path: String,
        error: Error,
    },
}

impl RemoteDataEvent {
    pub fn remote_path(&self) -> &str {
        match self {
            Self::Downloaded { remote_path, .. } | Self::DownloadFailed { remote_path, .. } => {
                remote_path
            }
        }
    }
}

/// Keyed fetch-or-cache coordinator.
///
/// Concurrent fetches of one key share a single download. The number of downloads running at
/// once is bounded; keys over the bound wait in a pending queue that is served most recent first.
/// Every registered callback for a key runs exactly once, in registration order, when the key's
/// download ends.
#[derive(Clone)]
pub struct RemoteData {
    inner: Arc<RemoteDataInner>,
}

struct RemoteDataInner {
    api: RemoteApi,
    cache: Arc<dyn DataCache>,
    // lock order: active, pending, waiters
    active: Mutex<HashMap<String, Instant>>,
    pending: Mutex<VecDeque<String>>,
    waiters: Mutex<HashMap<String, Vec<DataLoadedCallback>>>,
    max_active_requests: AtomicUsize,
    network_timeout_ms: AtomicU64,
    events: broadcast::Sender<RemoteDataEvent>,
    runtime: Handle,
}

enum Admission {
    Start,
    Joined,
    Queued,
}

impl RemoteData {
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime; use [`RemoteData::with_runtime`] there.
    pub fn new(api: RemoteApi, cache: Arc<dyn DataCache>, config: RemoteDataConfig) -> Self {
        Self::with_runtime(api, cache, config, Handle::current())
    }

    pub fn with_runtime(
        api: RemoteApi,
        cache: Arc<dyn DataCache>,
        config: RemoteDataConfig,
        runtime: Handle,
    ) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            inner: Arc::new(RemoteDataInner {
                api,
                cache,
                active: Mutex::new(HashMap::new()),
                pending: Mutex::new(VecDeque::new()),
                waiters: Mutex::new(HashMap::new()),
                max_active_requests: AtomicUsize::new(config.max_active_requests.max(1)),
                network_timeout_ms: AtomicU64::new(duration_to_millis(config.network_timeout)),
                events,
                runtime,
            }),
        }
    }

    /// A lazily created process-wide coordinator over [`crate::Session::shared`] and an in-memory
    /// cache.
    ///
    /// # Panics
    ///
    /// The first call panics when made outside a tokio runtime.
    #[cfg(feature = "hyper-transport")]
    pub fn shared() -> std::result::Result<&'static RemoteData, crate::transport::TransportError> {
        static SHARED: once_cell::sync::OnceCell<RemoteData> = once_cell::sync::OnceCell::new();
        SHARED.get_or_try_init(|| {
            let session = crate::session::Session::shared()?.clone();
            Ok(Self::new(
                RemoteApi::without_renewal(session),
                Arc::new(crate::cache::MemoryDataCache::new()),
                RemoteDataConfig::default(),
            ))
        })
    }

    pub fn api(&self) -> &RemoteApi {
        &self.inner.api
    }

    pub fn cache(&self) -> &Arc<dyn DataCache> {
        &self.inner.cache
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RemoteDataEvent> {
        self.inner.events.subscribe()
    }

    pub fn max_active_requests(&self) -> usize {
        self.inner.max_active_requests.load(Ordering::Relaxed)
    }

    /// Raising the bound starts pending downloads right away.
    pub fn set_max_active_requests(&self, max_active_requests: usize) {
        self.inner
            .max_active_requests
            .store(max_active_requests.max(1), Ordering::Relaxed);
        self.inner.drain_pending();
    }

    pub fn network_timeout(&self) -> Duration {
        Duration::from_millis(self.inner.network_timeout_ms.load(Ordering::Relaxed))
    }

    pub fn set_network_timeout(&self, network_timeout: Duration) {
        self.inner
            .network_timeout_ms
            .store(duration_to_millis(network_timeout), Ordering::Relaxed);
    }

    pub fn active_count(&self) -> usize {
        lock_unpoisoned(&self.inner.active).len()
    }

    pub fn pending_count(&self) -> usize {
        lock_unpoisoned(&self.inner.pending).len()
    }

    pub fn is_download_active(&self, key: &str) -> bool {
        lock_unpoisoned(&self.inner.active).contains_key(key)
    }

    pub fn is_pending(&self, key: &str) -> bool {
        lock_unpoisoned(&self.inner.pending)
            .iter()
            .any(|pending| pending == key)
    }

    /// Returns cached bytes for `key`, or `None` after arranging for `on_complete` to receive the
    /// outcome of a download. On a cache hit `on_complete` is dropped without being called.
    pub fn fetch(&self, key: &str, on_complete: Option<DataLoadedCallback>) -> Option<Bytes> {
        if let Some(data) = self.inner.cache.get(key) {
            return Some(data);
        }

        match self.inner.admit(key, on_complete) {
            Admission::Start => {
                debug!(key = %redact_uri_for_logs(key), "starting remote data download");
                self.inner.start_download(key.to_owned(), false);
            }
            Admission::Joined => {
                debug!(key = %redact_uri_for_logs(key), "joined active remote data download");
            }
            Admission::Queued => {
                debug!(key = %redact_uri_for_logs(key), "queued remote data download");
            }
        }
        None
    }

    /// Resolves with the cached bytes or with the outcome a callback would have received.
    pub async fn fetch_async(&self, key: &str) -> Result<Bytes> {
        let (sender, receiver) = oneshot::channel();
        let callback: DataLoadedCallback = Box::new(move |outcome| {
            let _ = sender.send(outcome);
        });
        if let Some(data) = self.fetch(key, Some(callback)) {
            return Ok(data);
        }
        match receiver.await {
            Ok(outcome) => outcome,
            Err(_) => Err(Error::unknown(
                &Method::GET,
                key,
                "remote data download ended without a result",
            )),
        }
    }

    /// Stores caller-provided bytes under `key` and announces them as downloaded.
    pub fn save(&self, key: &str, data: impl Into<Bytes>) {
        let download_timestamp = httpdate::fmt_http_date(SystemTime::now());
        self.inner.cache.set(key, data.into());

        let mut metadata = Metadata::new();
        metadata.insert(metadata_key::MIME_TYPE.to_owned(), SAVED_MIME_TYPE.to_owned());
        metadata.insert(
            metadata_key::DOWNLOAD_TIMESTAMP.to_owned(),
            download_timestamp.clone(),
        );
        metadata.insert(metadata_key::REMOTE_PATH.to_owned(), key.to_owned());
        self.inner.cache.set_metadata(key, metadata);

        self.inner.emit(RemoteDataEvent::Downloaded {
            remote_path: key.to_owned(),
            mime_type: Some(SAVED_MIME_TYPE.to_owned()),
            download_timestamp,
        });
    }

    pub fn metadata(&self, key: &str) -> Option<Metadata> {
        self.inner.cache.metadata(key)
    }

    pub fn set_metadata(&self, key: &str, metadata: Metadata) {
        self.inner.cache.set_metadata(key, metadata);
    }

    /// Drops every queued key. Their callbacks receive [`Error::UserCancelled`]; running downloads
    /// are unaffected.
    pub fn clear_pending(&self) {
        let cancelled: Vec<(String, Vec<DataLoadedCallback>)> = {
            let mut pending = lock_unpoisoned(&self.inner.pending);
            let mut waiters = lock_unpoisoned(&self.inner.waiters);
            pending
                .drain(..)
                .map(|key| {
                    let callbacks = waiters.remove(&key).unwrap_or_default();
                    (key, callbacks)
                })
                .collect()
        };
        debug!(count = cancelled.len(), "cleared pending remote data downloads");

        for (key, callbacks) in cancelled {
            let error = Error::cancelled(&Method::GET, &key);
            self.inner.notify(key, callbacks, Err(error));
        }
    }
}

impl RemoteDataInner {
    fn admit(&self, key: &str, on_complete: Option<DataLoadedCallback>) -> Admission {
        let mut active = lock_unpoisoned(&self.active);
        let admission = if active.contains_key(key) {
            Admission::Joined
        } else {
            let mut pending = lock_unpoisoned(&self.pending);
            if let Some(position) = pending.iter().position(|queued| queued == key) {
                pending.remove(position);
            }
            if active.len() >= self.max_active_requests.load(Ordering::Relaxed) {
                pending.push_front(key.to_owned());
                Admission::Queued
            } else {
                active.insert(key.to_owned(), Instant::now());
                Admission::Start
            }
        };

        if let Some(on_complete) = on_complete {
            lock_unpoisoned(&self.waiters)
                .entry(key.to_owned())
                .or_default()
                .push(on_complete);
        }
        admission
    }

    /// `key` must already be marked active.
    fn start_download(self: &Arc<Self>, key: String, check_cache: bool) {
        let inner = Arc::clone(self);
        self.runtime.spawn(async move {
            if check_cache {
                if let Some(data) = inner.cache.get(&key) {
                    inner.complete(key, Ok(data), None);
                    return;
                }
            }

            let request = Request::get(key.clone())
                .with_response_handler(ResponseHandler::passthrough())
                .with_timeout(Duration::from_millis(
                    inner.network_timeout_ms.load(Ordering::Relaxed),
                ));
            let response = inner.api.execute_request(request).await;
            let outcome = download_outcome(&key, &response);
            inner.complete(key, outcome, Some(&response));
        });
    }

    fn complete(self: &Arc<Self>, key: String, outcome: Result<Bytes>, response: Option<&Response>) {
        let event = match (&outcome, response) {
            (Ok(data), Some(response)) => {
                let mime_type = response.mime_type();
                let download_timestamp = httpdate::fmt_http_date(SystemTime::now());
                self.cache.set(&key, data.clone());
                let mut metadata = Metadata::new();
                if let Some(mime_type) = &mime_type {
                    metadata.insert(metadata_key::MIME_TYPE.to_owned(), mime_type.clone());
                }
                metadata.insert(
                    metadata_key::DOWNLOAD_TIMESTAMP.to_owned(),
                    download_timestamp.clone(),
                );
                self.cache.set_metadata(&key, metadata);
                Some(RemoteDataEvent::Downloaded {
                    remote_path: key.clone(),
                    mime_type,
                    download_timestamp,
                })
            }
            (Ok(_), None) => None,
            (Err(error), _) => {
                warn!(
                    key = %redact_uri_for_logs(&key),
                    code = error.code().as_str(),
                    error = %error,
                    "remote data download failed"
                );
                Some(RemoteDataEvent::DownloadFailed {
                    remote_path: key.clone(),
                    error: error.clone(),
                })
            }
        };

        let (started_at, callbacks) = {
            let mut active = lock_unpoisoned(&self.active);
            let started_at = active.remove(&key);
            let callbacks = lock_unpoisoned(&self.waiters)
                .remove(&key)
                .unwrap_or_default();
            (started_at, callbacks)
        };
        debug!(
            key = %redact_uri_for_logs(&key),
            waiters = callbacks.len(),
            elapsed_ms = started_at.map(|started_at| started_at.elapsed().as_millis() as u64),
            "remote data download finished"
        );

        if let Some(event) = event {
            self.emit(event);
        }
        self.notify(key, callbacks, outcome);
        self.drain_pending();
    }

    fn drain_pending(self: &Arc<Self>) {
        loop {
            let next = {
                let mut active = lock_unpoisoned(&self.active);
                if active.len() >= self.max_active_requests.load(Ordering::Relaxed) {
                    break;
                }
                let mut pending = lock_unpoisoned(&self.pending);
                let Some(key) = pending.pop_front() else {
                    break;
                };
                active.insert(key.clone(), Instant::now());
                key
            };
            debug!(key = %redact_uri_for_logs(&next), "starting queued remote data download");
            self.start_download(next, true);
        }
    }

    /// Runs `callbacks` in order on the runtime, outside every coordinator lock. A panicking
    /// callback is logged and does not stop the ones after it.
    fn notify(&self, key: String, callbacks: Vec<DataLoadedCallback>, outcome: Result<Bytes>) {
        if callbacks.is_empty() {
            return;
        }
        self.runtime.spawn(async move {
            for (index, callback) in callbacks.into_iter().enumerate() {
                let outcome = outcome.clone();
                let delivered = panic::catch_unwind(AssertUnwindSafe(move || callback(outcome)));
                if let Err(payload) = delivered {
                    warn!(
                        key = %redact_uri_for_logs(&key),
                        waiter = index,
                        panic = panic_message(payload.as_ref()),
                        "remote data callback panicked"
                    );
                }
            }
        });
    }

    fn emit(&self, event: RemoteDataEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

fn download_outcome(key: &str, response: &Response) -> Result<Bytes> {
    if let Some(error) = response.error() {
        return Err(error.clone());
    }
    match response.body() {
        Some(body) => Ok(body.clone()),
        None => Err(Error::unknown(
            &Method::GET,
            key,
            "download finished without data",
        )),
    }
}

impl std::fmt::Debug for RemoteData {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("RemoteData")
            .field("active", &self.active_count())
            .field("pending", &self.pending_count())
            .field("max_active_requests", &self.max_active_requests())
            .field("network_timeout", &self.network_timeout())
            .finish_non_exhaustive()
    }
}
