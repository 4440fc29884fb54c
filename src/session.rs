use std::collections::HashMap;
use std::future::IntoFuture;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use http::header::{HeaderName, HeaderValue};
use http::Method;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info_span};

use crate::config::SessionConfig;
use crate::error::{Error, Result};
use crate::handler::handle_response;
use crate::metrics::{SessionMetrics, SessionMetricsSnapshot};
use crate::observe::{Observer, RequestContext};
use crate::parser::{DataParser, ParserRegistry};
use crate::request::{CachePolicy, Request};
use crate::response::Response;
use crate::transport::{Transport, TransportError};
use crate::util::{lock_unpoisoned, redact_uri_for_logs};

/// Executes requests over a [`Transport`] and tracks the ones in flight.
///
/// Cloning is cheap; clones share the transport, the parser registry and the set of active
/// requests.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    transport: Arc<dyn Transport>,
    parsers: Arc<ParserRegistry>,
    config: SessionConfig,
    observers: Vec<Arc<dyn Observer>>,
    metrics: SessionMetrics,
    active: Mutex<HashMap<u64, CancellationToken>>,
    next_request_id: AtomicU64,
}

pub struct SessionBuilder {
    transport: Arc<dyn Transport>,
    parsers: Option<Arc<ParserRegistry>>,
    config: SessionConfig,
    observers: Vec<Arc<dyn Observer>>,
}

impl SessionBuilder {
    fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            parsers: None,
            config: SessionConfig::default(),
            observers: Vec::new(),
        }
    }

    pub fn parsers(mut self, parsers: Arc<ParserRegistry>) -> Self {
        self.parsers = Some(parsers);
        self
    }

    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn default_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.config.default_headers.insert(name, value);
        self
    }

    pub fn request_timeout(mut self, request_timeout: Duration) -> Self {
        self.config.request_timeout = Some(request_timeout);
        self
    }

    pub fn cache_policy(mut self, cache_policy: CachePolicy) -> Self {
        self.config.cache_policy = Some(cache_policy);
        self
    }

    pub fn observer_arc(mut self, observer: Arc<dyn Observer>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn observer<O>(self, observer: O) -> Self
    where
        O: Observer + 'static,
    {
        self.observer_arc(Arc::new(observer))
    }

    pub fn build(self) -> Session {
        Session {
            inner: Arc::new(SessionInner {
                transport: self.transport,
                parsers: self
                    .parsers
                    .unwrap_or_else(|| Arc::new(ParserRegistry::with_defaults())),
                config: self.config,
                observers: self.observers,
                metrics: SessionMetrics::default(),
                active: Mutex::new(HashMap::new()),
                next_request_id: AtomicU64::new(1),
            }),
        }
    }
}

impl Session {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self::builder(transport).build()
    }

    pub fn builder(transport: Arc<dyn Transport>) -> SessionBuilder {
        SessionBuilder::new(transport)
    }

    #[cfg(feature = "hyper-transport")]
    pub fn with_default_transport() -> std::result::Result<Self, TransportError> {
        let transport = crate::transport::HyperTransport::try_new()?;
        Ok(Self::new(Arc::new(transport)))
    }

    /// A lazily created process-wide session on the default transport.
    #[cfg(feature = "hyper-transport")]
    pub fn shared() -> std::result::Result<&'static Session, TransportError> {
        static SHARED: once_cell::sync::OnceCell<Session> = once_cell::sync::OnceCell::new();
        SHARED.get_or_try_init(Self::with_default_transport)
    }

    pub fn parsers(&self) -> &Arc<ParserRegistry> {
        &self.inner.parsers
    }

    pub fn register_parser(&self, mime_types: &[&str], parser: Arc<dyn DataParser>) {
        self.inner.parsers.register(mime_types, parser);
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    pub fn metrics_snapshot(&self) -> SessionMetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    pub fn active_count(&self) -> usize {
        lock_unpoisoned(&self.inner.active).len()
    }

    /// Starts `request` and returns without waiting for it.
    ///
    /// A request that cannot be built into a valid wire request fails with
    /// [`Error::InvalidRequest`] without reaching the transport.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    pub fn execute(&self, mut request: Request) -> RequestHandle {
        let request_id = self.inner.next_request_id.fetch_add(1, Ordering::Relaxed);
        let started_at = Instant::now();
        let canceller = RequestCanceller::new();
        let (sender, receiver) = oneshot::channel();

        if let Some(provider) = request.authorization().cloned() {
            provider.attach_authorization(&mut request);
        }
        let uri = request.full_url();
        let redacted_uri = redact_uri_for_logs(&uri);
        let context = RequestContext::new(request_id, request.method().clone(), redacted_uri);
        let handle = RequestHandle {
            request_id,
            request: request.clone(),
            canceller: canceller.clone(),
            receiver,
        };

        self.inner.metrics.record_request_started();
        for observer in &self.inner.observers {
            observer.on_request_start(&context);
        }

        let wire_request = match request.build_wire_request(&self.inner.config) {
            Ok(wire_request) => wire_request,
            Err(error) => {
                debug!(
                    request_id,
                    method = %context.method(),
                    uri = %context.uri(),
                    error = %error,
                    "rejected request before dispatch"
                );
                let response = Response::failed(request, error, started_at.elapsed());
                self.inner.finish(&context, &response);
                let _ = sender.send(response);
                return handle;
            }
        };

        lock_unpoisoned(&self.inner.active).insert(request_id, canceller.token.clone());

        let span = info_span!(
            "fetchx.request",
            method = %context.method(),
            uri = %context.uri(),
            request_id = request_id
        );
        let inner = Arc::clone(&self.inner);
        let token = canceller.token;
        tokio::spawn(
            async move {
                let in_flight = inner.metrics.enter_in_flight();
                let timeout = wire_request.timeout;
                debug!("sending request");
                let outcome = tokio::select! {
                    biased;
                    _ = token.cancelled() => Err(TransportError::cancelled()),
                    outcome = inner.transport.send(wire_request) => outcome,
                };
                lock_unpoisoned(&inner.active).remove(&request_id);
                drop(in_flight);

                let response = handle_response(
                    request,
                    uri,
                    outcome,
                    inner.parsers.as_ref(),
                    timeout,
                    started_at,
                )
                .await;
                debug!(
                    status = response.status().map(|status| status.as_u16()),
                    elapsed_ms = response.elapsed().as_millis() as u64,
                    error = response.error().map(|error| error.code().as_str()),
                    "request completed"
                );
                inner.finish(&context, &response);
                let _ = sender.send(response);
            }
            .instrument(span),
        );

        handle
    }

    /// Executes `request` and waits for its response.
    pub async fn send(&self, request: Request) -> Response {
        self.execute(request).await
    }

    pub async fn get(&self, url: impl Into<String>) -> Response {
        self.send(Request::get(url)).await
    }

    pub async fn delete(&self, url: impl Into<String>) -> Response {
        self.send(Request::delete(url)).await
    }

    pub async fn post(
        &self,
        url: impl Into<String>,
        body: impl Into<Bytes>,
        content_type: impl Into<String>,
    ) -> Response {
        self.send(Request::post(url).with_body(body, content_type))
            .await
    }

    pub async fn put(
        &self,
        url: impl Into<String>,
        body: impl Into<Bytes>,
        content_type: impl Into<String>,
    ) -> Response {
        self.send(Request::put(url).with_body(body, content_type))
            .await
    }

    /// Cancels every request currently in flight. Each still completes, with
    /// [`Error::UserCancelled`].
    pub fn cancel_all(&self) {
        let tokens: Vec<CancellationToken> =
            lock_unpoisoned(&self.inner.active).values().cloned().collect();
        debug!(count = tokens.len(), "cancelling active requests");
        for token in tokens {
            token.cancel();
        }
    }

    pub(crate) fn record_renewal(&self, outcome: &Result<bool>) {
        if matches!(outcome, Ok(true)) {
            self.inner.metrics.record_renewal();
        }
        for observer in &self.inner.observers {
            observer.on_renewal(outcome);
        }
    }
}

impl SessionInner {
    fn finish(&self, context: &RequestContext, response: &Response) {
        self.metrics.record_response(response);
        for observer in &self.observers {
            observer.on_response(context, response);
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("Session")
            .field("parsers", &self.inner.parsers)
            .field("config", &self.inner.config)
            .field("active", &self.active_count())
            .finish_non_exhaustive()
    }
}

/// Cancels one request; cloneable so it can outlive the [`RequestHandle`].
#[derive(Clone, Debug)]
pub struct RequestCanceller {
    token: CancellationToken,
}

impl RequestCanceller {
    fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// A request started by [`Session::execute`]. Await it for the [`Response`].
#[derive(Debug)]
pub struct RequestHandle {
    request_id: u64,
    request: Request,
    canceller: RequestCanceller,
    receiver: oneshot::Receiver<Response>,
}

impl RequestHandle {
    pub fn id(&self) -> u64 {
        self.request_id
    }

    pub fn method(&self) -> &Method {
        self.request.method()
    }

    pub fn cancel(&self) {
        self.canceller.cancel();
    }

    pub fn canceller(&self) -> RequestCanceller {
        self.canceller.clone()
    }

    pub async fn response(self) -> Response {
        let Self {
            request, receiver, ..
        } = self;
        match receiver.await {
            Ok(response) => response,
            Err(_) => {
                let error = Error::unknown(
                    request.method(),
                    &request.full_url(),
                    "request task ended without a response",
                );
                Response::failed(request, error, Duration::ZERO)
            }
        }
    }
}

impl IntoFuture for RequestHandle {
    type Output = Response;
    type IntoFuture = BoxFuture<'static, Response>;

    fn into_future(self) -> Self::IntoFuture {
        self.response().boxed()
    }
}

