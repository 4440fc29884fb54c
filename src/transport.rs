use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use http::{HeaderMap, Method, StatusCode};
use thiserror::Error;

use crate::error::SharedError;
use crate::request::CachePolicy;

/// A fully built request, ready for one round trip.
#[derive(Clone, Debug)]
pub struct WireRequest {
    pub method: Method,
    pub url: url::Url,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    pub timeout: Duration,
    pub cache_policy: CachePolicy,
}

#[derive(Clone, Debug)]
pub struct TransportResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl TransportResponse {
    pub fn new(status: StatusCode, headers: HeaderMap, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers,
            body: body.into(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum TransportErrorKind {
    NotConnected,
    HostNotFound,
    TimedOut,
    Cancelled,
    Other,
}

impl std::fmt::Display for TransportErrorKind {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::NotConnected => "not_connected",
            Self::HostNotFound => "host_not_found",
            Self::TimedOut => "timed_out",
            Self::Cancelled => "cancelled",
            Self::Other => "other",
        };
        formatter.write_str(text)
    }
}

#[derive(Clone, Debug, Error)]
#[error("{kind} transport error: {source}")]
pub struct TransportError {
    kind: TransportErrorKind,
    #[source]
    source: SharedError,
}

#[derive(Debug, Error)]
#[error("operation cancelled")]
struct CancelledByCaller;

#[derive(Debug, Error)]
#[error("no response within {0:?}")]
struct Elapsed(Duration);

impl TransportError {
    pub fn new<E>(kind: TransportErrorKind, source: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self {
            kind,
            source: Arc::from(source.into()),
        }
    }

    pub fn cancelled() -> Self {
        Self::new(TransportErrorKind::Cancelled, CancelledByCaller)
    }

    pub fn timed_out(timeout: Duration) -> Self {
        Self::new(TransportErrorKind::TimedOut, Elapsed(timeout))
    }

    pub fn kind(&self) -> TransportErrorKind {
        self.kind
    }

    pub(crate) fn into_source(self) -> SharedError {
        self.source
    }
}

/// One HTTP round trip.
///
/// Implementations deliver exactly one result per call. The per-request timeout in
/// [`WireRequest::timeout`] is advisory; expiry must be reported as
/// [`TransportErrorKind::TimedOut`]. Cancellation is driven by the session, which drops the
/// returned future.
pub trait Transport: Send + Sync {
    fn send(
        &self,
        request: WireRequest,
    ) -> BoxFuture<'static, Result<TransportResponse, TransportError>>;
}

#[cfg(feature = "hyper-transport")]
pub use self::hyper_transport::HyperTransport;

#[cfg(feature = "hyper-transport")]
mod hyper_transport {
    use std::error::Error as StdError;

    use bytes::Bytes;
    use futures_util::FutureExt;
    use futures_util::future::BoxFuture;
    use http::HeaderValue;
    use http::header::CACHE_CONTROL;
    use http_body_util::{BodyExt, Full};
    use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
    use hyper_util::client::legacy::Client;
    use hyper_util::client::legacy::connect::HttpConnector;
    use hyper_util::rt::TokioExecutor;

    use super::{Transport, TransportError, TransportErrorKind, TransportResponse, WireRequest};
    use crate::request::CachePolicy;

    type HyperClient = Client<HttpsConnector<HttpConnector>, Full<Bytes>>;

    /// Pooled HTTP/1.1 transport over rustls.
    #[derive(Clone)]
    pub struct HyperTransport {
        client: HyperClient,
    }

    impl HyperTransport {
        pub fn try_new() -> Result<Self, TransportError> {
            let mut connector = HttpConnector::new();
            connector.enforce_http(false);
            let https = HttpsConnectorBuilder::new()
                .with_provider_and_webpki_roots(rustls::crypto::ring::default_provider())
                .map_err(|source| TransportError::new(TransportErrorKind::Other, source))?
                .https_or_http()
                .enable_http1()
                .wrap_connector(connector);
            let client = Client::builder(TokioExecutor::new()).build(https);
            Ok(Self { client })
        }
    }

    impl std::fmt::Debug for HyperTransport {
        fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            formatter.debug_struct("HyperTransport").finish_non_exhaustive()
        }
    }

    impl Transport for HyperTransport {
        fn send(
            &self,
            request: WireRequest,
        ) -> BoxFuture<'static, Result<TransportResponse, TransportError>> {
            let client = self.client.clone();
            async move {
                let timeout_value = request.timeout;
                let http_request = build_http_request(request)?;
                let round_trip = async {
                    let response = client
                        .request(http_request)
                        .await
                        .map_err(classify_client_error)?;
                    let (parts, body) = response.into_parts();
                    let body = body
                        .collect()
                        .await
                        .map_err(|source| TransportError::new(TransportErrorKind::Other, source))?
                        .to_bytes();
                    Ok::<_, TransportError>(TransportResponse::new(
                        parts.status,
                        parts.headers,
                        body,
                    ))
                };
                match tokio::time::timeout(timeout_value, round_trip).await {
                    Ok(result) => result,
                    Err(_) => Err(TransportError::timed_out(timeout_value)),
                }
            }
            .boxed()
        }
    }

    fn build_http_request(
        request: WireRequest,
    ) -> Result<http::Request<Full<Bytes>>, TransportError> {
        let mut builder = http::Request::builder()
            .method(request.method)
            .uri(request.url.as_str());
        if let Some(headers) = builder.headers_mut() {
            headers.extend(request.headers);
            if request.cache_policy == CachePolicy::ReloadIgnoringCache {
                headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
            }
        }
        builder
            .body(Full::new(request.body.unwrap_or_default()))
            .map_err(|source| TransportError::new(TransportErrorKind::Other, source))
    }

    fn classify_client_error(error: hyper_util::client::legacy::Error) -> TransportError {
        let mut text = error.to_string().to_ascii_lowercase();
        let mut unreachable = false;
        let mut cause = error.source();
        while let Some(inner) = cause {
            if let Some(io_error) = inner.downcast_ref::<std::io::Error>() {
                unreachable |= matches!(
                    io_error.kind(),
                    std::io::ErrorKind::NetworkUnreachable | std::io::ErrorKind::NetworkDown
                );
            }
            text.push_str(": ");
            text.push_str(&inner.to_string().to_ascii_lowercase());
            cause = inner.source();
        }

        let kind = if error.is_connect()
            && (text.contains("dns error")
                || text.contains("failed to lookup address")
                || text.contains("name or service not known")
                || text.contains("nodename nor servname"))
        {
            TransportErrorKind::HostNotFound
        } else if unreachable || text.contains("network is unreachable") {
            TransportErrorKind::NotConnected
        } else {
            TransportErrorKind::Other
        };
        TransportError::new(kind, error)
    }
}
