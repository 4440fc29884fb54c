use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::header::{CONTENT_LENGTH, CONTENT_TYPE, HeaderName, HeaderValue};
use http::{HeaderMap, Method};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::auth::AuthorizationProvider;
use crate::config::{SessionConfig, default_cache_policy, default_timeout};
use crate::error::{Error, Result};
use crate::form::MultipartForm;
use crate::handler::ResponseHandler;
use crate::parser::content_type;
use crate::transport::WireRequest;
use crate::util::{append_query, merge_headers};

/// How the transport should treat locally cached protocol responses.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CachePolicy {
    #[default]
    UseProtocol = 0,
    ReloadIgnoringCache = 1,
    ReturnCacheElseLoad = 2,
    ReturnCacheDontLoad = 3,
}

impl CachePolicy {
    pub(crate) const fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::ReloadIgnoringCache,
            2 => Self::ReturnCacheElseLoad,
            3 => Self::ReturnCacheDontLoad,
            _ => Self::UseProtocol,
        }
    }
}

/// A request description.
///
/// It stays mutable until it is handed to a session and may be dispatched more than once, which is
/// how the authorization coordinator retries after renewal.
#[derive(Clone)]
pub struct Request {
    method: Method,
    url: String,
    query: BTreeMap<String, String>,
    headers: HeaderMap,
    body: Option<Bytes>,
    content_type: Option<String>,
    timeout: Option<Duration>,
    cache_policy: Option<CachePolicy>,
    authorization: Option<Arc<dyn AuthorizationProvider>>,
    response_handler: Option<ResponseHandler>,
    form: Option<MultipartForm>,
}

impl Request {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            query: BTreeMap::new(),
            headers: HeaderMap::new(),
            body: None,
            content_type: None,
            timeout: None,
            cache_policy: None,
            authorization: None,
            response_handler: None,
            form: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new(Method::POST, url)
    }

    pub fn put(url: impl Into<String>) -> Self {
        Self::new(Method::PUT, url)
    }

    pub fn delete(url: impl Into<String>) -> Self {
        Self::new(Method::DELETE, url)
    }

    pub fn head(url: impl Into<String>) -> Self {
        Self::new(Method::HEAD, url)
    }

    pub fn patch(url: impl Into<String>) -> Self {
        Self::new(Method::PATCH, url)
    }

    pub fn with_query(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.query.insert(name.into(), value.to_string());
        self
    }

    pub fn with_query_pairs<K, V, I>(mut self, pairs: I) -> Self
    where
        K: Into<String>,
        V: ToString,
        I: IntoIterator<Item = (K, V)>,
    {
        self.query.extend(
            pairs
                .into_iter()
                .map(|(name, value)| (name.into(), value.to_string())),
        );
        self
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn try_header(self, name: &str, value: &str) -> Result<Self> {
        let header_name = HeaderName::from_bytes(name.as_bytes()).map_err(|source| {
            Error::invalid_request(
                &self.method,
                &self.url,
                format!("invalid header name {name:?}: {source}"),
            )
        })?;
        let header_value = HeaderValue::from_str(value).map_err(|source| {
            Error::invalid_request(
                &self.method,
                &self.url,
                format!("invalid value for header {name:?}: {source}"),
            )
        })?;
        Ok(self.with_header(header_name, header_value))
    }

    pub fn with_body(mut self, body: impl Into<Bytes>, content_type: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_json<T>(self, value: &T) -> Result<Self>
    where
        T: Serialize + ?Sized,
    {
        let body = serde_json::to_vec(value).map_err(|source| {
            Error::invalid_request(
                &self.method,
                &self.url,
                format!("failed to encode json body: {source}"),
            )
        })?;
        Ok(self.with_body(body, content_type::APPLICATION_JSON))
    }

    pub fn with_form<T>(self, value: &T) -> Result<Self>
    where
        T: Serialize + ?Sized,
    {
        let body = serde_urlencoded::to_string(value).map_err(|source| {
            Error::invalid_request(
                &self.method,
                &self.url,
                format!("failed to encode form body: {source}"),
            )
        })?;
        Ok(self.with_body(body, content_type::FORM_ENCODED))
    }

    pub fn with_multipart(mut self, form: MultipartForm) -> Self {
        self.form = Some(form);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_cache_policy(mut self, cache_policy: CachePolicy) -> Self {
        self.cache_policy = Some(cache_policy);
        self
    }

    pub fn with_authorization(mut self, provider: Arc<dyn AuthorizationProvider>) -> Self {
        self.authorization = Some(provider);
        self
    }

    pub fn with_response_handler(mut self, response_handler: ResponseHandler) -> Self {
        self.response_handler = Some(response_handler);
        self
    }

    /// Decodes 2xx bodies as `S` and error bodies as `E`.
    pub fn typed<S, E>(self) -> Self
    where
        S: DeserializeOwned + Send + Sync + 'static,
        E: DeserializeOwned + Send + Sync + 'static,
    {
        self.with_response_handler(ResponseHandler::json::<S, E>())
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn query(&self) -> &BTreeMap<String, String> {
        &self.query
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    pub fn body(&self) -> Option<&Bytes> {
        self.body.as_ref()
    }

    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn cache_policy(&self) -> Option<CachePolicy> {
        self.cache_policy
    }

    pub fn authorization(&self) -> Option<&Arc<dyn AuthorizationProvider>> {
        self.authorization.as_ref()
    }

    pub fn response_handler(&self) -> Option<&ResponseHandler> {
        self.response_handler.as_ref()
    }

    pub fn multipart(&self) -> Option<&MultipartForm> {
        self.form.as_ref()
    }

    /// The url with query parameters appended.
    pub fn full_url(&self) -> String {
        append_query(&self.url, &self.query)
    }

    pub(crate) fn effective_timeout(&self, config: &SessionConfig) -> Duration {
        self.timeout
            .or(config.request_timeout)
            .unwrap_or_else(default_timeout)
    }

    pub(crate) fn build_wire_request(&self, config: &SessionConfig) -> Result<WireRequest> {
        let full_url = self.full_url();
        let url = url::Url::parse(&full_url).map_err(|source| {
            Error::invalid_request(&self.method, &full_url, format!("malformed url: {source}"))
        })?;
        if url.host_str().is_none_or(str::is_empty) {
            return Err(Error::invalid_request(
                &self.method,
                &full_url,
                "url has no host",
            ));
        }

        let mut headers = merge_headers(&config.default_headers, &self.headers);
        let (body, content_type) = match &self.form {
            Some(form) => (Some(form.to_bytes()), Some(form.content_type())),
            None => (self.body.clone(), self.content_type.clone()),
        };
        if let Some(body) = &body {
            headers.insert(CONTENT_LENGTH, HeaderValue::from(body.len()));
            if let Some(content_type) = content_type {
                let value = HeaderValue::from_str(&content_type).map_err(|source| {
                    Error::invalid_request(
                        &self.method,
                        &full_url,
                        format!("invalid content type {content_type:?}: {source}"),
                    )
                })?;
                headers.insert(CONTENT_TYPE, value);
            }
        }

        Ok(WireRequest {
            method: self.method.clone(),
            url,
            headers,
            body,
            timeout: self.effective_timeout(config),
            cache_policy: self
                .cache_policy
                .or(config.cache_policy)
                .unwrap_or_else(default_cache_policy),
        })
    }
}

impl std::fmt::Debug for Request {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("Request")
            .field("method", &self.method)
            .field("url", &self.url)
            .field("query", &self.query)
            .field("headers", &self.headers)
            .field("body_len", &self.body.as_ref().map(Bytes::len))
            .field("content_type", &self.content_type)
            .field("timeout", &self.timeout)
            .field("cache_policy", &self.cache_policy)
            .field("has_authorization", &self.authorization.is_some())
            .field("response_handler", &self.response_handler)
            .field("multipart", &self.form)
            .finish()
    }
}
