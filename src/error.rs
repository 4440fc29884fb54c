use std::sync::Arc;
use std::time::Duration;

use http::{Method, StatusCode};
use thiserror::Error;

use crate::parser::ParsedBody;
use crate::transport::{TransportError, TransportErrorKind};

pub(crate) type SharedError = Arc<dyn std::error::Error + Send + Sync>;

/// Domain marker carried by every [`Error`] produced by this crate.
pub const ERROR_DOMAIN: &str = "fetchx.http";

pub type Result<T> = std::result::Result<T, Error>;

/// The closed error taxonomy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorCode {
    NoInternet,
    CannotFindHost,
    TimedOut,
    HttpFailure,
    HttpError,
    UserCancelled,
    InvalidRequest,
    ParseFailure,
    AuthorizationNeeded,
    UnknownError,
}

impl ErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NoInternet => "no_internet",
            Self::CannotFindHost => "cannot_find_host",
            Self::TimedOut => "timed_out",
            Self::HttpFailure => "http_failure",
            Self::HttpError => "http_error",
            Self::UserCancelled => "user_cancelled",
            Self::InvalidRequest => "invalid_request",
            Self::ParseFailure => "parse_failure",
            Self::AuthorizationNeeded => "authorization_needed",
            Self::UnknownError => "unknown_error",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("not connected to the internet for {method} {uri}: {source}")]
    NoInternet {
        method: Method,
        uri: String,
        #[source]
        source: SharedError,
    },
    #[error("cannot find host for {method} {uri}: {source}")]
    CannotFindHost {
        method: Method,
        uri: String,
        #[source]
        source: SharedError,
    },
    #[error("request timed out after {timeout_ms}ms for {method} {uri}")]
    TimedOut {
        timeout_ms: u128,
        method: Method,
        uri: String,
        #[source]
        source: Option<SharedError>,
    },
    #[error("http transport failure for {method} {uri}: {source}")]
    HttpFailure {
        method: Method,
        uri: String,
        #[source]
        source: SharedError,
    },
    #[error("http status error {status} for {method} {uri}")]
    HttpError {
        status: u16,
        method: Method,
        uri: String,
        payload: Option<ParsedBody>,
    },
    #[error("request cancelled: {method} {uri}")]
    UserCancelled {
        method: Method,
        uri: String,
        #[source]
        source: Option<SharedError>,
    },
    #[error("invalid request {method} {uri}: {reason}")]
    InvalidRequest {
        method: Method,
        uri: String,
        reason: String,
    },
    #[error("failed to parse response body for {method} {uri}: {source}")]
    ParseFailure {
        status: Option<u16>,
        method: Method,
        uri: String,
        #[source]
        source: SharedError,
    },
    #[error("authorization needed ({status}) for {method} {uri}")]
    AuthorizationNeeded {
        status: u16,
        method: Method,
        uri: String,
        payload: Option<ParsedBody>,
    },
    #[error("unexpected failure for {method} {uri}: {message}")]
    UnknownError {
        method: Method,
        uri: String,
        message: String,
    },
}

impl Error {
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::NoInternet { .. } => ErrorCode::NoInternet,
            Self::CannotFindHost { .. } => ErrorCode::CannotFindHost,
            Self::TimedOut { .. } => ErrorCode::TimedOut,
            Self::HttpFailure { .. } => ErrorCode::HttpFailure,
            Self::HttpError { .. } => ErrorCode::HttpError,
            Self::UserCancelled { .. } => ErrorCode::UserCancelled,
            Self::InvalidRequest { .. } => ErrorCode::InvalidRequest,
            Self::ParseFailure { .. } => ErrorCode::ParseFailure,
            Self::AuthorizationNeeded { .. } => ErrorCode::AuthorizationNeeded,
            Self::UnknownError { .. } => ErrorCode::UnknownError,
        }
    }

    pub const fn domain(&self) -> &'static str {
        ERROR_DOMAIN
    }

    pub fn method(&self) -> &Method {
        match self {
            Self::NoInternet { method, .. }
            | Self::CannotFindHost { method, .. }
            | Self::TimedOut { method, .. }
            | Self::HttpFailure { method, .. }
            | Self::HttpError { method, .. }
            | Self::UserCancelled { method, .. }
            | Self::InvalidRequest { method, .. }
            | Self::ParseFailure { method, .. }
            | Self::AuthorizationNeeded { method, .. }
            | Self::UnknownError { method, .. } => method,
        }
    }

    pub fn uri(&self) -> &str {
        match self {
            Self::NoInternet { uri, .. }
            | Self::CannotFindHost { uri, .. }
            | Self::TimedOut { uri, .. }
            | Self::HttpFailure { uri, .. }
            | Self::HttpError { uri, .. }
            | Self::UserCancelled { uri, .. }
            | Self::InvalidRequest { uri, .. }
            | Self::ParseFailure { uri, .. }
            | Self::AuthorizationNeeded { uri, .. }
            | Self::UnknownError { uri, .. } => uri,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::HttpError { status, .. } | Self::AuthorizationNeeded { status, .. } => {
                Some(*status)
            }
            Self::ParseFailure { status, .. } => *status,
            _ => None,
        }
    }

    /// The parsed application-level error body attached to a status error.
    pub fn payload(&self) -> Option<&ParsedBody> {
        match self {
            Self::HttpError { payload, .. } | Self::AuthorizationNeeded { payload, .. } => {
                payload.as_ref()
            }
            _ => None,
        }
    }

    pub fn payload_as<T>(&self) -> Option<&T>
    where
        T: 'static,
    {
        self.payload()?.downcast_ref()
    }

    pub fn underlying(&self) -> Option<&(dyn std::error::Error + Send + Sync + 'static)> {
        match self {
            Self::NoInternet { source, .. }
            | Self::CannotFindHost { source, .. }
            | Self::HttpFailure { source, .. }
            | Self::ParseFailure { source, .. } => Some(source.as_ref()),
            Self::TimedOut { source, .. } | Self::UserCancelled { source, .. } => source.as_deref(),
            _ => None,
        }
    }

    /// Builds a `ParseFailure` for a decoder error raised while parsing a response body.
    pub fn parse_failure<E>(
        source: E,
        method: &Method,
        uri: &str,
        status: Option<StatusCode>,
    ) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::ParseFailure {
            status: status.map(|status| status.as_u16()),
            method: method.clone(),
            uri: uri.to_owned(),
            source: Arc::new(source),
        }
    }

    pub fn authorization_needed(method: &Method, uri: &str, status: u16) -> Self {
        Self::AuthorizationNeeded {
            status,
            method: method.clone(),
            uri: uri.to_owned(),
            payload: None,
        }
    }

    pub fn unknown(method: &Method, uri: &str, message: impl Into<String>) -> Self {
        Self::UnknownError {
            method: method.clone(),
            uri: uri.to_owned(),
            message: message.into(),
        }
    }

    pub(crate) fn invalid_request(method: &Method, uri: &str, reason: impl Into<String>) -> Self {
        Self::InvalidRequest {
            method: method.clone(),
            uri: uri.to_owned(),
            reason: reason.into(),
        }
    }

    pub(crate) fn cancelled(method: &Method, uri: &str) -> Self {
        Self::UserCancelled {
            method: method.clone(),
            uri: uri.to_owned(),
            source: None,
        }
    }
}

pub(crate) const fn is_success_status(status: StatusCode) -> bool {
    matches!(status.as_u16(), 200..=299)
}

pub(crate) fn classify_transport_error(
    error: TransportError,
    method: &Method,
    uri: &str,
    timeout: Duration,
) -> Error {
    let method = method.clone();
    let uri = uri.to_owned();
    match error.kind() {
        TransportErrorKind::NotConnected => Error::NoInternet {
            method,
            uri,
            source: error.into_source(),
        },
        TransportErrorKind::HostNotFound => Error::CannotFindHost {
            method,
            uri,
            source: error.into_source(),
        },
        TransportErrorKind::TimedOut => Error::TimedOut {
            timeout_ms: timeout.as_millis(),
            method,
            uri,
            source: Some(error.into_source()),
        },
        TransportErrorKind::Cancelled => Error::UserCancelled {
            method,
            uri,
            source: Some(error.into_source()),
        },
        TransportErrorKind::Other => Error::HttpFailure {
            method,
            uri,
            source: error.into_source(),
        },
    }
}

/// Classifies a non-2xx status, attaching the already parsed body.
pub(crate) fn classify_status(
    status: StatusCode,
    method: &Method,
    uri: &str,
    payload: Option<ParsedBody>,
) -> Error {
    let method = method.clone();
    let uri = uri.to_owned();
    if status == StatusCode::UNAUTHORIZED {
        Error::AuthorizationNeeded {
            status: status.as_u16(),
            method,
            uri,
            payload,
        }
    } else {
        Error::HttpError {
            status: status.as_u16(),
            method,
            uri,
            payload,
        }
    }
}
