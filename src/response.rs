use std::time::{Duration, SystemTime};

use bytes::Bytes;
use http::{HeaderMap, StatusCode};

use crate::error::{Error, Result, is_success_status};
use crate::parser::ParsedBody;
use crate::request::Request;
use crate::util::mime_type;

/// The outcome of one attempt.
///
/// When a body was received, exactly one of [`Response::parsed`] and [`Response::error`] is set.
/// Both are absent only for an empty 2xx response.
#[derive(Clone, Debug)]
pub struct Response {
    request: Request,
    status: Option<StatusCode>,
    headers: Option<HeaderMap>,
    body: Option<Bytes>,
    parsed: Option<ParsedBody>,
    error: Option<Error>,
    completed_at: SystemTime,
    elapsed: Duration,
}

impl Response {
    pub(crate) fn new(
        request: Request,
        status: StatusCode,
        headers: HeaderMap,
        body: Bytes,
        outcome: std::result::Result<Option<ParsedBody>, Error>,
        elapsed: Duration,
    ) -> Self {
        let (parsed, error) = match outcome {
            Ok(parsed) => (parsed, None),
            Err(error) => (None, Some(error)),
        };
        Self {
            request,
            status: Some(status),
            headers: Some(headers),
            body: Some(body),
            parsed,
            error,
            completed_at: SystemTime::now(),
            elapsed,
        }
    }

    pub(crate) fn failed(request: Request, error: Error, elapsed: Duration) -> Self {
        Self {
            request,
            status: None,
            headers: None,
            body: None,
            parsed: None,
            error: Some(error),
            completed_at: SystemTime::now(),
            elapsed,
        }
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn status(&self) -> Option<StatusCode> {
        self.status
    }

    pub fn headers(&self) -> Option<&HeaderMap> {
        self.headers.as_ref()
    }

    pub fn body(&self) -> Option<&Bytes> {
        self.body.as_ref()
    }

    pub fn parsed(&self) -> Option<&ParsedBody> {
        self.parsed.as_ref()
    }

    pub fn parsed_as<T>(&self) -> Option<&T>
    where
        T: 'static,
    {
        self.parsed.as_ref()?.downcast_ref()
    }

    pub fn error(&self) -> Option<&Error> {
        self.error.as_ref()
    }

    pub fn completed_at(&self) -> SystemTime {
        self.completed_at
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    pub fn mime_type(&self) -> Option<String> {
        mime_type(self.headers.as_ref()?)
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none() && self.status.is_some_and(is_success_status)
    }

    pub fn text_lossy(&self) -> Option<String> {
        self.body
            .as_ref()
            .map(|body| String::from_utf8_lossy(body).into_owned())
    }

    /// Converts into the parsed value, surfacing the classified error if there is one.
    pub fn into_result(self) -> Result<Option<ParsedBody>> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.parsed),
        }
    }
}
