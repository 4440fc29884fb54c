use http::Method;

use crate::error::Error;
use crate::response::Response;

/// Identifies one dispatched attempt for observers.
#[derive(Clone, Debug)]
pub struct RequestContext {
    request_id: u64,
    method: Method,
    uri: String,
}

impl RequestContext {
    pub(crate) fn new(request_id: u64, method: Method, uri: String) -> Self {
        Self {
            request_id,
            method,
            uri,
        }
    }

    pub fn request_id(&self) -> u64 {
        self.request_id
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    /// The request url with userinfo, query and fragment removed.
    pub fn uri(&self) -> &str {
        &self.uri
    }
}

pub trait Observer: Send + Sync {
    fn on_request_start(&self, _context: &RequestContext) {}

    fn on_response(&self, _context: &RequestContext, _response: &Response) {}

    /// Called once per renewal cycle with `Ok(true)` when credentials were refreshed.
    fn on_renewal(&self, _outcome: &Result<bool, Error>) {}
}
