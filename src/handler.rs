use std::sync::Arc;
use std::time::Instant;

use serde::de::DeserializeOwned;
use tracing::warn;

use crate::error::{classify_status, classify_transport_error, is_success_status};
use crate::parser::{BinaryParser, DataParser, JsonDecodeParser, ParseContext, ParsedBody};
use crate::request::Request;
use crate::response::Response;
use crate::transport::{TransportError, TransportResponse};
use crate::util::redact_uri_for_logs;

/// A success-parser and error-parser pair attached to a request.
#[derive(Clone)]
pub struct ResponseHandler {
    success: Arc<dyn DataParser>,
    error: Arc<dyn DataParser>,
}

impl ResponseHandler {
    pub fn new(success: Arc<dyn DataParser>, error: Arc<dyn DataParser>) -> Self {
        Self { success, error }
    }

    /// Returns raw bytes for every status.
    pub fn passthrough() -> Self {
        let parser: Arc<dyn DataParser> = Arc::new(BinaryParser);
        Self::new(Arc::clone(&parser), parser)
    }

    pub fn json<S, E>() -> Self
    where
        S: DeserializeOwned + Send + Sync + 'static,
        E: DeserializeOwned + Send + Sync + 'static,
    {
        Self::new(
            Arc::new(JsonDecodeParser::<S>::new()),
            Arc::new(JsonDecodeParser::<E>::new()),
        )
    }

    pub fn success_parser(&self) -> &Arc<dyn DataParser> {
        &self.success
    }

    pub fn error_parser(&self) -> &Arc<dyn DataParser> {
        &self.error
    }
}

impl std::fmt::Debug for ResponseHandler {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.debug_struct("ResponseHandler").finish_non_exhaustive()
    }
}

pub(crate) async fn handle_response(
    request: Request,
    uri: String,
    outcome: Result<TransportResponse, TransportError>,
    registry: &dyn DataParser,
    timeout: std::time::Duration,
    started_at: Instant,
) -> Response {
    let method = request.method().clone();
    let transport_response = match outcome {
        Ok(transport_response) => transport_response,
        Err(transport_error) => {
            warn!(
                method = %method,
                uri = %redact_uri_for_logs(&uri),
                kind = %transport_error.kind(),
                error = %transport_error,
                "transport failed"
            );
            let error = classify_transport_error(transport_error, &method, &uri, timeout);
            return Response::failed(request, error, started_at.elapsed());
        }
    };

    let TransportResponse {
        status,
        headers,
        body,
    } = transport_response;
    let success = is_success_status(status);

    if body.is_empty() {
        let outcome = if success {
            Ok(None)
        } else {
            Err(classify_status(status, &method, &uri, None))
        };
        return Response::new(request, status, headers, body, outcome, started_at.elapsed());
    }

    let context = ParseContext::new(&method, &uri, status, &headers);
    let parsed = match request.response_handler() {
        Some(handler) if success => handler.success_parser().parse(body.clone(), &context).await,
        Some(handler) => handler.error_parser().parse(body.clone(), &context).await,
        None => registry.parse(body.clone(), &context).await,
    };

    let outcome = match parsed {
        Err(error) => Err(error),
        Ok(payload) if !success => Err(classify_status(status, &method, &uri, payload)),
        Ok(Some(parsed)) => Ok(Some(parsed)),
        Ok(None) => Ok(Some(ParsedBody::Binary(body.clone()))),
    };
    Response::new(request, status, headers, body, outcome, started_at.elapsed())
}
