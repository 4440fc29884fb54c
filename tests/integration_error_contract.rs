use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use fetchx::prelude::{
    Error, ErrorCode, ParsedBody, Request, Response, ResponseHandler, Session, Transport,
    TransportError, TransportErrorKind, TransportResponse, WireRequest,
};
use fetchx::{DataParser, ERROR_DOMAIN, Observer, ParseContext, ParseResult, RequestContext};
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use http::header::CONTENT_TYPE;
use http::{HeaderMap, HeaderValue, Method, StatusCode};

type Reply = Arc<dyn Fn(&WireRequest) -> Result<TransportResponse, TransportError> + Send + Sync>;

struct ScriptedTransport {
    reply: Reply,
    delay: Duration,
    calls: AtomicUsize,
    seen: Mutex<Vec<WireRequest>>,
}

impl ScriptedTransport {
    fn new<F>(reply: F) -> Arc<Self>
    where
        F: Fn(&WireRequest) -> Result<TransportResponse, TransportError> + Send + Sync + 'static,
    {
        Self::with_delay(Duration::ZERO, reply)
    }

    fn with_delay<F>(delay: Duration, reply: F) -> Arc<Self>
    where
        F: Fn(&WireRequest) -> Result<TransportResponse, TransportError> + Send + Sync + 'static,
    {
        Arc::new(Self {
            reply: Arc::new(reply),
            delay,
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn seen(&self) -> Vec<WireRequest> {
        self.seen.lock().expect("lock seen requests").clone()
    }
}

impl Transport for ScriptedTransport {
    fn send(
        &self,
        request: WireRequest,
    ) -> BoxFuture<'static, Result<TransportResponse, TransportError>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen
            .lock()
            .expect("lock seen requests")
            .push(request.clone());
        let reply = Arc::clone(&self.reply);
        let delay = self.delay;
        async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            reply(&request)
        }
        .boxed()
    }
}

fn reply_with(
    status: u16,
    content_type: Option<&'static str>,
    body: &'static str,
) -> impl Fn(&WireRequest) -> Result<TransportResponse, TransportError> + Send + Sync + 'static {
    move |_| {
        let mut headers = HeaderMap::new();
        if let Some(content_type) = content_type {
            headers.insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
        }
        Ok(TransportResponse::new(
            StatusCode::from_u16(status).expect("valid status"),
            headers,
            Bytes::from_static(body.as_bytes()),
        ))
    }
}

async fn send_with(transport: Arc<ScriptedTransport>, request: Request) -> Response {
    Session::new(transport).send(request).await
}

fn assert_exclusive(response: &Response) {
    if response.body().is_some_and(|body| !body.is_empty()) {
        assert!(
            response.parsed().is_some() ^ response.error().is_some(),
            "exactly one of parsed/error must be set: {response:?}"
        );
    }
}

#[tokio::test]
async fn malformed_url_fails_without_reaching_transport() {
    let transport = ScriptedTransport::new(reply_with(200, None, ""));
    let session = Session::new(transport.clone());

    for url in ["ht tp://exa mple.com/<>", "not a url", "mailto:someone@example.com", "/relative"] {
        let response = session.send(Request::get(url)).await;
        let error = response.error().expect("invalid url must fail");
        assert_eq!(error.code(), ErrorCode::InvalidRequest, "{url}");
        assert_eq!(error.method(), &Method::GET);
        assert_eq!(error.uri(), url);
        assert!(response.status().is_none());
    }

    assert_eq!(transport.calls(), 0);
    assert_eq!(session.active_count(), 0);
    assert_eq!(session.metrics_snapshot().invalid_requests, 4);
}

#[tokio::test]
async fn status_boundaries_follow_success_range() {
    for (status, expected) in [
        (200, None),
        (299, None),
        (300, Some(ErrorCode::HttpError)),
        (401, Some(ErrorCode::AuthorizationNeeded)),
        (404, Some(ErrorCode::HttpError)),
        (500, Some(ErrorCode::HttpError)),
    ] {
        let transport = ScriptedTransport::new(move |_| {
            let mut headers = HeaderMap::new();
            headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
            Ok(TransportResponse::new(
                StatusCode::from_u16(status).expect("valid status"),
                headers,
                "body",
            ))
        });
        let response = send_with(transport, Request::get("http://api.test/status")).await;

        assert_eq!(response.error().map(Error::code), expected, "status {status}");
        assert_exclusive(&response);
        if expected.is_none() {
            assert_eq!(
                response.parsed().and_then(ParsedBody::as_text),
                Some("body")
            );
        } else {
            let error = response.error().expect("error expected");
            assert_eq!(error.status(), Some(status));
            assert_eq!(error.payload().and_then(ParsedBody::as_text), Some("body"));
        }
    }
}

#[tokio::test]
async fn empty_bodies_only_fail_for_error_statuses() {
    let ok = send_with(
        ScriptedTransport::new(reply_with(200, Some("application/json"), "")),
        Request::get("http://api.test/empty"),
    )
    .await;
    assert!(ok.parsed().is_none());
    assert!(ok.error().is_none());
    assert!(ok.is_success());

    let unauthorized = send_with(
        ScriptedTransport::new(reply_with(401, None, "")),
        Request::get("http://api.test/empty"),
    )
    .await;
    let error = unauthorized.error().expect("401 should fail");
    assert_eq!(error.code(), ErrorCode::AuthorizationNeeded);
    assert!(error.payload().is_none());
}

#[tokio::test]
async fn unregistered_content_type_falls_back_to_raw_bytes() {
    let response = send_with(
        ScriptedTransport::new(reply_with(200, Some("application/x-custom"), "opaque")),
        Request::get("http://api.test/blob"),
    )
    .await;

    assert!(response.error().is_none());
    assert_eq!(
        response.parsed().and_then(ParsedBody::as_bytes),
        Some(&Bytes::from_static(b"opaque"))
    );
}

#[tokio::test]
async fn malformed_json_from_registry_is_parse_failure() {
    let response = send_with(
        ScriptedTransport::new(reply_with(200, Some("application/json"), "{nope")),
        Request::get("http://api.test/json"),
    )
    .await;

    assert!(response.parsed().is_none());
    let error = response.error().expect("malformed json should fail");
    assert_eq!(error.code(), ErrorCode::ParseFailure);
    assert!(error.underlying().is_some());
    assert_eq!(error.domain(), ERROR_DOMAIN);
}

#[tokio::test]
async fn transport_errors_map_to_taxonomy() {
    for (kind, expected) in [
        (TransportErrorKind::NotConnected, ErrorCode::NoInternet),
        (TransportErrorKind::HostNotFound, ErrorCode::CannotFindHost),
        (TransportErrorKind::TimedOut, ErrorCode::TimedOut),
        (TransportErrorKind::Cancelled, ErrorCode::UserCancelled),
        (TransportErrorKind::Other, ErrorCode::HttpFailure),
    ] {
        let transport =
            ScriptedTransport::new(move |_| Err(TransportError::new(kind, "scripted failure")));
        let response = send_with(transport, Request::post("http://api.test/items")).await;

        let error = response.error().expect("transport error should surface");
        assert_eq!(error.code(), expected);
        assert_eq!(error.method(), &Method::POST);
        assert_eq!(error.uri(), "http://api.test/items");
        assert_eq!(
            error.underlying().map(|source| source.to_string()).as_deref(),
            Some("scripted failure"),
            "{kind} should keep its cause"
        );
        assert!(response.parsed().is_none());
        assert!(response.body().is_none());
    }
}

struct RejectingParser;

impl DataParser for RejectingParser {
    fn parse<'a>(
        &'a self,
        _body: Bytes,
        context: &'a ParseContext<'_>,
    ) -> BoxFuture<'a, ParseResult> {
        let error = Error::unknown(context.method(), context.uri(), "rejected by parser");
        async move { Err(error) }.boxed()
    }
}

#[tokio::test]
async fn per_request_handler_overrides_registry_and_parser_errors_win() {
    let parser: Arc<dyn DataParser> = Arc::new(RejectingParser);
    let request = Request::get("http://api.test/json")
        .with_response_handler(ResponseHandler::new(Arc::clone(&parser), parser));

    let response = send_with(
        ScriptedTransport::new(reply_with(500, Some("application/json"), r#"{"a":1}"#)),
        request,
    )
    .await;

    let error = response.error().expect("parser error should surface");
    assert_eq!(error.code(), ErrorCode::UnknownError);
    assert!(response.parsed().is_none());
}

#[tokio::test]
async fn wire_request_carries_query_headers_and_defaults() {
    let transport = ScriptedTransport::new(reply_with(204, None, ""));
    let session = Session::builder(transport.clone())
        .default_header(
            http::header::USER_AGENT,
            HeaderValue::from_static("fetchx-tests"),
        )
        .request_timeout(Duration::from_secs(3))
        .build();

    let request = Request::post("http://api.test/items?existing=1#section")
        .with_query("name", "a b&c")
        .with_json(&serde_json::json!({"name": "demo"}))
        .expect("json body should encode");
    let response = session.send(request).await;
    assert!(response.error().is_none());

    let seen = transport.seen();
    assert_eq!(seen.len(), 1);
    let wire = &seen[0];
    assert_eq!(wire.url.query(), Some("existing=1&name=a+b%26c"));
    assert_eq!(wire.url.fragment(), Some("section"));
    assert_eq!(wire.timeout, Duration::from_secs(3));
    assert_eq!(
        wire.headers.get(http::header::USER_AGENT),
        Some(&HeaderValue::from_static("fetchx-tests"))
    );
    assert_eq!(
        wire.headers.get(CONTENT_TYPE),
        Some(&HeaderValue::from_static("application/json"))
    );
    assert_eq!(
        wire.headers.get(http::header::CONTENT_LENGTH),
        Some(&HeaderValue::from(wire.body.as_ref().map_or(0, Bytes::len)))
    );

    let explicit = session
        .send(Request::get("http://api.test/x").with_timeout(Duration::from_millis(250)))
        .await;
    assert!(explicit.error().is_none());
    assert_eq!(transport.seen()[1].timeout, Duration::from_millis(250));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancel_all_cancels_every_active_request() {
    let transport =
        ScriptedTransport::with_delay(Duration::from_secs(5), reply_with(200, None, "late"));
    let session = Session::new(transport.clone());

    let handles: Vec<_> = (0..5)
        .map(|index| session.execute(Request::get(format!("http://api.test/slow/{index}"))))
        .collect();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(session.active_count(), 5);

    session.cancel_all();
    for handle in handles {
        let response = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("cancelled request should complete promptly");
        assert_eq!(
            response.error().map(Error::code),
            Some(ErrorCode::UserCancelled)
        );
    }
    assert_eq!(session.active_count(), 0);
    assert_eq!(session.metrics_snapshot().requests_cancelled, 5);
}

#[tokio::test]
async fn cancelling_one_handle_leaves_others_running() {
    let transport =
        ScriptedTransport::with_delay(Duration::from_millis(100), reply_with(200, None, "ok"));
    let session = Session::new(transport);

    let cancelled = session.execute(Request::get("http://api.test/a"));
    let kept = session.execute(Request::get("http://api.test/b"));
    let canceller = cancelled.canceller();
    canceller.cancel();
    assert!(canceller.is_cancelled());

    let cancelled = cancelled.await;
    let kept = kept.await;
    assert_eq!(
        cancelled.error().map(Error::code),
        Some(ErrorCode::UserCancelled)
    );
    assert!(kept.error().is_none());
}

#[derive(Default)]
struct CountingObserver {
    started: AtomicUsize,
    completed: AtomicUsize,
}

impl Observer for CountingObserver {
    fn on_request_start(&self, _context: &RequestContext) {
        self.started.fetch_add(1, Ordering::SeqCst);
    }

    fn on_response(&self, context: &RequestContext, _response: &Response) {
        assert!(!context.uri().contains("token"));
        self.completed.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn observers_and_metrics_see_every_request() {
    let observer = Arc::new(CountingObserver::default());
    let session = Session::builder(ScriptedTransport::new(reply_with(200, None, "")))
        .observer_arc(observer.clone())
        .build();

    session
        .send(Request::get("http://api.test/a").with_query("token", "secret"))
        .await;
    session.send(Request::get("bad url")).await;

    assert_eq!(observer.started.load(Ordering::SeqCst), 2);
    assert_eq!(observer.completed.load(Ordering::SeqCst), 2);
    let snapshot = session.metrics_snapshot();
    assert_eq!(snapshot.requests_started, 2);
    assert_eq!(snapshot.requests_succeeded, 1);
    assert_eq!(snapshot.requests_failed, 1);
    assert_eq!(snapshot.error_counts.get("invalid_request"), Some(&1));
    assert_eq!(snapshot.in_flight, 0);
}
