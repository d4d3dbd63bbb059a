//! Mock HTTP server module
//!
//! Owns the expectation list and the captured-exchange ledger, and runs the
//! per-request lifecycle: body ingestion with size limiting, matching, optional
//! delay, response emission and recording. Each lifecycle runs in its own task
//! so a panicking responder turns into a 500 instead of tearing down the
//! connection.

use crate::config::{ExpectationConfig, ServerConfig};
use crate::exchange::{CapturedExchange, PendingExchange};
use crate::expectation::{
    Dispatch, Expectation, ExpectationRecord, ExpectationSnapshot, ResponseStrategy,
};
use crate::matcher::{find_match, RequestView};
use crate::transport::RunningListener;
use axum::{
    body::{Body, Bytes},
    extract::State,
    http::{Request, StatusCode},
    response::{IntoResponse, Response},
    Router,
};
use http_body_util::{BodyExt, LengthLimitError, Limited};
use parking_lot::{Mutex, MutexGuard};
use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::task::JoinError;
use tower_http::cors::{Any as AnyOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

/// Default request body limit (10 MiB)
pub const DEFAULT_MAX_BODY_SIZE: usize = 10 * 1024 * 1024;

/// Callback notified of every recorded exchange
pub type Observer = Arc<dyn Fn(Arc<CapturedExchange>) + Send + Sync>;

/// State guarded by the endpoint lock
pub(crate) struct Inner {
    pub expectations: Vec<ExpectationRecord>,
    pub ledger: Vec<Arc<CapturedExchange>>,
    pub max_body_size: usize,
    pub cors: bool,
    pub observer: Option<Observer>,
}

/// Shared endpoint state, referenced by the router and by expectation handles
pub(crate) struct EndpointState {
    inner: Mutex<Inner>,
    next_id: AtomicU64,
}

impl EndpointState {
    fn new(max_body_size: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                expectations: Vec::new(),
                ledger: Vec::new(),
                max_body_size,
                cors: false,
                observer: None,
            }),
            next_id: AtomicU64::new(1),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock()
    }

    fn register(&self, method: &str, path: &str) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock()
            .expectations
            .push(ExpectationRecord::new(id, method, path));
        id
    }

    /// Apply `f` to the expectation with `id`; false if it is no longer registered
    pub(crate) fn update_expectation(
        &self,
        id: u64,
        f: impl FnOnce(&mut ExpectationRecord),
    ) -> bool {
        let mut inner = self.lock();
        match inner.expectations.iter_mut().find(|exp| exp.id == id) {
            Some(exp) => {
                f(exp);
                true
            }
            None => false,
        }
    }

    pub(crate) fn expectation_snapshot(&self, id: u64) -> Option<ExpectationSnapshot> {
        self.lock()
            .expectations
            .iter()
            .find(|exp| exp.id == id)
            .map(ExpectationRecord::snapshot)
    }

    #[cfg(test)]
    pub(crate) fn template(&self, id: u64) -> Option<crate::expectation::ResponseTemplate> {
        self.lock()
            .expectations
            .iter()
            .find(|exp| exp.id == id)
            .map(|exp| exp.template.clone())
    }

    /// Find the first eligible expectation, count the match and snapshot its response
    fn match_request(&self, request: &RequestView<'_>) -> Option<Dispatch> {
        let mut inner = self.lock();
        let index = find_match(&inner.expectations, request)?;
        Some(inner.expectations[index].record_match())
    }

    fn max_body_size(&self) -> usize {
        self.lock().max_body_size
    }

    /// Run the observer, if any, outside the lock
    fn notify(&self, exchange: &Arc<CapturedExchange>) {
        let observer = self.lock().observer.clone();
        if let Some(observer) = observer {
            observer(exchange.clone());
        }
    }

    fn record(&self, exchange: Arc<CapturedExchange>) {
        self.lock().ledger.push(exchange);
    }
}

/// A programmable mock HTTP server.
///
/// Cloning is cheap; clones share expectations, ledger and listener. The
/// listener is stopped when the last clone is dropped or [`MockServer::close`]
/// is called.
#[derive(Clone)]
pub struct MockServer {
    pub(crate) state: Arc<EndpointState>,
    pub(crate) listener: Arc<Mutex<Option<RunningListener>>>,
}

impl Default for MockServer {
    fn default() -> Self {
        Self::new()
    }
}

impl MockServer {
    /// Create an unstarted mock server
    pub fn new() -> Self {
        Self {
            state: Arc::new(EndpointState::new(DEFAULT_MAX_BODY_SIZE)),
            listener: Arc::new(Mutex::new(None)),
        }
    }

    /// Create an unstarted mock server using the given server settings
    pub fn from_config(config: &ServerConfig) -> Self {
        let server = Self::new();
        server.set_max_body_size(config.max_body_size);
        server.set_cors(config.cors);
        server
    }

    #[cfg(test)]
    pub(crate) fn state(&self) -> &Arc<EndpointState> {
        &self.state
    }

    /// Register a new expectation.
    ///
    /// # Panics
    ///
    /// Panics if `method` is empty.
    #[track_caller]
    pub fn expect(&self, method: &str, path: &str) -> Expectation {
        assert!(!method.is_empty(), "aduket: method cannot be empty");
        let id = self.state.register(method, path);
        tracing::debug!(method = %method, path = %path, id, "Registered expectation");
        Expectation::new(self.state.clone(), id)
    }

    /// Register expectations from configuration records
    pub fn apply_config(&self, expectations: &[ExpectationConfig]) -> crate::Result<()> {
        for (index, exp) in expectations.iter().enumerate() {
            anyhow::ensure!(
                !exp.method.is_empty(),
                "expectation #{index} ({}) has an empty method",
                exp.path
            );

            let handle = self
                .expect(&exp.method, &exp.path)
                .response(exp.status, exp.response.clone())
                .headers(&exp.headers)
                .times(exp.times);
            let handle = if exp.delay_ms > 0 {
                handle.delay(Duration::from_millis(exp.delay_ms))
            } else {
                handle
            };
            exp.query
                .iter()
                .fold(handle, |handle, (key, value)| handle.query(key.clone(), value.clone()));
        }
        Ok(())
    }

    /// Limit request bodies to `limit` bytes, 0 = no limit
    pub fn set_max_body_size(&self, limit: usize) {
        self.state.lock().max_body_size = limit;
    }

    /// Current request body limit, 0 = no limit
    pub fn max_body_size(&self) -> usize {
        self.state.max_body_size()
    }

    /// Answer CORS preflights and add permissive CORS headers.
    ///
    /// Takes effect the next time the server is started. While enabled,
    /// `OPTIONS` preflight requests never reach the expectations.
    pub fn set_cors(&self, enabled: bool) {
        self.state.lock().cors = enabled;
    }

    /// Register a callback invoked for every recorded exchange.
    ///
    /// The callback runs synchronously in the request's task, so a slow
    /// observer slows down that request.
    pub fn on_exchange<F>(&self, f: F)
    where
        F: Fn(Arc<CapturedExchange>) + Send + Sync + 'static,
    {
        self.state.lock().observer = Some(Arc::new(f));
    }

    /// Remove the exchange observer
    pub fn clear_observer(&self) {
        self.state.lock().observer = None;
    }

    /// Router serving this mock server, usable without a listener
    pub fn router(&self) -> Router {
        let cors = self.state.lock().cors;
        let router = Router::new()
            .fallback(handle_request)
            .with_state(self.state.clone())
            .layer(TraceLayer::new_for_http());

        if cors {
            router.layer(
                CorsLayer::new()
                    .allow_origin(AnyOrigin)
                    .allow_methods(AnyOrigin)
                    .allow_headers(AnyOrigin),
            )
        } else {
            router
        }
    }
}

/// A request lifecycle that could not produce its intended response
#[derive(Debug, Error)]
pub enum Fault {
    #[error("mock server panic: {0}")]
    Panic(String),
    #[error("mock server fault: invalid status code {0}")]
    InvalidStatus(u16),
    #[error("mock server fault: request task was cancelled")]
    Cancelled,
}

impl From<JoinError> for Fault {
    fn from(err: JoinError) -> Self {
        if err.is_panic() {
            Fault::Panic(panic_message(err.into_panic().as_ref()))
        } else {
            Fault::Cancelled
        }
    }
}

impl IntoResponse for Fault {
    fn into_response(self) -> Response {
        (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()).into_response()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Reasons a request body is refused before matching
#[derive(Debug, Error)]
enum BodyRejection {
    #[error("aduket: request body too large: limit is {limit} bytes")]
    TooLarge { limit: usize },
    #[error("aduket: failed to read request body: {0}")]
    Unreadable(String),
}

impl IntoResponse for BodyRejection {
    fn into_response(self) -> Response {
        let status = match self {
            BodyRejection::TooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            BodyRejection::Unreadable(_) => StatusCode::BAD_REQUEST,
        };
        (status, self.to_string()).into_response()
    }
}

async fn read_body(body: Body, limit: usize) -> Result<Bytes, BodyRejection> {
    let effective = if limit == 0 { usize::MAX } else { limit };
    match Limited::new(body, effective).collect().await {
        Ok(collected) => Ok(collected.to_bytes()),
        Err(err) if err.is::<LengthLimitError>() => Err(BodyRejection::TooLarge { limit }),
        Err(err) => Err(BodyRejection::Unreadable(err.to_string())),
    }
}

/// Entry point for every request: runs the lifecycle behind a fault boundary
async fn handle_request(
    State(state): State<Arc<EndpointState>>,
    req: Request<Body>,
) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    let outcome = match tokio::spawn(process_request(state, req)).await {
        Ok(outcome) => outcome,
        Err(err) => Err(Fault::from(err)),
    };

    outcome.unwrap_or_else(|fault| {
        tracing::error!(method = %method, path = %path, error = %fault, "Request faulted");
        fault.into_response()
    })
}

async fn process_request(
    state: Arc<EndpointState>,
    req: Request<Body>,
) -> Result<Response, Fault> {
    let start = Instant::now();
    let (parts, body) = req.into_parts();
    let method = parts.method.clone();
    let path = parts.uri.path().to_string();

    let body = match read_body(body, state.max_body_size()).await {
        Ok(body) => body,
        Err(rejection) => {
            tracing::warn!(
                method = %method,
                path = %path,
                error = %rejection,
                "Rejected request body"
            );
            return Ok(rejection.into_response());
        }
    };

    let pending = PendingExchange::new(&parts, body.clone());
    let dispatch = {
        let view = RequestView::new(parts.method.as_str(), &parts.uri);
        state.match_request(&view)
    };

    let Some(dispatch) = dispatch else {
        let message = format!("aduket: no expectation matched for {method} {path}");
        let exchange = Arc::new(pending.complete(
            StatusCode::NOT_FOUND.as_u16(),
            Bytes::from(message.clone()),
        ));
        state.notify(&exchange);
        state.record(exchange);

        tracing::debug!(
            method = %method,
            path = %path,
            status = 404,
            matched = false,
            "Request processed"
        );
        return Ok((StatusCode::NOT_FOUND, message).into_response());
    };

    if let Some(delay) = dispatch.delay {
        tokio::time::sleep(delay).await;
    }

    let response = match dispatch.strategy {
        ResponseStrategy::Static {
            status,
            headers,
            body: response_body,
        } => {
            let status_code =
                StatusCode::from_u16(status).map_err(|_| Fault::InvalidStatus(status))?;
            let exchange = Arc::new(pending.complete(status, response_body.clone()));
            state.notify(&exchange);

            let mut response = Response::new(Body::from(response_body));
            *response.status_mut() = status_code;
            *response.headers_mut() = headers;

            state.record(exchange);
            response
        }
        ResponseStrategy::Dynamic {
            responder,
            status,
            body: configured_body,
        } => {
            let exchange = Arc::new(pending.complete(status, configured_body));
            state.notify(&exchange);

            let response = responder(Request::from_parts(parts, Body::from(body))).await;

            state.record(exchange);
            response
        }
    };

    tracing::debug!(
        method = %method,
        path = %path,
        status = %response.status().as_u16(),
        matched = true,
        latency_ms = %(start.elapsed().as_secs_f64() * 1000.0),
        "Request processed"
    );

    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tower::ServiceExt;

    async fn send(server: &MockServer, req: Request<Body>) -> (StatusCode, String) {
        let response = server.router().oneshot(req).await.unwrap();
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8_lossy(&body).into_owned())
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn post(uri: &str, body: impl Into<Body>) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .body(body.into())
            .unwrap()
    }

    async fn explode(_req: Request<Body>) -> StatusCode {
        panic!("something went wrong")
    }

    #[tokio::test]
    async fn test_static_response() {
        let server = MockServer::new();
        server
            .expect("GET", "/hello")
            .response(200, "world")
            .headers([("X-Mock", "aduket")]);

        let response = server.router().oneshot(get("/hello")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers().get("x-mock").unwrap(), "aduket");
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body, Bytes::from("world"));

        assert_eq!(server.request_count(), 1);
        let exchange = server.request(0).unwrap();
        assert_eq!(exchange.status_code, 200);
        assert_eq!(exchange.response_text(), "world");
    }

    #[tokio::test]
    async fn test_unmatched_falls_back_to_404() {
        let server = MockServer::new();
        server.expect("GET", "/hello").response(200, "world");

        let (status, body) = send(&server, get("/missing")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body.contains("no expectation matched for GET /missing"));

        let exchange = server.request(0).unwrap();
        assert_eq!(exchange.status_code, 404);
        assert_eq!(exchange.response_text(), body);
    }

    #[tokio::test]
    async fn test_query_requirement() {
        let server = MockServer::new();
        server
            .expect("GET", "/search")
            .query("q", "aduket")
            .response(200, "found");

        let (status, _) = send(&server, get("/search")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = send(&server, get("/search?q=aduket")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "found");
    }

    #[tokio::test]
    async fn test_repeat_cap_falls_through() {
        let server = MockServer::new();
        server.expect("GET", "/item").response(200, "first").times(1);
        server.expect("GET", "/item").response(200, "second");

        let (_, first) = send(&server, get("/item")).await;
        let (_, second) = send(&server, get("/item")).await;
        let (_, third) = send(&server, get("/item")).await;
        assert_eq!(first, "first");
        assert_eq!(second, "second");
        assert_eq!(third, "second");
    }

    #[tokio::test]
    async fn test_capped_expectation_exhausts_to_404() {
        let server = MockServer::new();
        let exp = server.expect("DELETE", "/once").response(204, "").times(2);

        for _ in 0..2 {
            let req = Request::builder()
                .method("DELETE")
                .uri("/once")
                .body(Body::empty())
                .unwrap();
            assert_eq!(send(&server, req).await.0, StatusCode::NO_CONTENT);
        }
        let req = Request::builder()
            .method("DELETE")
            .uri("/once")
            .body(Body::empty())
            .unwrap();
        assert_eq!(send(&server, req).await.0, StatusCode::NOT_FOUND);
        assert_eq!(exp.matched_times(), 2);
    }

    #[tokio::test]
    async fn test_oversized_body_rejected_before_matching() {
        let server = MockServer::new();
        server.set_max_body_size(100);
        let exp = server.expect("POST", "/large").response(200, "ok");

        let (status, body) = send(&server, post("/large", "a".repeat(200))).await;
        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
        assert!(body.contains("request body too large"));
        assert_eq!(exp.matched_times(), 0);
        assert_eq!(server.request_count(), 0);

        let (status, _) = send(&server, post("/large", "a".repeat(100))).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_zero_limit_disables_size_check() {
        let server = MockServer::new();
        server.set_max_body_size(0);
        server.expect("POST", "/big").response(200, "ok");

        let (status, _) = send(&server, post("/big", "a".repeat(64 * 1024))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(server.request(0).unwrap().body.len(), 64 * 1024);
    }

    #[tokio::test]
    async fn test_responder_panic_becomes_500() {
        let server = MockServer::new();
        server.expect("GET", "/ok").response(200, "fine");
        server.expect("GET", "/panic").respond_with(explode);

        assert_eq!(send(&server, get("/ok")).await.0, StatusCode::OK);

        let (status, body) = send(&server, get("/panic")).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body.contains("mock server panic"));
        assert!(body.contains("something went wrong"));

        // The endpoint keeps serving afterwards
        assert_eq!(send(&server, get("/ok")).await.0, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_invalid_status_is_a_fault() {
        let server = MockServer::new();
        server.expect("GET", "/weird").response(0, "nope");

        let (status, body) = send(&server, get("/weird")).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body.contains("invalid status code 0"));
    }

    #[tokio::test]
    async fn test_dynamic_responder_sees_buffered_body() {
        let server = MockServer::new();
        server
            .expect("POST", "/echo")
            .response(201, "configured")
            .respond_with(|req: Request<Body>| async move {
                let body = req.into_body().collect().await.unwrap().to_bytes();
                (StatusCode::ACCEPTED, body)
            });

        let (status, body) = send(&server, post("/echo", "dynamic")).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body, "dynamic");

        let exchange = server.request(0).unwrap();
        assert_eq!(exchange.body, Bytes::from("dynamic"));
        // The ledger keeps the configured template, not what the responder wrote
        assert_eq!(exchange.status_code, 201);
        assert_eq!(exchange.response_text(), "configured");
    }

    #[tokio::test]
    async fn test_observer_sees_matched_and_unmatched() {
        let server = MockServer::new();
        server.expect("GET", "/seen").response(200, "yes");

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        server.on_exchange(move |exchange| {
            sink.lock().push((exchange.path().to_string(), exchange.status_code));
        });

        send(&server, get("/seen")).await;
        send(&server, get("/unseen")).await;

        assert_eq!(
            *seen.lock(),
            vec![
                ("/seen".to_string(), 200),
                ("/unseen".to_string(), 404)
            ]
        );
    }

    #[tokio::test]
    async fn test_observer_skips_rejected_bodies() {
        let server = MockServer::new();
        server.set_max_body_size(4);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        server.on_exchange(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        send(&server, post("/x", "too long")).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        server.clear_observer();
        send(&server, get("/x")).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_delay_does_not_block_other_requests() {
        let server = MockServer::new();
        server
            .expect("GET", "/slow")
            .delay(Duration::from_millis(300))
            .response(200, "slow");
        server.expect("GET", "/fast").response(200, "fast");

        let slow_router = server.router();
        let started = Instant::now();
        let slow = tokio::spawn(async move { slow_router.oneshot(get("/slow")).await.unwrap() });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let fast = tokio::time::timeout(Duration::from_millis(200), send(&server, get("/fast")))
            .await
            .expect("fast request should not wait for the slow one");
        assert_eq!(fast.1, "fast");

        let slow = slow.await.unwrap();
        assert_eq!(slow.status(), StatusCode::OK);
        assert!(started.elapsed() >= Duration::from_millis(300));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_requests_respect_cap() {
        let server = MockServer::new();
        let exp = server.expect("GET", "/limited").response(200, "ok").times(10);

        let mut tasks = Vec::new();
        for _ in 0..50 {
            let router = server.router();
            tasks.push(tokio::spawn(async move {
                router.oneshot(get("/limited")).await.unwrap().status()
            }));
        }

        let mut ok = 0;
        let mut not_found = 0;
        for task in tasks {
            let status = task.await.unwrap();
            if status == StatusCode::OK {
                ok += 1;
            } else if status == StatusCode::NOT_FOUND {
                not_found += 1;
            } else {
                panic!("unexpected status {status}");
            }
        }

        assert_eq!(ok, 10);
        assert_eq!(not_found, 40);
        assert_eq!(exp.matched_times(), 10);
        assert_eq!(server.request_count(), 50);
    }

    #[test]
    #[should_panic(expected = "method cannot be empty")]
    fn test_empty_method_panics() {
        let server = MockServer::new();
        server.expect("", "/path");
    }

    #[test]
    fn test_apply_config() {
        let server = MockServer::new();
        let records = vec![ExpectationConfig {
            method: "GET".to_string(),
            path: "/configured".to_string(),
            status: 201,
            response: "made".to_string(),
            headers: [("X-From".to_string(), "config".to_string())].into(),
            times: 2,
            delay_ms: 0,
            query: [("v".to_string(), "1".to_string())].into(),
        }];

        server.apply_config(&records).unwrap();

        let snapshots = server.expectations();
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].times, 2);
        assert_eq!(snapshots[0].query.get("v").map(String::as_str), Some("1"));
    }

    #[test]
    fn test_apply_config_rejects_empty_method() {
        let server = MockServer::new();
        let records = vec![ExpectationConfig {
            method: String::new(),
            ..ExpectationConfig::default()
        }];
        assert!(server.apply_config(&records).is_err());
        assert!(server.expectations().is_empty());
    }

    #[test]
    fn test_from_config() {
        let config = ServerConfig {
            max_body_size: 512,
            ..ServerConfig::default()
        };
        let server = MockServer::from_config(&config);
        assert_eq!(server.max_body_size(), 512);
    }
}
