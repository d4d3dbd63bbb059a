//! Expectations
//!
//! An expectation pairs a [`RequestMatcher`] with the response the mock server
//! should send when it matches. Records live inside the endpoint state; callers
//! hold an [`Expectation`] handle and configure it through chained setters.

use crate::matcher::RequestMatcher;
use crate::server::EndpointState;
use axum::body::{Body, Bytes};
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Request};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

/// Boxed future produced by a dynamic responder
pub type ResponderFuture = Pin<Box<dyn Future<Output = Response> + Send + 'static>>;

/// Caller-supplied logic that takes over the whole response
pub type Responder = Arc<dyn Fn(Request<Body>) -> ResponderFuture + Send + Sync>;

/// Response template held by an expectation
#[derive(Clone)]
pub struct ResponseTemplate {
    pub status: u16,
    pub body: Bytes,
    pub headers: HeaderMap,
    pub delay: Option<Duration>,
    pub responder: Option<Responder>,
}

impl Default for ResponseTemplate {
    fn default() -> Self {
        Self {
            status: 200,
            body: Bytes::new(),
            headers: HeaderMap::new(),
            delay: None,
            responder: None,
        }
    }
}

impl fmt::Debug for ResponseTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseTemplate")
            .field("status", &self.status)
            .field("body_len", &self.body.len())
            .field("headers", &self.headers)
            .field("delay", &self.delay)
            .field("dynamic", &self.responder.is_some())
            .finish()
    }
}

/// How a matched request gets answered
#[derive(Clone)]
pub enum ResponseStrategy {
    /// The engine writes status, headers and body itself
    Static {
        status: u16,
        headers: HeaderMap,
        body: Bytes,
    },
    /// The responder owns the entire response. `status` and `body` are the
    /// template values at match time, recorded in the ledger in place of the
    /// response the responder actually wrote.
    Dynamic {
        responder: Responder,
        status: u16,
        body: Bytes,
    },
}

impl ResponseTemplate {
    /// Pick the strategy for dispatch. A responder always takes precedence.
    pub fn strategy(&self) -> ResponseStrategy {
        match &self.responder {
            Some(responder) => ResponseStrategy::Dynamic {
                responder: responder.clone(),
                status: self.status,
                body: self.body.clone(),
            },
            None => ResponseStrategy::Static {
                status: self.status,
                headers: self.headers.clone(),
                body: self.body.clone(),
            },
        }
    }
}

/// Everything the request lifecycle needs after a match, copied out of the lock
#[derive(Clone)]
pub(crate) struct Dispatch {
    pub delay: Option<Duration>,
    pub strategy: ResponseStrategy,
}

/// An expectation as stored by the endpoint
#[derive(Debug, Clone)]
pub(crate) struct ExpectationRecord {
    pub id: u64,
    pub matcher: RequestMatcher,
    pub template: ResponseTemplate,
    pub matched_times: usize,
}

impl ExpectationRecord {
    pub fn new(id: u64, method: &str, path: &str) -> Self {
        Self {
            id,
            matcher: RequestMatcher::new(method, path),
            template: ResponseTemplate::default(),
            matched_times: 0,
        }
    }

    /// Count a match and snapshot the response fields
    pub fn record_match(&mut self) -> Dispatch {
        self.matched_times += 1;
        Dispatch {
            delay: self.template.delay.filter(|d| !d.is_zero()),
            strategy: self.template.strategy(),
        }
    }

    pub fn snapshot(&self) -> ExpectationSnapshot {
        ExpectationSnapshot {
            method: self.matcher.method.clone(),
            path: self.matcher.path.clone(),
            query: self.matcher.query.clone(),
            times: self.matcher.times,
            matched_times: self.matched_times,
        }
    }
}

/// Read-only view of a registered expectation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExpectationSnapshot {
    pub method: String,
    pub path: String,
    pub query: BTreeMap<String, String>,
    /// Repeat cap, 0 = unlimited
    pub times: usize,
    pub matched_times: usize,
}

/// Handle to a registered expectation.
///
/// Setters consume and return the handle so calls can be chained. All updates
/// go through the endpoint lock, so configuring an expectation while requests
/// are in flight is safe. Once the endpoint is reset the handle is detached and
/// further updates are ignored.
#[derive(Clone)]
pub struct Expectation {
    state: Arc<EndpointState>,
    id: u64,
}

impl fmt::Debug for Expectation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Expectation")
            .field("id", &self.id)
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

impl Expectation {
    pub(crate) fn new(state: Arc<EndpointState>, id: u64) -> Self {
        Self { state, id }
    }

    fn update(self, f: impl FnOnce(&mut ExpectationRecord)) -> Self {
        if !self.state.update_expectation(self.id, f) {
            tracing::debug!(id = self.id, "Expectation no longer registered, update ignored");
        }
        self
    }

    /// Set the response status and body
    pub fn response(self, status: u16, body: impl Into<Bytes>) -> Self {
        let body = body.into();
        self.update(|exp| {
            exp.template.status = status;
            exp.template.body = body;
        })
    }

    /// Set the response status only
    pub fn status(self, status: u16) -> Self {
        self.update(|exp| exp.template.status = status)
    }

    /// Set the response body only
    pub fn body(self, body: impl Into<Bytes>) -> Self {
        let body = body.into();
        self.update(|exp| exp.template.body = body)
    }

    /// Serialize `value` as the JSON response body
    pub fn json_body<T: Serialize>(self, value: &T) -> Self {
        match serde_json::to_vec(value) {
            Ok(body) => self.update(|exp| {
                exp.template.body = Bytes::from(body);
                exp.template
                    .headers
                    .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            }),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to serialize JSON response body");
                self
            }
        }
    }

    /// Set response headers, replacing existing values for the same names
    pub fn headers<I, K, V>(self, headers: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let parsed: Vec<_> = headers
            .into_iter()
            .filter_map(|(k, v)| parse_header(k.as_ref(), v.as_ref()))
            .collect();
        self.update(|exp| {
            for (name, value) in parsed {
                exp.template.headers.insert(name, value);
            }
        })
    }

    /// Append a response header value, keeping existing values
    pub fn header(self, key: &str, value: &str) -> Self {
        match parse_header(key, value) {
            Some((name, value)) => self.update(|exp| {
                exp.template.headers.append(name, value);
            }),
            None => self,
        }
    }

    /// Limit how many times this expectation may match, 0 = unlimited
    pub fn times(self, n: usize) -> Self {
        self.update(|exp| exp.matcher.times = n)
    }

    /// Wait this long before responding
    pub fn delay(self, delay: Duration) -> Self {
        self.update(|exp| exp.template.delay = Some(delay))
    }

    /// Require a query parameter with an exact value
    pub fn query(self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let (key, value) = (key.into(), value.into());
        self.update(|exp| {
            exp.matcher.query.insert(key, value);
        })
    }

    /// Hand the whole response over to `f`.
    ///
    /// The request passed to `f` carries the fully buffered body and the original
    /// extensions, so it can be upgraded to a WebSocket with
    /// [`crate::websocket::upgrade`]. Static status, body and headers are ignored
    /// while a responder is set.
    pub fn respond_with<F, Fut, R>(self, f: F) -> Self
    where
        F: Fn(Request<Body>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = R> + Send + 'static,
        R: IntoResponse,
    {
        let responder: Responder = Arc::new(move |req| {
            let fut = f(req);
            Box::pin(async move { fut.await.into_response() })
        });
        self.update(|exp| exp.template.responder = Some(responder))
    }

    /// How many times this expectation has matched so far
    pub fn matched_times(&self) -> usize {
        self.snapshot().map_or(0, |s| s.matched_times)
    }

    /// Current state, or `None` once the endpoint has been reset
    pub fn snapshot(&self) -> Option<ExpectationSnapshot> {
        self.state.expectation_snapshot(self.id)
    }
}

fn parse_header(key: &str, value: &str) -> Option<(HeaderName, HeaderValue)> {
    match (
        HeaderName::from_bytes(key.as_bytes()),
        HeaderValue::from_str(value),
    ) {
        (Ok(name), Ok(value)) => Some((name, value)),
        _ => {
            tracing::warn!(key = %key, "Ignoring invalid response header");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::MockServer;

    #[test]
    fn test_default_template() {
        let template = ResponseTemplate::default();
        assert_eq!(template.status, 200);
        assert!(template.body.is_empty());
        assert!(matches!(template.strategy(), ResponseStrategy::Static { .. }));
    }

    #[test]
    fn test_setters_chain() {
        let server = MockServer::new();
        let exp = server
            .expect("GET", "/hello")
            .response(201, "world")
            .headers([("X-Mock", "yes")])
            .header("set-cookie", "a=1")
            .header("set-cookie", "b=2")
            .times(3)
            .delay(Duration::from_millis(5))
            .query("q", "aduket");

        let snapshot = exp.snapshot().unwrap();
        assert_eq!(snapshot.method, "GET");
        assert_eq!(snapshot.path, "/hello");
        assert_eq!(snapshot.times, 3);
        assert_eq!(snapshot.query.get("q").map(String::as_str), Some("aduket"));
        assert_eq!(exp.matched_times(), 0);

        let template = server.state().template(exp.id).unwrap();
        assert_eq!(template.status, 201);
        assert_eq!(template.body, Bytes::from("world"));
        assert_eq!(template.headers.get("x-mock").unwrap(), "yes");
        assert_eq!(template.headers.get_all("set-cookie").iter().count(), 2);
        assert_eq!(template.delay, Some(Duration::from_millis(5)));
    }

    #[test]
    fn test_headers_replace_existing() {
        let server = MockServer::new();
        let exp = server
            .expect("GET", "/h")
            .header("x-a", "1")
            .header("x-a", "2")
            .headers([("x-a", "3")]);

        let template = server.state().template(exp.id).unwrap();
        let values: Vec<_> = template.headers.get_all("x-a").iter().collect();
        assert_eq!(values, vec!["3"]);
    }

    #[test]
    fn test_invalid_header_ignored() {
        let server = MockServer::new();
        let exp = server.expect("GET", "/h").header("bad header", "v");
        let template = server.state().template(exp.id).unwrap();
        assert!(template.headers.is_empty());
    }

    #[test]
    fn test_responder_takes_precedence() {
        let server = MockServer::new();
        let exp = server
            .expect("POST", "/echo")
            .response(200, "static")
            .respond_with(|_req| async { "dynamic" });

        let template = server.state().template(exp.id).unwrap();
        match template.strategy() {
            ResponseStrategy::Dynamic { status, body, .. } => {
                assert_eq!(status, 200);
                assert_eq!(body, Bytes::from("static"));
            }
            ResponseStrategy::Static { .. } => panic!("expected dynamic strategy"),
        }
    }

    #[test]
    fn test_json_body_sets_content_type() {
        let server = MockServer::new();
        let exp = server
            .expect("GET", "/json")
            .json_body(&serde_json::json!({"name": "ismail"}));

        let template = server.state().template(exp.id).unwrap();
        assert_eq!(template.headers.get(CONTENT_TYPE).unwrap(), "application/json");
        assert_eq!(template.body, Bytes::from(r#"{"name":"ismail"}"#));
    }

    #[test]
    fn test_record_match_snapshots_template() {
        let mut record = ExpectationRecord::new(1, "GET", "/slow");
        record.template.delay = Some(Duration::from_millis(10));
        record.template.body = Bytes::from("slow");

        let dispatch = record.record_match();
        assert_eq!(record.matched_times, 1);
        assert_eq!(dispatch.delay, Some(Duration::from_millis(10)));
        match dispatch.strategy {
            ResponseStrategy::Static { status, body, .. } => {
                assert_eq!(status, 200);
                assert_eq!(body, Bytes::from("slow"));
            }
            ResponseStrategy::Dynamic { .. } => panic!("expected static strategy"),
        }

        record.template.delay = Some(Duration::ZERO);
        assert_eq!(record.record_match().delay, None);
    }

    #[test]
    fn test_detached_handle_after_reset() {
        let server = MockServer::new();
        let exp = server.expect("GET", "/gone");
        server.reset();

        let exp = exp.response(500, "ignored");
        assert!(exp.snapshot().is_none());
        assert_eq!(exp.matched_times(), 0);
        assert!(server.expectations().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_reconfigure_while_requests_in_flight() {
        use http_body_util::BodyExt;
        use tower::ServiceExt;

        let server = MockServer::new();
        let exp = server.expect("GET", "/live").response(200, "first");

        let mut tasks = Vec::new();
        for _ in 0..4 {
            let router = server.router();
            tasks.push(tokio::spawn(async move {
                let mut seen = Vec::new();
                for _ in 0..50 {
                    let req = Request::builder().uri("/live").body(Body::empty()).unwrap();
                    let response = router.clone().oneshot(req).await.unwrap();
                    let status = response.status().as_u16();
                    let body = response.into_body().collect().await.unwrap().to_bytes();
                    seen.push((status, body));
                }
                seen
            }));
        }

        for i in 0..200 {
            let (status, body) = if i % 2 == 0 { (201, "second") } else { (200, "first") };
            exp.clone()
                .response(status, body)
                .headers([("X-Round", i.to_string())])
                .times(0);
            tokio::task::yield_now().await;
        }

        for task in tasks {
            for (status, body) in task.await.unwrap() {
                // Status and body always come from the same configuration step
                match status {
                    200 => assert_eq!(body, Bytes::from("first")),
                    201 => assert_eq!(body, Bytes::from("second")),
                    other => panic!("unexpected status {other}"),
                }
            }
        }

        assert_eq!(exp.matched_times(), 200);
        assert_eq!(server.request_count(), 200);
    }
}
