//! Captured exchanges
//!
//! Every request that reaches the matching step is recorded together with the
//! response the mock server sent for it.

use crate::matcher::parse_query;
use axum::body::Bytes;
use axum::http::request::Parts;
use axum::http::{HeaderMap, Method, Uri};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;

/// One received request and the response sent for it
#[derive(Debug, Clone)]
pub struct CapturedExchange {
    /// Unique exchange ID
    pub id: String,
    /// When the request was received
    pub received_at: DateTime<Utc>,
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    /// Request body as read, after size limiting
    pub body: Bytes,
    /// Status code sent. For a dynamic responder this is the expectation's
    /// configured status, not what the responder wrote.
    pub status_code: u16,
    /// Response body sent, or the configured body for a dynamic responder
    pub response_body: Bytes,
}

impl CapturedExchange {
    /// Request path
    pub fn path(&self) -> &str {
        self.uri.path()
    }

    /// First value of a query parameter
    pub fn query_param(&self, key: &str) -> Option<String> {
        parse_query(&self.uri)
            .into_iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    /// First value of a request header, if it is valid text
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).and_then(|v| v.to_str().ok())
    }

    /// Request body as lossy UTF-8
    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Deserialize the request body as JSON
    pub fn body_json<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_slice(&self.body)
    }

    /// Response body as lossy UTF-8
    pub fn response_text(&self) -> String {
        String::from_utf8_lossy(&self.response_body).into_owned()
    }
}

/// Exchange whose response has not been decided yet.
///
/// Completing it is the only way to obtain a [`CapturedExchange`], so the
/// response fields are set exactly once.
#[derive(Debug)]
pub(crate) struct PendingExchange {
    id: String,
    received_at: DateTime<Utc>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
}

impl PendingExchange {
    pub fn new(parts: &Parts, body: Bytes) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            received_at: Utc::now(),
            method: parts.method.clone(),
            uri: parts.uri.clone(),
            headers: parts.headers.clone(),
            body,
        }
    }

    pub fn complete(self, status_code: u16, response_body: Bytes) -> CapturedExchange {
        CapturedExchange {
            id: self.id,
            received_at: self.received_at,
            method: self.method,
            uri: self.uri,
            headers: self.headers,
            body: self.body,
            status_code,
            response_body,
        }
    }
}
