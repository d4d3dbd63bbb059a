//! Request matching
//!
//! Selects the first registered expectation that accepts an incoming request.

use crate::expectation::ExpectationRecord;
use axum::extract::Query;
use axum::http::Uri;
use serde::Serialize;
use std::collections::BTreeMap;

/// The parts of an incoming request the match engine looks at
#[derive(Debug, Clone)]
pub struct RequestView<'a> {
    /// HTTP method
    pub method: &'a str,
    /// Request path, without the query string
    pub path: &'a str,
    /// Decoded query pairs in the order they appeared
    pub query: Vec<(String, String)>,
}

impl<'a> RequestView<'a> {
    /// Build a view from a method and the request URI
    pub fn new(method: &'a str, uri: &'a Uri) -> Self {
        Self {
            method,
            path: uri.path(),
            query: parse_query(uri),
        }
    }

    /// First value of a query parameter
    pub fn query_param(&self, key: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Decode the query string of a URI into ordered pairs.
///
/// A malformed query string is treated as carrying no parameters.
pub fn parse_query(uri: &Uri) -> Vec<(String, String)> {
    Query::<Vec<(String, String)>>::try_from_uri(uri)
        .map(|Query(pairs)| pairs)
        .unwrap_or_default()
}

/// Matching constraints of an expectation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RequestMatcher {
    /// Required method; empty accepts any method
    pub method: String,
    /// Required path; empty accepts any path
    pub path: String,
    /// Query parameters that must all be present with these exact values
    pub query: BTreeMap<String, String>,
    /// Maximum number of matches, 0 = unlimited
    pub times: usize,
}

impl RequestMatcher {
    /// Create a matcher for a method and path
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            ..Self::default()
        }
    }

    /// Whether the repeat cap has been used up
    pub fn is_exhausted(&self, matched_times: usize) -> bool {
        self.times > 0 && matched_times >= self.times
    }

    /// Evaluate the matcher against a request, given how often it already matched
    pub fn matches(&self, request: &RequestView<'_>, matched_times: usize) -> bool {
        if !self.method.is_empty() && self.method != request.method {
            return false;
        }
        if !self.path.is_empty() && self.path != request.path {
            return false;
        }
        if self.is_exhausted(matched_times) {
            return false;
        }

        self.query
            .iter()
            .all(|(key, value)| request.query_param(key) == Some(value.as_str()))
    }
}

/// Index of the first eligible expectation in registration order, if any
pub(crate) fn find_match(
    expectations: &[ExpectationRecord],
    request: &RequestView<'_>,
) -> Option<usize> {
    expectations
        .iter()
        .position(|exp| exp.matcher.matches(request, exp.matched_times))
}
