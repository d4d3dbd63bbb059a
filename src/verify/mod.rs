//! Verification and assertions
//!
//! Read-only queries over the ledger and the expectation list. Every check has
//! a `check_*` form returning [`AssertionError`] and an `assert_*` form that
//! panics with the same message, for use directly in tests.

use crate::exchange::CapturedExchange;
use crate::expectation::{ExpectationRecord, ExpectationSnapshot};
use crate::server::MockServer;
use serde::Serialize;
use serde_json::{Number, Value};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// A failed check
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AssertionError {
    #[error("request index {0} not found")]
    RequestNotFound(usize),
    #[error("expected {method} {path} to be called, but it was not")]
    NotCalled { method: String, path: String },
    #[error("expected {method} {path} NOT to be called, but it was matched {times} times")]
    UnexpectedlyCalled {
        method: String,
        path: String,
        times: usize,
    },
    #[error("expected {method} {path} to be called {expected} times, but it was called {actual} times")]
    CalledTooFewTimes {
        method: String,
        path: String,
        expected: usize,
        actual: usize,
    },
    #[error("expected {expected} requests, got {actual}")]
    RequestCount { expected: usize, actual: usize },
    #[error("expected header {key}: {expected}, got {actual}")]
    Header {
        key: String,
        expected: String,
        actual: String,
    },
    #[error("expected query param {key}: {expected}, got {actual}")]
    QueryParam {
        key: String,
        expected: String,
        actual: String,
    },
    #[error("failed to unmarshal request body: {0}")]
    BodyNotJson(String),
    #[error("failed to serialize expected body: {0}")]
    ExpectedNotSerializable(String),
    #[error("expected body {expected}, got {actual}")]
    Body { expected: String, actual: String },
}

/// Every unmet expectation found by [`MockServer::try_verify`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationError {
    pub failures: Vec<AssertionError>,
}

impl fmt::Display for VerificationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} expectation(s) not met:", self.failures.len())?;
        for failure in &self.failures {
            writeln!(f, "  - {failure}")?;
        }
        Ok(())
    }
}

impl std::error::Error for VerificationError {}

fn unmet(exp: &ExpectationRecord) -> Option<AssertionError> {
    let method = exp.matcher.method.clone();
    let path = exp.matcher.path.clone();
    if exp.matched_times == 0 {
        Some(AssertionError::NotCalled { method, path })
    } else if exp.matcher.is_exhausted(exp.matched_times) || exp.matcher.times == 0 {
        None
    } else {
        Some(AssertionError::CalledTooFewTimes {
            method,
            path,
            expected: exp.matcher.times,
            actual: exp.matched_times,
        })
    }
}

fn canonical_json<T: Serialize + ?Sized>(value: &T) -> serde_json::Result<String> {
    serde_json::to_value(value).and_then(|v| serde_json::to_string(&normalize_numbers(v)))
}

/// Rewrite every number as f64 so `1`, `1.0` and `1e0` compare equal
fn normalize_numbers(value: Value) -> Value {
    match value {
        Value::Number(n) => n
            .as_f64()
            .and_then(Number::from_f64)
            .map_or(Value::Number(n), Value::Number),
        Value::Array(items) => Value::Array(items.into_iter().map(normalize_numbers).collect()),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(key, value)| (key, normalize_numbers(value)))
                .collect(),
        ),
        other => other,
    }
}

#[track_caller]
fn fail_on(result: Result<(), impl fmt::Display>) {
    if let Err(e) = result {
        panic!("{e}");
    }
}

impl MockServer {
    /// Number of recorded exchanges
    pub fn request_count(&self) -> usize {
        self.state.lock().ledger.len()
    }

    /// The `i`-th recorded exchange in arrival order
    pub fn request(&self, i: usize) -> Option<Arc<CapturedExchange>> {
        self.state.lock().ledger.get(i).cloned()
    }

    /// All recorded exchanges in arrival order
    pub fn requests(&self) -> Vec<Arc<CapturedExchange>> {
        self.state.lock().ledger.clone()
    }

    /// Snapshots of every registered expectation in registration order
    pub fn expectations(&self) -> Vec<ExpectationSnapshot> {
        self.state
            .lock()
            .expectations
            .iter()
            .map(ExpectationRecord::snapshot)
            .collect()
    }

    /// Clear expectations and recorded exchanges.
    ///
    /// The body limit, CORS setting and observer are kept.
    pub fn reset(&self) {
        let mut inner = self.state.lock();
        inner.expectations.clear();
        inner.ledger.clear();
    }

    /// Whether an expectation for `method` and `path` matched at least once
    pub fn was_called(&self, method: &str, path: &str) -> bool {
        self.check_called(method, path).is_ok()
    }

    pub fn check_called(&self, method: &str, path: &str) -> Result<(), AssertionError> {
        let inner = self.state.lock();
        let called = inner.expectations.iter().any(|exp| {
            exp.matcher.method == method && exp.matcher.path == path && exp.matched_times > 0
        });
        if called {
            Ok(())
        } else {
            Err(AssertionError::NotCalled {
                method: method.to_string(),
                path: path.to_string(),
            })
        }
    }

    #[track_caller]
    pub fn assert_called(&self, method: &str, path: &str) {
        fail_on(self.check_called(method, path));
    }

    pub fn check_not_called(&self, method: &str, path: &str) -> Result<(), AssertionError> {
        let inner = self.state.lock();
        let matched = inner.expectations.iter().find(|exp| {
            exp.matcher.method == method && exp.matcher.path == path && exp.matched_times > 0
        });
        match matched {
            Some(exp) => Err(AssertionError::UnexpectedlyCalled {
                method: method.to_string(),
                path: path.to_string(),
                times: exp.matched_times,
            }),
            None => Ok(()),
        }
    }

    #[track_caller]
    pub fn assert_not_called(&self, method: &str, path: &str) {
        fail_on(self.check_not_called(method, path));
    }

    pub fn check_request_count(&self, expected: usize) -> Result<(), AssertionError> {
        let actual = self.request_count();
        if actual == expected {
            Ok(())
        } else {
            Err(AssertionError::RequestCount { expected, actual })
        }
    }

    #[track_caller]
    pub fn assert_request_count(&self, expected: usize) {
        fail_on(self.check_request_count(expected));
    }

    fn exchange(&self, i: usize) -> Result<Arc<CapturedExchange>, AssertionError> {
        self.request(i).ok_or(AssertionError::RequestNotFound(i))
    }

    /// Compare a request header of the `i`-th exchange; a missing header reads as empty
    pub fn check_header(&self, i: usize, key: &str, value: &str) -> Result<(), AssertionError> {
        let exchange = self.exchange(i)?;
        let actual = exchange.header(key).unwrap_or_default();
        if actual == value {
            Ok(())
        } else {
            Err(AssertionError::Header {
                key: key.to_string(),
                expected: value.to_string(),
                actual: actual.to_string(),
            })
        }
    }

    #[track_caller]
    pub fn assert_header(&self, i: usize, key: &str, value: &str) {
        fail_on(self.check_header(i, key, value));
    }

    /// Compare a query parameter of the `i`-th exchange; a missing parameter reads as empty
    pub fn check_query_param(&self, i: usize, key: &str, value: &str) -> Result<(), AssertionError> {
        let exchange = self.exchange(i)?;
        let actual = exchange.query_param(key).unwrap_or_default();
        if actual == value {
            Ok(())
        } else {
            Err(AssertionError::QueryParam {
                key: key.to_string(),
                expected: value.to_string(),
                actual,
            })
        }
    }

    #[track_caller]
    pub fn assert_query_param(&self, i: usize, key: &str, value: &str) {
        fail_on(self.check_query_param(i, key, value));
    }

    /// Compare the `i`-th request body with `expected` as JSON.
    ///
    /// Both sides are re-serialized canonically, so key order and whitespace in
    /// the transmitted body do not matter.
    pub fn check_body_json<T: Serialize + ?Sized>(
        &self,
        i: usize,
        expected: &T,
    ) -> Result<(), AssertionError> {
        let exchange = self.exchange(i)?;
        let actual: Value = exchange
            .body_json()
            .map_err(|e| AssertionError::BodyNotJson(e.to_string()))?;

        let expected = canonical_json(expected)
            .map_err(|e| AssertionError::ExpectedNotSerializable(e.to_string()))?;
        let actual = canonical_json(&actual)
            .map_err(|e| AssertionError::BodyNotJson(e.to_string()))?;

        if expected == actual {
            Ok(())
        } else {
            Err(AssertionError::Body { expected, actual })
        }
    }

    #[track_caller]
    pub fn assert_body_json<T: Serialize + ?Sized>(&self, i: usize, expected: &T) {
        fail_on(self.check_body_json(i, expected));
    }

    /// Check every registered expectation.
    ///
    /// An expectation fails if it never matched, or if it has a repeat cap and
    /// matched fewer times than the cap.
    pub fn try_verify(&self) -> Result<(), VerificationError> {
        let failures: Vec<_> = self
            .state
            .lock()
            .expectations
            .iter()
            .filter_map(unmet)
            .collect();

        if failures.is_empty() {
            Ok(())
        } else {
            Err(VerificationError { failures })
        }
    }

    /// Panic listing every unmet expectation
    #[track_caller]
    pub fn verify(&self) {
        fail_on(self.try_verify());
    }
}
