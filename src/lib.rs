//! Aduket - Programmable Mock HTTP Server
//!
//! A Rust library and CLI providing:
//! - A mock HTTP/HTTPS endpoint answering from registered expectations
//! - Query constraints, repeat caps, delays and dynamic responders
//! - WebSocket upgrades from dynamic responders
//! - A ledger of captured exchanges with verification helpers
//! - A TUI for live traffic inspection

pub mod config;
pub mod exchange;
pub mod expectation;
pub mod matcher;
pub mod server;
pub mod transport;
pub mod tui;
pub mod verify;
pub mod websocket;

pub use config::{AppConfig, ExpectationConfig, ServerConfig};
pub use exchange::CapturedExchange;
pub use expectation::{Expectation, ExpectationSnapshot, ResponseTemplate};
pub use server::{Fault, MockServer, DEFAULT_MAX_BODY_SIZE};
pub use transport::ServerError;
pub use verify::{AssertionError, VerificationError};

/// Application result type
pub type Result<T> = anyhow::Result<T>;
