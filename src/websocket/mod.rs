//! WebSocket support for dynamic responders
//!
//! A responder registered with [`crate::expectation::Expectation::respond_with`]
//! receives the live request and can turn it into a WebSocket connection:
//!
//! ```no_run
//! use aduket::websocket;
//! use aduket::MockServer;
//! use axum::response::IntoResponse;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let server = MockServer::spawn().await?;
//! server.expect("GET", "/ws").respond_with(|req| async move {
//!     match websocket::upgrade(req).await {
//!         Ok(ws) => ws.on_upgrade(websocket::echo).into_response(),
//!         Err(rejection) => rejection.into_response(),
//!     }
//! });
//! # Ok(())
//! # }
//! ```

use axum::body::Body;
use axum::extract::FromRequestParts;
use axum::http::Request;

pub use axum::extract::ws::rejection::WebSocketUpgradeRejection;
pub use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};

/// Prepare a WebSocket upgrade from a request handed to a dynamic responder.
///
/// Fails when the request is not a valid upgrade request. Origins are not
/// checked.
pub async fn upgrade(req: Request<Body>) -> Result<WebSocketUpgrade, WebSocketUpgradeRejection> {
    let (mut parts, _body) = req.into_parts();
    WebSocketUpgrade::from_request_parts(&mut parts, &()).await
}

/// Send every received data message straight back until the peer closes
pub async fn echo(mut socket: WebSocket) {
    while let Some(msg) = socket.recv().await {
        let msg = match msg {
            Ok(msg) => msg,
            Err(e) => {
                tracing::debug!(error = %e, "WebSocket receive failed");
                break;
            }
        };

        match msg {
            Message::Text(_) | Message::Binary(_) => {
                if socket.send(msg).await.is_err() {
                    break;
                }
            }
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }
}
