//! Listener lifecycle
//!
//! Binds the mock server's router to a TCP address, either in plain HTTP or
//! behind TLS with a self-signed certificate, and stops it again.

use crate::server::MockServer;
use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;

/// Address used when no explicit address is given
pub const EPHEMERAL_ADDR: &str = "127.0.0.1:0";

/// Transport errors
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to generate TLS certificate: {0}")]
    Certificate(#[from] rcgen::Error),
    #[error("failed to configure TLS: {0}")]
    Tls(#[source] io::Error),
    #[error("listener I/O error: {0}")]
    Io(#[from] io::Error),
}

enum Shutdown {
    Plain(Option<oneshot::Sender<()>>),
    Tls(axum_server::Handle),
}

/// A bound listener serving a router; stops serving when dropped
pub(crate) struct RunningListener {
    addr: SocketAddr,
    tls: bool,
    shutdown: Shutdown,
}

impl RunningListener {
    async fn bind(addr: &str, router: Router) -> Result<Self, ServerError> {
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: addr.to_string(),
                source,
            })?;
        let local_addr = listener.local_addr()?;
        let (tx, rx) = oneshot::channel::<()>();

        tokio::spawn(async move {
            let shutdown = async {
                let _ = rx.await;
            };
            if let Err(e) = axum::serve(listener, router)
                .with_graceful_shutdown(shutdown)
                .await
            {
                tracing::error!(error = %e, "Mock server stopped with error");
            }
        });

        Ok(Self {
            addr: local_addr,
            tls: false,
            shutdown: Shutdown::Plain(Some(tx)),
        })
    }

    async fn bind_tls(addr: &str, router: Router) -> Result<Self, ServerError> {
        let listener = std::net::TcpListener::bind(addr).map_err(|source| ServerError::Bind {
            addr: addr.to_string(),
            source,
        })?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        let certified = rcgen::generate_simple_self_signed(vec![
            "localhost".to_string(),
            "127.0.0.1".to_string(),
        ])?;
        let config = RustlsConfig::from_pem(
            certified.cert.pem().into_bytes(),
            certified.key_pair.serialize_pem().into_bytes(),
        )
        .await
        .map_err(ServerError::Tls)?;

        let handle = axum_server::Handle::new();
        let server = axum_server::from_tcp_rustls(listener, config).handle(handle.clone());

        tokio::spawn(async move {
            if let Err(e) = server.serve(router.into_make_service()).await {
                tracing::error!(error = %e, "Mock TLS server stopped with error");
            }
        });

        Ok(Self {
            addr: local_addr,
            tls: true,
            shutdown: Shutdown::Tls(handle),
        })
    }

    pub(crate) fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub(crate) fn url(&self) -> String {
        let scheme = if self.tls { "https" } else { "http" };
        format!("{}://{}", scheme, self.addr)
    }
}

impl Drop for RunningListener {
    fn drop(&mut self) {
        match &mut self.shutdown {
            Shutdown::Plain(tx) => {
                if let Some(tx) = tx.take() {
                    let _ = tx.send(());
                }
            }
            Shutdown::Tls(handle) => handle.graceful_shutdown(Some(Duration::from_secs(1))),
        }
    }
}

impl MockServer {
    /// Create a mock server listening on an ephemeral local port
    pub async fn spawn() -> Result<Self, ServerError> {
        let server = Self::new();
        server.start().await?;
        Ok(server)
    }

    /// Create a mock HTTPS server listening on an ephemeral local port
    pub async fn spawn_tls() -> Result<Self, ServerError> {
        let server = Self::new();
        server.start_tls().await?;
        Ok(server)
    }

    /// Start serving plain HTTP on an ephemeral local port
    pub async fn start(&self) -> Result<(), ServerError> {
        self.listen(EPHEMERAL_ADDR).await
    }

    /// Start serving HTTPS on an ephemeral local port
    pub async fn start_tls(&self) -> Result<(), ServerError> {
        self.listen_tls(EPHEMERAL_ADDR).await
    }

    /// Serve plain HTTP on `addr`, stopping any listener that is already running
    pub async fn listen(&self, addr: &str) -> Result<(), ServerError> {
        self.close();
        let listener = RunningListener::bind(addr, self.router()).await?;
        self.install(listener);
        Ok(())
    }

    /// Serve HTTPS on `addr`, stopping any listener that is already running
    pub async fn listen_tls(&self, addr: &str) -> Result<(), ServerError> {
        self.close();
        let listener = RunningListener::bind_tls(addr, self.router()).await?;
        self.install(listener);
        Ok(())
    }

    fn install(&self, listener: RunningListener) {
        tracing::info!(url = %listener.url(), "Mock server listening");
        *self.listener.lock() = Some(listener);
    }

    /// Stop the listener. Expectations and recorded exchanges are kept.
    pub fn close(&self) {
        let previous = self.listener.lock().take();
        if let Some(listener) = previous {
            tracing::info!(url = %listener.url(), "Stopping mock server");
        }
    }

    /// Base URL, e.g. `http://127.0.0.1:40123`, or `None` when not started
    pub fn url(&self) -> Option<String> {
        self.listener.lock().as_ref().map(RunningListener::url)
    }

    /// Bound socket address, or `None` when not started
    pub fn address(&self) -> Option<SocketAddr> {
        self.listener.lock().as_ref().map(RunningListener::addr)
    }

    /// Absolute URL for `path` on this server
    pub fn url_for(&self, path: &str) -> Option<String> {
        self.url().map(|base| format!("{base}{path}"))
    }

    /// Whether a listener is running
    pub fn is_started(&self) -> bool {
        self.listener.lock().is_some()
    }
}
