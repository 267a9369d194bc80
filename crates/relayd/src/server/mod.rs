//! WebSocket server for boat clients.
//!
//! The server:
//! - Listens on TCP and upgrades requests for the configured path
//! - Refuses every other path with HTTP 404
//! - Spawns a ConnectionHandler for each client
//! - Broadcasts a shutdown notice and closes clients on cancellation
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │   RelayServer   │
//! │   TcpListener   │
//! └───────┬─────────┘
//!         │ accept() + WebSocket handshake
//!         ▼
//! ┌─────────────────┐     ┌─────────────────┐
//! │ConnectionHandler│────▶│   RelayHandle   │
//! │   (per client)  │     │                 │
//! └─────────────────┘     └─────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Accept and handshake errors are logged and the server keeps running

mod connection;

pub use connection::{
    ConnectionError, ConnectionHandler, MAX_FRAME_SIZE, MAX_MESSAGE_SIZE, WRITE_TIMEOUT,
};

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_tungstenite::accept_hdr_async_with_config;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use relay_core::{ClientId, Partition};
use relay_protocol::ServerMessage;

use crate::credentials::CredentialStore;
use crate::relay::RelayHandle;

/// Time allowed for the WebSocket handshake.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Time connections get to flush and close on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// WebSocket server for boat clients.
pub struct RelayServer {
    listener: TcpListener,
    ws_path: Arc<str>,
    relay: RelayHandle,
    credentials: Arc<CredentialStore>,

    /// Cancellation token for graceful shutdown
    cancel_token: CancellationToken,

    /// Cancelled once the shutdown notice is queued; closes all connections
    connections: CancellationToken,

    /// Connection counter for generating client IDs
    connection_counter: AtomicU64,
}

impl RelayServer {
    /// Binds the listening socket.
    ///
    /// # Errors
    ///
    /// Returns `ServerError::Bind` if the address is unavailable.
    pub async fn bind(
        addr: SocketAddr,
        ws_path: impl Into<String>,
        relay: RelayHandle,
        credentials: Arc<CredentialStore>,
        cancel_token: CancellationToken,
    ) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::Bind {
                addr,
                error: e.to_string(),
            })?;

        Ok(Self {
            listener,
            ws_path: Arc::from(ws_path.into()),
            relay,
            credentials,
            cancel_token,
            connections: CancellationToken::new(),
            connection_counter: AtomicU64::new(1),
        })
    }

    /// Address the server is listening on.
    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        self.listener
            .local_addr()
            .map_err(|e| ServerError::LocalAddr(e.to_string()))
    }

    /// Runs the server.
    ///
    /// Accepts connections until the cancellation token is triggered, then
    /// sends `{"event":"shutdown"}` to every client and waits briefly for
    /// the connections to close.
    pub async fn run(self) -> Result<(), ServerError> {
        info!(
            addr = %self.local_addr()?,
            path = %self.ws_path,
            "Relay server listening"
        );

        let mut tasks = JoinSet::new();

        loop {
            tokio::select! {
                _ = self.cancel_token.cancelled() => {
                    info!("Server shutdown requested");
                    break;
                }

                result = self.listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            let number = self.connection_counter.fetch_add(1, Ordering::Relaxed);
                            let client_id = ClientId::new(number);
                            debug!(client_id = %client_id, peer = %peer, "Accepted TCP connection");
                            tasks.spawn(self.serve(stream, client_id));
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }

                // Reap finished connection tasks
                Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
            }
        }

        self.shutdown(tasks).await;
        Ok(())
    }

    /// Handshake and connection handling for one accepted socket.
    fn serve(
        &self,
        stream: TcpStream,
        client_id: ClientId,
    ) -> impl std::future::Future<Output = ()> + Send + 'static {
        let ws_path = Arc::clone(&self.ws_path);
        let handler = ConnectionHandler::new(
            client_id,
            self.relay.clone(),
            Arc::clone(&self.credentials),
            self.connections.clone(),
        );

        async move {
            let callback = |request: &Request, response: Response| {
                check_path(&ws_path, request, response)
            };

            let config = connection::client_ws_config();
            let handshake = accept_hdr_async_with_config(stream, callback, Some(config));
            match timeout(HANDSHAKE_TIMEOUT, handshake).await {
                Ok(Ok(ws)) => handler.run(ws).await,
                Ok(Err(e)) => debug!(client_id = %client_id, error = %e, "WebSocket handshake failed"),
                Err(_) => debug!(client_id = %client_id, "WebSocket handshake timed out"),
            }
        }
    }

    async fn shutdown(&self, mut tasks: JoinSet<()>) {
        self.relay
            .broadcast(Partition::All, ServerMessage::shutdown())
            .await;
        // Round trip through the actor so the notice is queued before the
        // connections start closing.
        let remaining = self.relay.counts().await;
        self.connections.cancel();

        let drained = timeout(SHUTDOWN_GRACE, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(clients = remaining.total(), "Connections did not close in time");
            tasks.abort_all();
        }

        info!(clients = remaining.total(), "Server stopped");
    }
}

/// Accepts the handshake only on the configured path.
pub(crate) fn check_path(ws_path: &str, request: &Request, response: Response) -> Result<Response, ErrorResponse> {
    if request.uri().path() == ws_path {
        return Ok(response);
    }

    debug!(path = %request.uri().path(), "Refusing request for unknown path");
    let mut refusal = ErrorResponse::new(Some("Not Found".to_string()));
    *refusal.status_mut() = StatusCode::NOT_FOUND;
    Err(refusal)
}

/// Errors that can occur in server operations.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Failed to bind {addr}: {error}")]
    Bind { addr: SocketAddr, error: String },

    #[error("Failed to read local address: {0}")]
    LocalAddr(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(path: &str) -> Request {
        Request::builder()
            .uri(path)
            .body(())
            .unwrap()
    }

    #[test]
    fn test_check_path_accepts_configured_path() {
        let result = check_path("/ws", &request("/ws"), Response::new(()));
        assert!(result.is_ok());
    }

    #[test]
    fn test_check_path_refuses_other_paths() {
        let refusal = check_path("/ws", &request("/admin"), Response::new(())).unwrap_err();
        assert_eq!(refusal.status(), StatusCode::NOT_FOUND);

        let refusal = check_path("/ws", &request("/"), Response::new(())).unwrap_err();
        assert_eq!(refusal.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_check_path_ignores_query() {
        assert!(check_path("/ws", &request("/ws?client=1"), Response::new(())).is_ok());
    }

    #[test]
    fn test_server_error_display() {
        let err = ServerError::Bind {
            addr: "127.0.0.1:8000".parse().unwrap(),
            error: "address in use".to_string(),
        };
        assert!(err.to_string().contains("127.0.0.1:8000"));
        assert!(err.to_string().contains("address in use"));
    }

    #[tokio::test]
    async fn test_bind_reports_local_addr() {
        let (upstream, _endpoint) = crate::upstream::UpstreamHandle::channel();
        let relay = crate::relay::spawn_relay(crate::relay::StateMerger::default(), upstream);
        let server = RelayServer::bind(
            "127.0.0.1:0".parse().unwrap(),
            "/ws",
            relay,
            Arc::new(CredentialStore::default()),
            CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_ne!(server.local_addr().unwrap().port(), 0);
    }
}
