//! Connection handler for individual client connections.
//!
//! Each client connection gets its own `ConnectionHandler` that:
//! - Registers the client with the relay (as a passenger)
//! - Parses incoming frames and answers authentication requests
//! - Routes boat commands through the relay's role check
//! - Runs a writer task that drains the client's outbound queue
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Malformed frames are answered with an error event; the connection
//!   stays open
//! - Socket errors end the connection and unregister the client, whether
//!   the reader or the writer hits them first

use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use relay_core::{ClientId, Role};
use relay_protocol::{ClientEvent, Credentials, ServerMessage};

use crate::credentials::{CredentialDigest, CredentialStore};
use crate::relay::{ClientSender, CommandOutcome, RelayError, RelayHandle};

/// Maximum inbound frame size (64 KiB)
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Largest message the WebSocket layer will buffer (256 KiB). Text between
/// `MAX_MESSAGE_SIZE` and this gets an error event; anything larger fails
/// the read and closes the connection.
pub const MAX_FRAME_SIZE: usize = 4 * MAX_MESSAGE_SIZE;

/// Write timeout (10 seconds)
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Reason sent with a command that arrives while the boat link is down.
const DROPPED_REASON: &str = "upstream unavailable";

/// Reason sent with a command from a passenger.
const REJECTED_REASON: &str = "crew authentication required";

pub(crate) type ClientStream = WebSocketStream<TcpStream>;

/// Connection handler for a single client.
pub struct ConnectionHandler {
    client_id: ClientId,
    relay: RelayHandle,
    credentials: Arc<CredentialStore>,

    /// Fires when the server shuts down, after the shutdown notice has
    /// been queued for every client.
    shutdown: CancellationToken,

    /// Per-frame socket write limit.
    write_timeout: Duration,
}

impl ConnectionHandler {
    pub fn new(
        client_id: ClientId,
        relay: RelayHandle,
        credentials: Arc<CredentialStore>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            client_id,
            relay,
            credentials,
            shutdown,
            write_timeout: WRITE_TIMEOUT,
        }
    }

    /// Runs the connection until the client leaves or the server stops.
    pub async fn run(self, ws: ClientStream) {
        let (sink, mut stream) = ws.split();
        let (sender, queue) = ClientSender::channel();
        let writer_done = CancellationToken::new();
        let writer = tokio::spawn(write_loop(
            sink,
            queue,
            self.client_id,
            self.write_timeout,
            writer_done.clone(),
        ));

        if let Err(e) = self.relay.register(self.client_id, sender.clone()).await {
            warn!(client_id = %self.client_id, error = %e, "Client registration rejected");
            reply(&sender, &ServerMessage::error(e.to_string()));
            drop(sender);
            let _ = timeout(self.write_timeout, writer).await;
            return;
        }

        if let Err(e) = self.process_frames(&mut stream, &sender, &writer_done).await {
            debug!(client_id = %self.client_id, error = %e, "Connection closed");
        }

        self.relay.unregister(self.client_id).await;
        drop(sender);

        // The writer finishes once the relay has dropped its copy of the
        // sender and the remaining frames are flushed.
        if timeout(self.write_timeout, writer).await.is_err() {
            debug!(client_id = %self.client_id, "Writer did not finish in time");
        }
    }

    /// Reads frames until the socket closes, the writer gives up or the
    /// server shuts down.
    async fn process_frames(
        &self,
        stream: &mut futures_util::stream::SplitStream<ClientStream>,
        sender: &ClientSender,
        writer_done: &CancellationToken,
    ) -> Result<(), ConnectionError> {
        loop {
            let frame = tokio::select! {
                _ = self.shutdown.cancelled() => {
                    debug!(client_id = %self.client_id, "Closing connection for shutdown");
                    return Ok(());
                }
                _ = writer_done.cancelled() => return Err(ConnectionError::WriterStopped),
                frame = stream.next() => frame,
            };

            let text = match frame {
                Some(Ok(Message::Text(text))) => text,
                Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                    Ok(text) => text,
                    Err(_) => {
                        reply(sender, &ServerMessage::error("binary frames must be UTF-8 JSON"));
                        continue;
                    }
                },
                Some(Ok(Message::Close(_))) | None => return Ok(()),
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(ConnectionError::WebSocket(e)),
            };

            match self.handle_text(&text, sender).await {
                Ok(()) => {}
                Err(ConnectionError::RelayClosed) => return Err(ConnectionError::RelayClosed),
                Err(e) => {
                    debug!(client_id = %self.client_id, error = %e, "Rejected client frame");
                    reply(sender, &ServerMessage::error(e.to_string()));
                }
            }
        }
    }

    /// Handles a single text frame.
    async fn handle_text(&self, text: &str, sender: &ClientSender) -> Result<(), ConnectionError> {
        if text.len() > MAX_MESSAGE_SIZE {
            return Err(ConnectionError::MessageTooLarge {
                size: text.len(),
                max: MAX_MESSAGE_SIZE,
            });
        }

        let event = ClientEvent::parse(text).map_err(|e| ConnectionError::Protocol(e.to_string()))?;
        match event {
            ClientEvent::Authenticate { credentials } => {
                self.handle_authenticate(credentials, sender).await
            }
            ClientEvent::Command { action, payload } => {
                debug!(client_id = %self.client_id, action = %action, "Client command");
                self.handle_command(payload, sender).await
            }
        }
    }

    async fn handle_authenticate(
        &self,
        credentials: Option<Credentials>,
        sender: &ClientSender,
    ) -> Result<(), ConnectionError> {
        let token = credentials
            .filter(|c| self.credentials.authorize(c))
            .and_then(|c| CredentialDigest::from_credentials(&c))
            .map(|digest| digest.to_hex());

        let Some(token) = token else {
            info!(client_id = %self.client_id, "Authentication failure");
            reply(sender, &ServerMessage::auth_failure());
            return Ok(());
        };

        match self.relay.upgrade(self.client_id, Role::Crew).await {
            Ok(_) => {
                info!(client_id = %self.client_id, "Client authenticated as crew");
                reply(sender, &ServerMessage::auth_success(token));
                Ok(())
            }
            Err(RelayError::ChannelClosed) => Err(ConnectionError::RelayClosed),
            Err(e) => Err(ConnectionError::Relay(e.to_string())),
        }
    }

    async fn handle_command(&self, payload: Value, sender: &ClientSender) -> Result<(), ConnectionError> {
        match self.relay.command(self.client_id, payload).await {
            Ok(CommandOutcome::Forwarded) => Ok(()),
            Ok(CommandOutcome::Dropped) => {
                reply(sender, &ServerMessage::command_dropped(DROPPED_REASON));
                Ok(())
            }
            Err(RelayError::NotAuthorized { .. }) => {
                reply(sender, &ServerMessage::command_rejected(REJECTED_REASON));
                Ok(())
            }
            Err(RelayError::ChannelClosed) => Err(ConnectionError::RelayClosed),
            Err(e) => Err(ConnectionError::Relay(e.to_string())),
        }
    }
}

/// Socket limits for client connections.
pub(crate) fn client_ws_config() -> WebSocketConfig {
    WebSocketConfig {
        max_message_size: Some(MAX_FRAME_SIZE),
        max_frame_size: Some(MAX_FRAME_SIZE),
        ..WebSocketConfig::default()
    }
}

/// Queues a reply for this client only.
fn reply(sender: &ClientSender, message: &ServerMessage) {
    match serde_json::to_string(message) {
        Ok(text) => {
            if let Err(e) = sender.try_send(Arc::from(text)) {
                debug!(error = %e, "Failed to queue reply");
            }
        }
        Err(e) => warn!(error = %e, "Failed to serialize reply"),
    }
}

/// Drains the client's queue onto the socket.
///
/// `done` is cancelled however the loop ends, so the reader stops waiting on
/// a client that can no longer be written to.
async fn write_loop(
    mut sink: SplitSink<ClientStream, Message>,
    mut queue: mpsc::Receiver<Arc<str>>,
    client_id: ClientId,
    write_timeout: Duration,
    done: CancellationToken,
) {
    let _done = done.drop_guard();

    while let Some(frame) = queue.recv().await {
        match timeout(write_timeout, sink.send(Message::Text(frame.to_string()))).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!(client_id = %client_id, error = %e, "Client write failed");
                return;
            }
            Err(_) => {
                warn!(client_id = %client_id, "Client write timed out");
                return;
            }
        }
    }

    let _ = sink.close().await;
}

/// Errors that can occur while serving a client.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    #[error("message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("{0}")]
    Protocol(String),

    #[error("relay error: {0}")]
    Relay(String),

    #[error("relay is not running")]
    RelayClosed,

    #[error("client writer stopped")]
    WriterStopped,
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::{Partition, RoleCounts};
    use tokio::net::TcpListener;
    use tokio::time::{sleep, Instant};
    use tokio_tungstenite::MaybeTlsStream;

    use crate::relay::{spawn_relay, StateMerger, MAX_CLIENTS};
    use crate::upstream::UpstreamHandle;

    const WAIT_TIMEOUT: Duration = Duration::from_secs(10);

    type PeerStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

    fn test_relay() -> RelayHandle {
        let (upstream, _endpoint) = UpstreamHandle::channel();
        spawn_relay(StateMerger::default(), upstream)
    }

    fn handler(relay: &RelayHandle, id: u64) -> ConnectionHandler {
        ConnectionHandler::new(
            ClientId::new(id),
            relay.clone(),
            Arc::new(CredentialStore::default()),
            CancellationToken::new(),
        )
    }

    /// Server and client ends of a loopback WebSocket.
    async fn socket_pair() -> (ClientStream, PeerStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/ws", listener.local_addr().unwrap());

        let accept = async {
            let (stream, _) = listener.accept().await.unwrap();
            tokio_tungstenite::accept_async(stream).await.unwrap()
        };
        let connect = async { tokio_tungstenite::connect_async(url).await.unwrap().0 };
        tokio::join!(accept, connect)
    }

    async fn wait_for_counts(relay: &RelayHandle, expected: RoleCounts) {
        let start = Instant::now();
        while relay.counts().await != expected {
            assert!(start.elapsed() < WAIT_TIMEOUT, "counts never reached {expected:?}");
            sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_stalled_writer_unregisters_client() {
        let relay = test_relay();
        // The peer never reads, so the socket buffers fill up
        let (server, _peer) = socket_pair().await;
        let handler = ConnectionHandler {
            write_timeout: Duration::from_millis(100),
            ..handler(&relay, 1)
        };
        let task = tokio::spawn(handler.run(server));
        wait_for_counts(&relay, RoleCounts::new(0, 1)).await;

        let bulk = "x".repeat(1 << 20);
        let start = Instant::now();
        while relay.counts().await.total() > 0 {
            assert!(start.elapsed() < WAIT_TIMEOUT, "stalled client still registered");
            relay
                .broadcast(Partition::All, ServerMessage::error(bulk.clone()))
                .await;
            sleep(Duration::from_millis(10)).await;
        }

        timeout(WAIT_TIMEOUT, task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_closed_peer_unregisters_client() {
        let relay = test_relay();
        let (server, peer) = socket_pair().await;
        let task = tokio::spawn(handler(&relay, 1).run(server));
        wait_for_counts(&relay, RoleCounts::new(0, 1)).await;

        drop(peer);

        wait_for_counts(&relay, RoleCounts::default()).await;
        timeout(WAIT_TIMEOUT, task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_full_registry_answers_error_and_closes() {
        let relay = test_relay();
        let mut queues = Vec::new();
        for n in 0..MAX_CLIENTS as u64 {
            let (sender, queue) = ClientSender::channel();
            relay.register(ClientId::new(n), sender).await.unwrap();
            queues.push(queue);
        }

        let (server, mut peer) = socket_pair().await;
        let task = tokio::spawn(handler(&relay, 5_000).run(server));

        let frame = timeout(WAIT_TIMEOUT, peer.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let reply: Value = serde_json::from_str(frame.to_text().unwrap()).unwrap();
        assert_eq!(reply["event"], "error");
        assert!(reply["message"].as_str().unwrap().contains("registry is full"));

        // Nothing else arrives before the close
        let end = timeout(WAIT_TIMEOUT, peer.next()).await.unwrap();
        assert!(matches!(end, Some(Ok(Message::Close(_))) | Some(Err(_)) | None));

        timeout(WAIT_TIMEOUT, task).await.unwrap().unwrap();
        assert_eq!(relay.counts().await.total(), MAX_CLIENTS);
    }

    #[test]
    fn test_client_ws_config_caps_messages() {
        let config = client_ws_config();
        assert_eq!(config.max_message_size, Some(MAX_FRAME_SIZE));
        assert_eq!(config.max_frame_size, Some(MAX_FRAME_SIZE));
        assert!(MAX_FRAME_SIZE > MAX_MESSAGE_SIZE);
    }

    #[test]
    fn test_connection_error_display() {
        let err = ConnectionError::MessageTooLarge {
            size: 70_000,
            max: MAX_MESSAGE_SIZE,
        };
        assert_eq!(
            err.to_string(),
            "message too large: 70000 bytes (max: 65536)"
        );

        let err = ConnectionError::Protocol("missing \"action\" field".to_string());
        assert_eq!(err.to_string(), "missing \"action\" field");
    }

    #[test]
    fn test_reply_queues_serialized_message() {
        let (sender, mut queue) = ClientSender::channel();

        reply(&sender, &ServerMessage::auth_failure());

        let frame = queue.try_recv().unwrap();
        assert_eq!(&*frame, r#"{"event":"authentication","status":"failure"}"#);
    }

    #[test]
    fn test_reply_to_closed_client_is_ignored() {
        let (sender, queue) = ClientSender::channel();
        drop(queue);

        reply(&sender, &ServerMessage::shutdown());
    }
}
