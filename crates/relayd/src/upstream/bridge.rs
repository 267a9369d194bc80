//! Reconnecting WebSocket bridge to the boat.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Connect and I/O errors move the link to `Disconnected`; the timer
//!   drives the next attempt
//! - Malformed frames from the boat are logged and skipped

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use relay_core::LinkState;

use super::UpstreamEndpoint;
use crate::config::UpstreamConfig;
use crate::relay::RelayHandle;

type UpstreamStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// What a frame from the boat amounts to.
#[derive(Debug, PartialEq)]
enum Inbound {
    Telemetry(Value),
    Ignored,
    Closed,
}

/// Owns the single connection to the boat.
///
/// State machine:
///
/// ```text
/// Disconnected --tick--> Connecting --ok--> Connected
/// Connecting --fail/timeout--> Disconnected
/// Connected --close/error--> Disconnected
/// ```
///
/// The link never holds more than one socket, and a connect attempt only
/// starts from `Disconnected` on a timer tick. All of it runs in one task, so
/// two attempts can never overlap. Cancellation aborts an attempt in flight.
pub struct UpstreamBridge {
    config: UpstreamConfig,
    relay: RelayHandle,
    commands: mpsc::Receiver<String>,
    state: watch::Sender<LinkState>,
    cancel_token: CancellationToken,
}

impl UpstreamBridge {
    pub fn new(
        config: UpstreamConfig,
        relay: RelayHandle,
        endpoint: UpstreamEndpoint,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            config,
            relay,
            commands: endpoint.commands,
            state: endpoint.state,
            cancel_token,
        }
    }

    /// Runs until the cancellation token fires.
    ///
    /// The first connect attempt happens immediately.
    pub async fn run(self) {
        let Self {
            config,
            relay,
            mut commands,
            state,
            cancel_token,
        } = self;

        info!(
            url = %config.url,
            retry_ms = config.retry_interval_ms,
            "Upstream bridge starting"
        );

        let mut link: Option<UpstreamStream> = None;
        let mut ticker = interval(config.retry_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel_token.cancelled() => {
                    if let Some(mut ws) = link.take() {
                        let _ = ws.close(None).await;
                    }
                    state.send_replace(LinkState::Disconnected);
                    break;
                }

                _ = ticker.tick() => {
                    let failed = match link.as_mut() {
                        None => {
                            link = tokio::select! {
                                _ = cancel_token.cancelled() => None,
                                ws = connect(&config, &state, &relay) => ws,
                            };
                            None
                        }
                        Some(ws) if config.keep_alive_ping => {
                            ws.send(Message::Ping(Vec::new())).await.err()
                        }
                        Some(_) => None,
                    };
                    if let Some(e) = failed {
                        warn!(error = %e, "Upstream keep-alive failed");
                        link = None;
                        mark_lost(&state, &relay).await;
                    }
                }

                Some(text) = commands.recv() => {
                    let failed = match link.as_mut() {
                        Some(ws) => ws.send(Message::Text(text)).await.err(),
                        None => {
                            debug!("Dropping command, upstream not connected");
                            None
                        }
                    };
                    if let Some(e) = failed {
                        warn!(error = %e, "Failed to write command upstream");
                        link = None;
                        mark_lost(&state, &relay).await;
                    }
                }

                frame = next_frame(&mut link) => {
                    match decode(frame) {
                        Inbound::Telemetry(update) => relay.telemetry(update).await,
                        Inbound::Ignored => {}
                        Inbound::Closed => {
                            link = None;
                            mark_lost(&state, &relay).await;
                        }
                    }
                }
            }
        }

        info!("Upstream bridge stopped");
    }
}

/// One connect attempt, bounded by the configured timeout.
async fn connect(
    config: &UpstreamConfig,
    state: &watch::Sender<LinkState>,
    relay: &RelayHandle,
) -> Option<UpstreamStream> {
    state.send_replace(LinkState::Connecting);
    debug!(url = %config.url, "Connecting to upstream");

    match timeout(config.connect_timeout(), connect_async(config.url.as_str())).await {
        Ok(Ok((ws, _response))) => {
            state.send_replace(LinkState::Connected);
            info!(url = %config.url, "Upstream connected");
            relay.upstream_connected().await;
            Some(ws)
        }
        Ok(Err(e)) => {
            state.send_replace(LinkState::Disconnected);
            warn!(url = %config.url, error = %e, "Upstream connection failed");
            None
        }
        Err(_) => {
            state.send_replace(LinkState::Disconnected);
            warn!(
                url = %config.url,
                timeout_ms = config.connect_timeout_ms,
                "Upstream connection timed out"
            );
            None
        }
    }
}

async fn mark_lost(state: &watch::Sender<LinkState>, relay: &RelayHandle) {
    state.send_replace(LinkState::Disconnected);
    info!("Upstream connection lost");
    relay.upstream_lost().await;
}

/// Next frame from the link; pending forever while there is none.
async fn next_frame(
    link: &mut Option<UpstreamStream>,
) -> Option<Result<Message, tungstenite::Error>> {
    match link {
        Some(ws) => ws.next().await,
        None => std::future::pending().await,
    }
}

fn decode(frame: Option<Result<Message, tungstenite::Error>>) -> Inbound {
    let text = match frame {
        Some(Ok(Message::Text(text))) => text,
        Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
            Ok(text) => text,
            Err(_) => {
                warn!("Ignoring non-UTF-8 binary frame from upstream");
                return Inbound::Ignored;
            }
        },
        Some(Ok(Message::Close(frame))) => {
            debug!(frame = ?frame, "Upstream sent close");
            return Inbound::Closed;
        }
        Some(Ok(_)) => return Inbound::Ignored,
        Some(Err(e)) => {
            warn!(error = %e, "Upstream read failed");
            return Inbound::Closed;
        }
        None => return Inbound::Closed,
    };

    // Object-ness is checked when the relay merges the update
    match serde_json::from_str::<Value>(&text) {
        Ok(update) => Inbound::Telemetry(update),
        Err(e) => {
            warn!(error = %e, "Ignoring malformed telemetry from upstream");
            Inbound::Ignored
        }
    }
}
