//! Stand-in for the onboard controller.
//!
//! Serves a WebSocket endpoint that behaves like the boat: every tick it
//! sends `{"counter": n}` to all connected clients, and it echoes every JSON
//! message it receives to all clients. Point the gateway's upstream URL at
//! it to run the relay without hardware.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::time::{interval, MissedTickBehavior};
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::server::check_path;

/// Default listen address of the simulator.
pub const DEFAULT_SIM_ADDR: &str = "0.0.0.0:8001";

/// Default interval between counter frames.
pub const DEFAULT_TICK: Duration = Duration::from_secs(1);

/// Frames buffered per client before it starts missing some.
const FRAME_BUFFER: usize = 64;

/// Simulated boat device.
pub struct DeviceSimulator {
    listener: TcpListener,
    ws_path: Arc<str>,
    tick: Duration,
    cancel_token: CancellationToken,
}

impl DeviceSimulator {
    pub async fn bind(
        addr: SocketAddr,
        ws_path: impl Into<String>,
        tick: Duration,
        cancel_token: CancellationToken,
    ) -> Result<Self, SimulatorError> {
        if tick.is_zero() {
            return Err(SimulatorError::ZeroInterval);
        }
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| SimulatorError::Bind {
                addr,
                error: e.to_string(),
            })?;

        Ok(Self {
            listener,
            ws_path: Arc::from(ws_path.into()),
            tick,
            cancel_token,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, SimulatorError> {
        self.listener
            .local_addr()
            .map_err(|e| SimulatorError::LocalAddr(e.to_string()))
    }

    /// Runs until the cancellation token fires.
    pub async fn run(self) -> Result<(), SimulatorError> {
        info!(
            addr = %self.local_addr()?,
            path = %self.ws_path,
            tick_ms = self.tick.as_millis() as u64,
            "Device simulator listening"
        );

        let (frames, _) = broadcast::channel::<Arc<str>>(FRAME_BUFFER);
        let mut ticker = interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; counting starts one period in.
        ticker.tick().await;
        let mut counter: u64 = 0;

        loop {
            tokio::select! {
                _ = self.cancel_token.cancelled() => {
                    info!("Device simulator stopping");
                    break;
                }

                _ = ticker.tick() => {
                    counter += 1;
                    let frame = json!({ "counter": counter }).to_string();
                    // No receivers is fine
                    let _ = frames.send(Arc::from(frame));
                }

                result = self.listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            debug!(peer = %peer, "Device simulator client connected");
                            tokio::spawn(serve_client(
                                stream,
                                Arc::clone(&self.ws_path),
                                frames.clone(),
                                self.cancel_token.clone(),
                            ));
                        }
                        Err(e) => error!(error = %e, "Failed to accept connection"),
                    }
                }
            }
        }

        Ok(())
    }
}

async fn serve_client(
    stream: TcpStream,
    ws_path: Arc<str>,
    frames: broadcast::Sender<Arc<str>>,
    cancel_token: CancellationToken,
) {
    let callback =
        |request: &Request, response: Response| check_path(&ws_path, request, response);
    let ws = match accept_hdr_async(stream, callback).await {
        Ok(ws) => ws,
        Err(e) => {
            debug!(error = %e, "Device simulator handshake failed");
            return;
        }
    };

    let (mut sink, mut stream) = ws.split();
    let mut outbound = frames.subscribe();
    info!(clients = frames.receiver_count(), "Device simulator client joined");

    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => {
                let _ = sink.close().await;
                break;
            }

            frame = outbound.recv() => match frame {
                Ok(text) => {
                    if sink.send(Message::Text(text.to_string())).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "Device simulator client lagging");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },

            inbound = stream.next() => match inbound {
                Some(Ok(Message::Text(text))) => echo(&frames, &text),
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => {}
            },
        }
    }

    debug!("Device simulator client left");
}

/// Re-broadcasts a received JSON message to every client.
fn echo(frames: &broadcast::Sender<Arc<str>>, text: &str) {
    match serde_json::from_str::<Value>(text) {
        Ok(value) => {
            info!(message = %value, "Device simulator received command");
            let _ = frames.send(Arc::from(value.to_string()));
        }
        Err(e) => warn!(error = %e, "Device simulator ignoring non-JSON message"),
    }
}

/// Errors that can occur while running the simulator.
#[derive(Debug, Error)]
pub enum SimulatorError {
    #[error("Failed to bind {addr}: {error}")]
    Bind { addr: SocketAddr, error: String },

    #[error("Failed to read local address: {0}")]
    LocalAddr(String),

    #[error("Tick interval must be greater than zero")]
    ZeroInterval,
}
