//! Upstream bridge to the boat.
//!
//! A single task owns the WebSocket connection to the device. It reconnects
//! on a fixed timer, feeds telemetry to the relay actor and writes commands
//! queued through an `UpstreamHandle`.
//!
//! ```text
//!              UpstreamHandle (commands, link state)
//!                        │
//!   RelayActor ──────────┘
//!       ▲                          ┌──────────────┐
//!       │  Telemetry / Connected   │   boat (WS)  │
//!       └─────── UpstreamBridge ◀──┴──────────────┘
//! ```

use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, watch};

use relay_core::LinkState;

mod bridge;

pub use bridge::UpstreamBridge;

/// Capacity of the outbound command queue.
const COMMAND_BUFFER: usize = 64;

/// Errors returned when queueing a command for the boat.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum UpstreamError {
    #[error("upstream is not connected")]
    NotConnected,

    #[error("upstream command queue is full")]
    Full,

    #[error("upstream bridge has stopped")]
    Closed,

    #[error("failed to encode command: {0}")]
    Encode(String),
}

/// Producer side of the upstream bridge.
///
/// Cheap to clone. The link state is published by the bridge task and read
/// here without a round trip.
#[derive(Debug, Clone)]
pub struct UpstreamHandle {
    commands: mpsc::Sender<String>,
    state: watch::Receiver<LinkState>,
}

/// Consumer side of the upstream bridge, handed to `UpstreamBridge::new`.
#[derive(Debug)]
pub struct UpstreamEndpoint {
    pub(crate) commands: mpsc::Receiver<String>,
    pub(crate) state: watch::Sender<LinkState>,
}

impl UpstreamEndpoint {
    /// Publishes a new link state.
    #[cfg(test)]
    pub(crate) fn set_state(&self, state: LinkState) {
        self.state.send_replace(state);
    }

    /// Receives the next queued command.
    ///
    /// Returns `None` once every handle is dropped.
    #[cfg(test)]
    pub(crate) async fn recv_command(&mut self) -> Option<String> {
        self.commands.recv().await
    }
}

impl UpstreamHandle {
    /// Creates a connected handle/endpoint pair. The link starts
    /// `Disconnected`.
    pub fn channel() -> (Self, UpstreamEndpoint) {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);
        let (state_tx, state_rx) = watch::channel(LinkState::Disconnected);
        (
            Self {
                commands: cmd_tx,
                state: state_rx,
            },
            UpstreamEndpoint {
                commands: cmd_rx,
                state: state_tx,
            },
        )
    }

    /// Queues a command for the boat.
    ///
    /// Never waits. Commands are not buffered across disconnects.
    ///
    /// # Errors
    ///
    /// - `UpstreamError::NotConnected` unless the link is `Connected`
    /// - `UpstreamError::Full` if the bridge is not keeping up
    /// - `UpstreamError::Closed` if the bridge task has exited
    pub fn send_command(&self, payload: &Value) -> Result<(), UpstreamError> {
        if !self.state().is_connected() {
            return Err(UpstreamError::NotConnected);
        }
        let text =
            serde_json::to_string(payload).map_err(|e| UpstreamError::Encode(e.to_string()))?;

        self.commands.try_send(text).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => UpstreamError::Full,
            mpsc::error::TrySendError::Closed(_) => UpstreamError::Closed,
        })
    }

    /// Current link state.
    pub fn state(&self) -> LinkState {
        *self.state.borrow()
    }

    /// Receiver notified on every link state change.
    pub fn subscribe_state(&self) -> watch::Receiver<LinkState> {
        self.state.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_starts_disconnected() {
        let (handle, _endpoint) = UpstreamHandle::channel();
        assert_eq!(handle.state(), LinkState::Disconnected);
    }

    #[test]
    fn test_command_dropped_while_disconnected() {
        let (handle, mut endpoint) = UpstreamHandle::channel();

        let result = handle.send_command(&json!({"action": "relay"}));

        assert_eq!(result, Err(UpstreamError::NotConnected));
        assert!(endpoint.commands.try_recv().is_err());
    }

    #[test]
    fn test_command_dropped_while_connecting() {
        let (handle, endpoint) = UpstreamHandle::channel();
        endpoint.set_state(LinkState::Connecting);

        assert_eq!(
            handle.send_command(&json!({"action": "relay"})),
            Err(UpstreamError::NotConnected)
        );
    }

    #[tokio::test]
    async fn test_command_queued_while_connected() {
        let (handle, mut endpoint) = UpstreamHandle::channel();
        endpoint.set_state(LinkState::Connected);

        handle
            .send_command(&json!({"action": "relay", "pin": 4}))
            .unwrap();

        let text = endpoint.recv_command().await.unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value, json!({"action": "relay", "pin": 4}));
    }

    #[test]
    fn test_command_after_bridge_exit() {
        let (handle, endpoint) = UpstreamHandle::channel();
        endpoint.set_state(LinkState::Connected);
        let UpstreamEndpoint { commands, state } = endpoint;
        drop(commands);

        assert_eq!(
            handle.send_command(&json!({"action": "relay"})),
            Err(UpstreamError::Closed)
        );
        drop(state);
    }

    #[tokio::test]
    async fn test_subscribe_state_sees_changes() {
        let (handle, endpoint) = UpstreamHandle::channel();
        let mut rx = handle.subscribe_state();

        endpoint.set_state(LinkState::Connected);
        rx.changed().await.unwrap();

        assert_eq!(*rx.borrow(), LinkState::Connected);
    }
}
