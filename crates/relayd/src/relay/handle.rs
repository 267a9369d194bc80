//! Client interface for interacting with the RelayActor.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Channel errors are mapped to `RelayError::ChannelClosed`
//! - Queries fall back to empty values when the actor is gone

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use relay_core::{ClientId, Partition, Role, RoleCounts, Snapshot};
use relay_protocol::{ServerMessage, StatusFrame};

use super::clients::ClientSender;
use super::commands::{CommandOutcome, RelayCommand, RelayError};

// ============================================================================
// Relay Handle
// ============================================================================

/// Handle for interacting with the relay actor.
///
/// Cheap to clone; shared by the server, every connection handler and the
/// upstream bridge.
#[derive(Clone)]
pub struct RelayHandle {
    sender: mpsc::Sender<RelayCommand>,
}

impl RelayHandle {
    pub fn new(sender: mpsc::Sender<RelayCommand>) -> Self {
        Self { sender }
    }

    /// Registers a client as a passenger.
    ///
    /// The actor queues the initial status frame on `sender` before
    /// replying.
    ///
    /// # Errors
    ///
    /// - `RelayError::AlreadyRegistered` if the id is taken
    /// - `RelayError::RegistryFull` if the registry is at maximum capacity
    /// - `RelayError::ChannelClosed` if the actor has shut down
    pub async fn register(&self, client_id: ClientId, sender: ClientSender) -> Result<(), RelayError> {
        let (tx, rx) = oneshot::channel();

        self.sender
            .send(RelayCommand::Register {
                client_id,
                sender,
                respond_to: tx,
            })
            .await
            .map_err(|_| RelayError::ChannelClosed)?;

        rx.await.map_err(|_| RelayError::ChannelClosed)?
    }

    /// Removes a client. Fire-and-forget.
    pub async fn unregister(&self, client_id: ClientId) {
        let _ = self.sender.send(RelayCommand::Unregister { client_id }).await;
    }

    /// Promotes a client. Returns whether the role changed.
    ///
    /// # Errors
    ///
    /// - `RelayError::ClientNotFound` if the client is not registered
    /// - `RelayError::RoleDowngrade` if `role` is lower than the current one
    /// - `RelayError::ChannelClosed` if the actor has shut down
    pub async fn upgrade(&self, client_id: ClientId, role: Role) -> Result<bool, RelayError> {
        let (tx, rx) = oneshot::channel();

        self.sender
            .send(RelayCommand::Upgrade {
                client_id,
                role,
                respond_to: tx,
            })
            .await
            .map_err(|_| RelayError::ChannelClosed)?;

        rx.await.map_err(|_| RelayError::ChannelClosed)?
    }

    /// Submits a client command for the boat.
    ///
    /// # Errors
    ///
    /// - `RelayError::NotAuthorized` if the client is not crew
    /// - `RelayError::ClientNotFound` if the client is not registered
    /// - `RelayError::ChannelClosed` if the actor has shut down
    pub async fn command(&self, client_id: ClientId, payload: Value) -> Result<CommandOutcome, RelayError> {
        let (tx, rx) = oneshot::channel();

        self.sender
            .send(RelayCommand::Command {
                client_id,
                payload,
                respond_to: tx,
            })
            .await
            .map_err(|_| RelayError::ChannelClosed)?;

        rx.await.map_err(|_| RelayError::ChannelClosed)?
    }

    /// Reports that the upstream link came up. Fire-and-forget.
    pub async fn upstream_connected(&self) {
        let _ = self.sender.send(RelayCommand::UpstreamConnected).await;
    }

    /// Reports that the upstream link went down. Fire-and-forget.
    pub async fn upstream_lost(&self) {
        let _ = self.sender.send(RelayCommand::UpstreamLost).await;
    }

    /// Delivers a telemetry update. Fire-and-forget.
    pub async fn telemetry(&self, update: Value) {
        let _ = self.sender.send(RelayCommand::Telemetry { update }).await;
    }

    /// Broadcasts a message to a partition. Fire-and-forget.
    pub async fn broadcast(&self, partition: Partition, message: ServerMessage) {
        let _ = self
            .sender
            .send(RelayCommand::Broadcast { partition, message })
            .await;
    }

    /// Current merged snapshot. Empty if the actor is gone.
    pub async fn snapshot(&self) -> Snapshot {
        let (tx, rx) = oneshot::channel();

        if self
            .sender
            .send(RelayCommand::GetSnapshot { respond_to: tx })
            .await
            .is_err()
        {
            return Snapshot::default();
        }

        rx.await.unwrap_or_default()
    }

    /// Status frame a client connecting now would receive.
    ///
    /// Returns `None` if communication with the actor fails.
    pub async fn status(&self) -> Option<StatusFrame> {
        let (tx, rx) = oneshot::channel();

        self.sender
            .send(RelayCommand::GetStatus { respond_to: tx })
            .await
            .ok()?;

        rx.await.ok()
    }

    /// Number of clients per role. Zero if the actor is gone.
    pub async fn counts(&self) -> RoleCounts {
        let (tx, rx) = oneshot::channel();

        if self
            .sender
            .send(RelayCommand::GetCounts { respond_to: tx })
            .await
            .is_err()
        {
            return RoleCounts::default();
        }

        rx.await.unwrap_or_default()
    }

    /// Role of a client, `None` if unknown or the actor is gone.
    pub async fn role_of(&self, client_id: ClientId) -> Option<Role> {
        let (tx, rx) = oneshot::channel();

        self.sender
            .send(RelayCommand::GetRole {
                client_id,
                respond_to: tx,
            })
            .await
            .ok()?;

        rx.await.ok()?
    }

    /// Returns `true` while the actor is running.
    pub fn is_connected(&self) -> bool {
        !self.sender.is_closed()
    }
}
