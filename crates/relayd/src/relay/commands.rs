//! Relay actor commands and errors.
//!
//! - `RelayCommand`: messages sent to the `RelayActor`
//! - `RelayError`: errors returned by relay operations
//! - `CommandOutcome`: what happened to a command a client sent for the boat

use serde_json::Value;
use thiserror::Error;
use tokio::sync::oneshot;

use relay_core::{ClientId, Partition, Role, RoleCounts, Snapshot};
use relay_protocol::{ServerMessage, StatusFrame};

use super::clients::{ClientSender, SendError};

// ============================================================================
// Relay Commands
// ============================================================================

/// Commands sent to the relay actor.
///
/// Request/response commands carry a oneshot `respond_to`; notifications
/// from the upstream bridge and connection teardown are fire-and-forget.
#[derive(Debug)]
pub enum RelayCommand {
    /// Add a client as a passenger and push the initial status frame.
    ///
    /// # Errors
    /// - `RelayError::AlreadyRegistered` if the id is taken
    /// - `RelayError::RegistryFull` if at maximum capacity
    Register {
        client_id: ClientId,
        sender: ClientSender,
        respond_to: oneshot::Sender<Result<(), RelayError>>,
    },

    /// Remove a client. Unknown ids are ignored.
    Unregister { client_id: ClientId },

    /// Promote a client. Responds with whether the role changed.
    ///
    /// # Errors
    /// - `RelayError::ClientNotFound` if the client is not registered
    /// - `RelayError::RoleDowngrade` if `role` is lower than the current one
    Upgrade {
        client_id: ClientId,
        role: Role,
        respond_to: oneshot::Sender<Result<bool, RelayError>>,
    },

    /// A command a client wants delivered to the boat.
    ///
    /// # Errors
    /// - `RelayError::ClientNotFound` if the client is not registered
    /// - `RelayError::NotAuthorized` if the client is not crew
    Command {
        client_id: ClientId,
        payload: Value,
        respond_to: oneshot::Sender<Result<CommandOutcome, RelayError>>,
    },

    /// The upstream link came up.
    UpstreamConnected,

    /// The upstream link went down.
    UpstreamLost,

    /// A telemetry update arrived from the boat.
    Telemetry { update: Value },

    /// Send a message to every client in a partition.
    Broadcast {
        partition: Partition,
        message: ServerMessage,
    },

    /// Current merged snapshot, regardless of link state.
    GetSnapshot {
        respond_to: oneshot::Sender<Snapshot>,
    },

    /// The status frame a newly connected client would receive.
    GetStatus {
        respond_to: oneshot::Sender<StatusFrame>,
    },

    /// Number of clients per role.
    GetCounts {
        respond_to: oneshot::Sender<RoleCounts>,
    },

    /// Role of a client, `None` if not registered.
    GetRole {
        client_id: ClientId,
        respond_to: oneshot::Sender<Option<Role>>,
    },
}

/// What happened to a client command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandOutcome {
    /// Written to the upstream queue.
    Forwarded,
    /// Discarded because the boat link is down.
    Dropped,
}

// ============================================================================
// Relay Errors
// ============================================================================

/// Errors that can occur during relay operations.
#[derive(Debug, Clone, Error)]
pub enum RelayError {
    /// The registry has reached its maximum client capacity.
    #[error("registry is full (max: {max} clients)")]
    RegistryFull {
        /// Maximum number of clients allowed
        max: usize,
    },

    #[error("client not found: {client_id}")]
    ClientNotFound { client_id: ClientId },

    #[error("client already registered: {client_id}")]
    AlreadyRegistered { client_id: ClientId },

    /// The client's role does not allow commands.
    #[error("{client_id} is a {role} and may not send commands")]
    NotAuthorized { client_id: ClientId, role: Role },

    #[error("{client_id} is crew and cannot be downgraded")]
    RoleDowngrade { client_id: ClientId },

    #[error("delivery to {client_id} failed: {error}")]
    Delivery { client_id: ClientId, error: SendError },

    #[error("failed to encode message")]
    Encode,

    /// The response channel was closed before receiving a response.
    ///
    /// This typically indicates the actor was shut down.
    #[error("response channel closed")]
    ChannelClosed,
}
