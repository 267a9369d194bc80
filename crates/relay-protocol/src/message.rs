//! Messages sent from the gateway to clients.

use relay_core::{RoleCounts, Snapshot};
use serde::{Deserialize, Serialize};

/// Boat status frame.
///
/// Sent once to every client on connect, to all clients after every
/// telemetry update, and when the boat link comes up or goes down.
/// `boat` is `null` while the gateway has no link to the boat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusFrame {
    /// Merged telemetry snapshot, or `None` when the boat is unreachable.
    pub boat: Option<Snapshot>,
    /// Number of connected crew members.
    pub crew: usize,
    /// Number of connected passengers.
    pub passengers: usize,
}

impl StatusFrame {
    pub fn new(boat: Option<Snapshot>, counts: RoleCounts) -> Self {
        Self {
            boat,
            crew: counts.crew,
            passengers: counts.passengers,
        }
    }

    /// Frame announcing that the boat link is down.
    pub fn link_lost(counts: RoleCounts) -> Self {
        Self::new(None, counts)
    }

    pub fn counts(&self) -> RoleCounts {
        RoleCounts::new(self.crew, self.passengers)
    }
}

/// Outcome of an authentication attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthStatus {
    Success,
    Failure,
}

/// Outcome of a command that was not delivered to the boat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    /// The sender is not crew.
    Rejected,
    /// The boat link is down; the command was discarded.
    Dropped,
}

/// Events addressed to a single client (or, for shutdown, to everyone).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EventMessage {
    /// Reply to an `authenticate` action.
    Authentication {
        status: AuthStatus,
        /// Digest to reuse for re-authentication (success only).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },

    /// A command was not forwarded to the boat.
    Command {
        status: CommandStatus,
        reason: String,
    },

    /// The client sent something the gateway could not process.
    Error { message: String },

    /// The gateway is shutting down.
    Shutdown,
}

/// Any message the gateway sends to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerMessage {
    Status(StatusFrame),
    Event(EventMessage),
}

impl ServerMessage {
    /// Creates a status frame message.
    pub fn status(boat: Option<Snapshot>, counts: RoleCounts) -> Self {
        Self::Status(StatusFrame::new(boat, counts))
    }

    /// Creates a successful authentication reply.
    pub fn auth_success(token: impl Into<String>) -> Self {
        Self::Event(EventMessage::Authentication {
            status: AuthStatus::Success,
            token: Some(token.into()),
        })
    }

    /// Creates a failed authentication reply.
    pub fn auth_failure() -> Self {
        Self::Event(EventMessage::Authentication {
            status: AuthStatus::Failure,
            token: None,
        })
    }

    /// Creates a command rejection.
    pub fn command_rejected(reason: impl Into<String>) -> Self {
        Self::Event(EventMessage::Command {
            status: CommandStatus::Rejected,
            reason: reason.into(),
        })
    }

    /// Creates a dropped-command notice.
    pub fn command_dropped(reason: impl Into<String>) -> Self {
        Self::Event(EventMessage::Command {
            status: CommandStatus::Dropped,
            reason: reason.into(),
        })
    }

    /// Creates an error event.
    pub fn error(message: impl Into<String>) -> Self {
        Self::Event(EventMessage::Error {
            message: message.into(),
        })
    }

    /// Creates a shutdown notice.
    pub fn shutdown() -> Self {
        Self::Event(EventMessage::Shutdown)
    }
}

impl From<StatusFrame> for ServerMessage {
    fn from(frame: StatusFrame) -> Self {
        Self::Status(frame)
    }
}
