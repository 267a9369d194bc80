//! Relay Protocol - Wire messages for the boat relay gateway
//!
//! This crate provides the JSON messages exchanged over the client-facing
//! WebSocket: events sent by browsers and operator consoles, and the frames
//! and events the gateway pushes back.

pub mod error;
pub mod event;
pub mod message;

pub use error::ProtocolError;
pub use event::{ClientEvent, Credentials, AUTHENTICATE_ACTION};
pub use message::{AuthStatus, CommandStatus, EventMessage, ServerMessage, StatusFrame};
