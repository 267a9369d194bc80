//! Protocol decoding errors.

use thiserror::Error;

/// Errors produced while decoding a client frame.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// The frame is not valid JSON.
    #[error("invalid JSON: {0}")]
    InvalidJson(String),

    /// The frame is JSON but not an object.
    #[error("expected a JSON object")]
    NotAnObject,

    /// The object has no string `action` field.
    #[error("missing \"action\" field")]
    MissingAction,
}

impl ProtocolError {
    /// Creates an invalid JSON error from any error type.
    pub fn json<E: std::fmt::Display>(err: E) -> Self {
        Self::InvalidJson(err.to_string())
    }
}
