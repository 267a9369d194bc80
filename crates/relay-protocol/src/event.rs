//! Events sent by clients to the gateway.
//!
//! Every client frame is a JSON object with an `action` field. The only
//! action the gateway interprets itself is `authenticate`; every other
//! action is a command for the boat and travels upstream untouched.

use serde_json::{Map, Value};

use crate::error::ProtocolError;

/// Action name of the authentication event.
pub const AUTHENTICATE_ACTION: &str = "authenticate";

/// Credentials supplied with an `authenticate` event.
///
/// A token is a previously issued digest (the one echoed back on a
/// successful login); a username/password pair is hashed by the gateway.
/// When a frame carries a `token` field, the token wins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credentials {
    Token { token: String },
    Password { username: String, password: String },
}

impl Credentials {
    pub fn token(token: impl Into<String>) -> Self {
        Self::Token {
            token: token.into(),
        }
    }

    pub fn password(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self::Password {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Extracts credentials from the fields of an `authenticate` frame.
    ///
    /// A present `token` field decides alone: a non-string token yields
    /// `None` even when a username/password pair is also present.
    pub fn from_fields(fields: &Map<String, Value>) -> Option<Self> {
        if let Some(token) = fields.get("token") {
            return token.as_str().map(Self::token);
        }
        let username = fields.get("username")?.as_str()?;
        let password = fields.get("password")?.as_str()?;
        Some(Self::password(username, password))
    }
}

/// A decoded client frame.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// Request to be promoted to crew.
    ///
    /// `credentials` is `None` when the frame carries neither a token nor a
    /// complete username/password pair; such a request always fails.
    Authenticate { credentials: Option<Credentials> },

    /// Anything else: a command for the boat, kept verbatim.
    Command { action: String, payload: Value },
}

impl ClientEvent {
    /// Decodes a text frame.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::InvalidJson` if the frame is not JSON
    /// - `ProtocolError::NotAnObject` if the frame is not a JSON object
    /// - `ProtocolError::MissingAction` if there is no string `action`
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(text).map_err(ProtocolError::json)?;
        Self::from_value(value)
    }

    /// Decodes an already parsed JSON value.
    pub fn from_value(value: Value) -> Result<Self, ProtocolError> {
        let Value::Object(fields) = &value else {
            return Err(ProtocolError::NotAnObject);
        };
        let action = fields
            .get("action")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .ok_or(ProtocolError::MissingAction)?;

        if action == AUTHENTICATE_ACTION {
            // Incomplete credentials are not a protocol error: the client
            // gets an authentication failure like any wrong password.
            let credentials = Credentials::from_fields(fields);
            return Ok(Self::Authenticate { credentials });
        }

        Ok(Self::Command {
            action,
            payload: value,
        })
    }
}
