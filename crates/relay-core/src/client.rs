//! Client connection identity.

use serde::{Deserialize, Serialize};

/// Opaque identifier of one client connection.
///
/// Assigned by the server from a monotonically increasing counter, so an
/// identifier is never reused while the process lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(u64);

impl ClientId {
    pub fn new(number: u64) -> Self {
        Self(number)
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "client-{}", self.0)
    }
}
