//! Upstream link state.

use serde::{Deserialize, Serialize};

/// State of the single connection to the boat.
///
/// ```text
/// Disconnected ──tick──▶ Connecting ──ok──▶ Connected
///      ▲                     │                  │
///      └─────────fail────────┘◀──eof / error────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl LinkState {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }
}

impl std::fmt::Display for LinkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_disconnected() {
        assert_eq!(LinkState::default(), LinkState::Disconnected);
        assert!(!LinkState::Connecting.is_connected());
        assert!(LinkState::Connected.is_connected());
    }

    #[test]
    fn test_display() {
        assert_eq!(LinkState::Connecting.to_string(), "connecting");
    }
}
