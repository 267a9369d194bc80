//! Client roles and broadcast partitions.

use serde::{Deserialize, Serialize};

/// Role of a connected client.
///
/// Every client starts as a passenger and may be promoted to crew by
/// authenticating. Roles never go back down while the connection lives.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Authenticated operator, allowed to send commands to the boat.
    Crew,
    /// Observer that only receives broadcasts.
    #[default]
    Passenger,
}

impl Role {
    /// Returns true if this role may issue commands upstream.
    pub fn can_command(&self) -> bool {
        matches!(self, Self::Crew)
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Crew => write!(f, "crew"),
            Self::Passenger => write!(f, "passenger"),
        }
    }
}

/// Selects which clients a broadcast reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Partition {
    /// Every connected client.
    All,
    /// Crew only.
    Crew,
    /// Passengers only.
    Passengers,
}

impl std::fmt::Display for Partition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::All => write!(f, "all"),
            Self::Crew => write!(f, "crew"),
            Self::Passengers => write!(f, "passengers"),
        }
    }
}

/// Number of connected clients per role.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleCounts {
    pub crew: usize,
    pub passengers: usize,
}

impl RoleCounts {
    pub fn new(crew: usize, passengers: usize) -> Self {
        Self { crew, passengers }
    }

    /// Total number of connected clients.
    pub fn total(&self) -> usize {
        self.crew.saturating_add(self.passengers)
    }
}
