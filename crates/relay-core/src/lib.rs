//! Relay Core - Shared types for the boat relay gateway
//!
//! This crate provides the domain types shared between the relay daemon
//! (relayd), its wire protocol and the device simulator.
//!
//! All code follows the panic-free policy: no `.unwrap()`, `.expect()`,
//! `panic!()`, `unreachable!()`, `todo!()`, or direct indexing `[i]`.

pub mod client;
pub mod error;
pub mod link;
pub mod role;
pub mod snapshot;

// Re-exports for convenience
pub use client::ClientId;
pub use error::{DomainError, DomainResult};
pub use link::LinkState;
pub use role::{Partition, Role, RoleCounts};
pub use snapshot::Snapshot;
