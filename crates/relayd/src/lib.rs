//! Boat relay daemon - upstream bridge, client registry and broadcast server
//!
//! This crate provides the infrastructure of the shore-side gateway:
//! - `relay` - Relay actor owning clients, roles and the telemetry snapshot
//! - `upstream` - Reconnecting WebSocket bridge to the boat
//! - `server` - WebSocket server for crew and passengers
//! - `credentials` - Crew allow-list of SHA-512 digests
//! - `sink` - Durable snapshot log
//! - `config` - TOML/env configuration
//! - `sim` - Simulated boat for running without hardware
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                         relayd                               │
//! ├──────────────────────────────────────────────────────────────┤
//! │                                                              │
//! │  ┌─────────────────┐      ┌──────────────────────────────┐   │
//! │  │  RelayServer    │─────▶│        RelayActor            │   │
//! │  │  (WebSocket)    │      │ (clients, snapshot, roles)   │   │
//! │  └────────┬────────┘      └───────┬──────────────▲───────┘   │
//! │           │ connections           │ commands     │ telemetry │
//! │           ▼                       ▼              │           │
//! │  ┌─────────────────┐      ┌──────────────────────┴───────┐   │
//! │  │ConnectionHandler│      │       UpstreamBridge         │◀──┼── boat
//! │  │  (per client)   │      │   (single link, retries)     │   │
//! │  └─────────────────┘      └──────────────────────────────┘   │
//! │                                                              │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! All production code in this crate follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations return `Result` or `Option`
//! - Channel operations handle closure gracefully

pub mod config;
pub mod credentials;
pub mod gateway;
pub mod relay;
pub mod server;
pub mod sim;
pub mod sink;
pub mod upstream;

pub use config::{ConfigError, RelayConfig};
pub use gateway::{Gateway, GatewayError};
