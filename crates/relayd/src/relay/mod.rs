//! Relay state using the actor pattern.
//!
//! The relay actor is the single owner of the client registry, the merged
//! telemetry snapshot and the upstream-present flag. Connection handlers
//! and the upstream bridge talk to it through a `RelayHandle`.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐                      ┌──────────────────┐
//! │ ConnectionHandler│──┐                ┌─▶│ client queue (1) │
//! └──────────────────┘  │  RelayCommand  │  └──────────────────┘
//! ┌──────────────────┐  ├───────────────▶│  ┌──────────────────┐
//! │  UpstreamBridge  │──┘   RelayActor   ├─▶│ client queue (n) │
//! └──────────────────┘     (registry,    │  └──────────────────┘
//!          ▲                snapshot)    │
//!          └──── UpstreamHandle ◀────────┘  commands from crew
//! ```
//!
//! # Panic-Free Guarantees
//!
//! All operations in this module follow the panic-free policy:
//! - No `.unwrap()` or `.expect()` in production code
//! - All fallible operations return `Result` or `Option`
//! - Channel operations handle closure gracefully

use tokio::sync::mpsc;

mod actor;
mod clients;
mod commands;
mod handle;
mod merger;

pub use actor::RelayActor;
pub use clients::{
    BroadcastReport, ClientRegistry, ClientSender, SendError, CLIENT_QUEUE_CAPACITY, MAX_CLIENTS,
};
pub use commands::{CommandOutcome, RelayCommand, RelayError};
pub use handle::RelayHandle;
pub use merger::StateMerger;

use crate::upstream::UpstreamHandle;

/// Command channel buffer size.
const COMMAND_BUFFER: usize = 256;

/// Spawns the relay actor and returns a handle to it.
///
/// The actor stops once every clone of the returned handle is dropped.
///
/// # Example
///
/// ```no_run
/// use relayd::relay::{spawn_relay, StateMerger};
/// use relayd::upstream::UpstreamHandle;
///
/// #[tokio::main]
/// async fn main() {
///     let (upstream, _endpoint) = UpstreamHandle::channel();
///     let relay = spawn_relay(StateMerger::default(), upstream);
///
///     let counts = relay.counts().await;
///     assert_eq!(counts.total(), 0);
/// }
/// ```
pub fn spawn_relay(merger: StateMerger, upstream: UpstreamHandle) -> RelayHandle {
    let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);

    let actor = RelayActor::new(cmd_rx, merger, upstream);
    tokio::spawn(actor.run());

    RelayHandle::new(cmd_tx)
}
