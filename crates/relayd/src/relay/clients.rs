//! Role-partitioned client registry.
//!
//! Owned by the relay actor. Every client is in `all` and in exactly one of
//! `crew` / `passengers`; all three sets change together inside a single
//! method call, so no caller can observe them out of step.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use relay_core::{ClientId, Partition, Role, RoleCounts};
use relay_protocol::ServerMessage;

use super::commands::RelayError;

/// Maximum number of simultaneously connected clients.
pub const MAX_CLIENTS: usize = 1024;

/// Capacity of a client's outbound frame queue.
pub const CLIENT_QUEUE_CAPACITY: usize = 256;

// ============================================================================
// Client Sender
// ============================================================================

/// Outbound half of a client connection, as seen by the registry.
///
/// Frames are already serialized; the connection's writer task drains the
/// queue onto the socket. Sending never waits: a full queue drops the frame
/// for this client only.
#[derive(Debug, Clone)]
pub struct ClientSender {
    tx: mpsc::Sender<Arc<str>>,
}

impl ClientSender {
    pub fn new(tx: mpsc::Sender<Arc<str>>) -> Self {
        Self { tx }
    }

    /// Creates a sender together with the queue its writer drains.
    pub fn channel() -> (Self, mpsc::Receiver<Arc<str>>) {
        let (tx, rx) = mpsc::channel(CLIENT_QUEUE_CAPACITY);
        (Self::new(tx), rx)
    }

    /// Queues a serialized frame.
    pub fn try_send(&self, frame: Arc<str>) -> Result<(), SendError> {
        self.tx.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SendError::Full,
            mpsc::error::TrySendError::Closed(_) => SendError::Closed,
        })
    }
}

/// Why a frame could not be queued for a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SendError {
    #[error("client queue is full")]
    Full,

    #[error("client connection is closed")]
    Closed,
}

/// Result of a broadcast.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Clients the frame was queued for.
    pub delivered: usize,
    /// Clients whose queue was full or closed.
    pub failed: usize,
}

// ============================================================================
// Client Registry
// ============================================================================

struct ClientEntry {
    sender: ClientSender,
    role: Role,
}

/// Registry of connected clients and their roles.
#[derive(Default)]
pub struct ClientRegistry {
    all: HashMap<ClientId, ClientEntry>,
    crew: HashSet<ClientId>,
    passengers: HashSet<ClientId>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a client as a passenger.
    ///
    /// # Errors
    ///
    /// - `RelayError::AlreadyRegistered` if the id is taken
    /// - `RelayError::RegistryFull` at `MAX_CLIENTS`
    pub fn register(&mut self, client_id: ClientId, sender: ClientSender) -> Result<(), RelayError> {
        if self.all.contains_key(&client_id) {
            return Err(RelayError::AlreadyRegistered { client_id });
        }
        if self.all.len() >= MAX_CLIENTS {
            warn!(
                client_id = %client_id,
                max = MAX_CLIENTS,
                "Client registry is full, rejecting connection"
            );
            return Err(RelayError::RegistryFull { max: MAX_CLIENTS });
        }

        self.all.insert(
            client_id,
            ClientEntry {
                sender,
                role: Role::Passenger,
            },
        );
        self.passengers.insert(client_id);
        Ok(())
    }

    /// Removes a client. Unknown ids are a no-op.
    ///
    /// Returns the role the client had.
    pub fn unregister(&mut self, client_id: ClientId) -> Option<Role> {
        let entry = self.all.remove(&client_id)?;
        self.crew.remove(&client_id);
        self.passengers.remove(&client_id);
        Some(entry.role)
    }

    /// Moves a client to `role`.
    ///
    /// Returns true if the role changed. Upgrading to the current role is
    /// a no-op.
    ///
    /// # Errors
    ///
    /// - `RelayError::ClientNotFound` for an unknown id
    /// - `RelayError::RoleDowngrade` when moving crew back to passenger
    pub fn upgrade(&mut self, client_id: ClientId, role: Role) -> Result<bool, RelayError> {
        let entry = self
            .all
            .get_mut(&client_id)
            .ok_or(RelayError::ClientNotFound { client_id })?;

        match (entry.role, role) {
            (current, requested) if current == requested => Ok(false),
            (Role::Crew, Role::Passenger) => Err(RelayError::RoleDowngrade { client_id }),
            (_, _) => {
                entry.role = role;
                self.passengers.remove(&client_id);
                self.crew.insert(client_id);
                Ok(true)
            }
        }
    }

    /// Sends a message to every client in `partition`.
    ///
    /// The message is serialized once. Clients whose queue is full or
    /// closed are logged and skipped; delivery to the others continues.
    pub fn broadcast(&self, partition: Partition, message: &ServerMessage) -> BroadcastReport {
        let frame = match serialize(message) {
            Some(frame) => frame,
            None => return BroadcastReport::default(),
        };

        let mut report = BroadcastReport::default();
        let targets: Box<dyn Iterator<Item = &ClientId>> = match partition {
            Partition::All => Box::new(self.all.keys()),
            Partition::Crew => Box::new(self.crew.iter()),
            Partition::Passengers => Box::new(self.passengers.iter()),
        };

        for client_id in targets {
            let Some(entry) = self.all.get(client_id) else {
                continue;
            };
            match entry.sender.try_send(Arc::clone(&frame)) {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    debug!(client_id = %client_id, error = %e, "Broadcast delivery failed");
                    report.failed += 1;
                }
            }
        }

        if report.failed > 0 {
            warn!(
                partition = %partition,
                delivered = report.delivered,
                failed = report.failed,
                "Broadcast reached only part of the partition"
            );
        }
        report
    }

    /// Sends a message to one client.
    pub fn send_to(&self, client_id: ClientId, message: &ServerMessage) -> Result<(), RelayError> {
        let entry = self
            .all
            .get(&client_id)
            .ok_or(RelayError::ClientNotFound { client_id })?;
        let frame = serialize(message).ok_or(RelayError::Encode)?;

        entry.sender.try_send(frame).map_err(|e| {
            debug!(client_id = %client_id, error = %e, "Direct send failed");
            RelayError::Delivery { client_id, error: e }
        })
    }

    pub fn counts(&self) -> RoleCounts {
        RoleCounts::new(self.crew.len(), self.passengers.len())
    }

    pub fn role_of(&self, client_id: ClientId) -> Option<Role> {
        self.all.get(&client_id).map(|entry| entry.role)
    }

    pub fn len(&self) -> usize {
        self.all.len()
    }

    pub fn is_empty(&self) -> bool {
        self.all.is_empty()
    }

    /// Checks that every client is in exactly one partition and that the
    /// partitions agree with the recorded roles.
    #[cfg(test)]
    pub(crate) fn partitions_consistent(&self) -> bool {
        if self.crew.len() + self.passengers.len() != self.all.len() {
            return false;
        }
        self.all.iter().all(|(id, entry)| match entry.role {
            Role::Crew => self.crew.contains(id) && !self.passengers.contains(id),
            Role::Passenger => self.passengers.contains(id) && !self.crew.contains(id),
        })
    }
}

fn serialize(message: &ServerMessage) -> Option<Arc<str>> {
    match serde_json::to_string(message) {
        Ok(text) => Some(Arc::from(text)),
        Err(e) => {
            warn!(error = %e, "Failed to serialize outbound message");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::Snapshot;

    fn client(n: u64) -> ClientId {
        ClientId::new(n)
    }

    fn status() -> ServerMessage {
        ServerMessage::status(Some(Snapshot::new()), RoleCounts::default())
    }

    #[test]
    fn test_register_adds_passenger() {
        let mut registry = ClientRegistry::new();
        let (sender, _rx) = ClientSender::channel();

        registry.register(client(1), sender).unwrap();

        assert_eq!(registry.role_of(client(1)), Some(Role::Passenger));
        assert_eq!(registry.counts(), RoleCounts::new(0, 1));
        assert!(registry.partitions_consistent());
    }

    #[test]
    fn test_register_duplicate() {
        let mut registry = ClientRegistry::new();
        let (a, _rx_a) = ClientSender::channel();
        let (b, _rx_b) = ClientSender::channel();

        registry.register(client(1), a).unwrap();
        let err = registry.register(client(1), b).unwrap_err();

        assert!(matches!(err, RelayError::AlreadyRegistered { .. }));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_register_full() {
        let mut registry = ClientRegistry::new();
        let mut receivers = Vec::new();
        for n in 0..MAX_CLIENTS as u64 {
            let (sender, rx) = ClientSender::channel();
            receivers.push(rx);
            registry.register(client(n), sender).unwrap();
        }

        let (sender, _rx) = ClientSender::channel();
        let err = registry
            .register(client(MAX_CLIENTS as u64), sender)
            .unwrap_err();
        assert!(matches!(err, RelayError::RegistryFull { max: MAX_CLIENTS }));
    }

    #[test]
    fn test_unregister_unknown_is_noop() {
        let mut registry = ClientRegistry::new();
        assert_eq!(registry.unregister(client(9)), None);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_upgrade_and_idempotence() {
        let mut registry = ClientRegistry::new();
        let (sender, _rx) = ClientSender::channel();
        registry.register(client(1), sender).unwrap();

        assert!(registry.upgrade(client(1), Role::Crew).unwrap());
        assert!(!registry.upgrade(client(1), Role::Crew).unwrap());
        assert_eq!(registry.counts(), RoleCounts::new(1, 0));
        assert!(registry.partitions_consistent());
    }

    #[test]
    fn test_downgrade_rejected() {
        let mut registry = ClientRegistry::new();
        let (sender, _rx) = ClientSender::channel();
        registry.register(client(1), sender).unwrap();
        registry.upgrade(client(1), Role::Crew).unwrap();

        let err = registry.upgrade(client(1), Role::Passenger).unwrap_err();
        assert!(matches!(err, RelayError::RoleDowngrade { .. }));
        assert_eq!(registry.role_of(client(1)), Some(Role::Crew));
    }

    #[test]
    fn test_upgrade_unknown() {
        let mut registry = ClientRegistry::new();
        let err = registry.upgrade(client(1), Role::Crew).unwrap_err();
        assert!(matches!(err, RelayError::ClientNotFound { .. }));
    }

    #[test]
    fn test_unregister_crew() {
        let mut registry = ClientRegistry::new();
        let (sender, _rx) = ClientSender::channel();
        registry.register(client(1), sender).unwrap();
        registry.upgrade(client(1), Role::Crew).unwrap();

        assert_eq!(registry.unregister(client(1)), Some(Role::Crew));
        assert_eq!(registry.counts(), RoleCounts::default());
        assert!(registry.partitions_consistent());
    }

    #[test]
    fn test_broadcast_by_partition() {
        let mut registry = ClientRegistry::new();
        let (crew, mut crew_rx) = ClientSender::channel();
        let (passenger, mut passenger_rx) = ClientSender::channel();
        registry.register(client(1), crew).unwrap();
        registry.register(client(2), passenger).unwrap();
        registry.upgrade(client(1), Role::Crew).unwrap();

        let report = registry.broadcast(Partition::Crew, &status());
        assert_eq!(report, BroadcastReport { delivered: 1, failed: 0 });
        assert!(crew_rx.try_recv().is_ok());
        assert!(passenger_rx.try_recv().is_err());

        let report = registry.broadcast(Partition::All, &status());
        assert_eq!(report.delivered, 2);
        assert!(crew_rx.try_recv().is_ok());
        assert!(passenger_rx.try_recv().is_ok());
    }

    #[test]
    fn test_broadcast_skips_closed_client() {
        let mut registry = ClientRegistry::new();
        let (live, mut live_rx) = ClientSender::channel();
        let (dead, dead_rx) = ClientSender::channel();
        registry.register(client(1), live).unwrap();
        registry.register(client(2), dead).unwrap();
        drop(dead_rx);

        let report = registry.broadcast(Partition::All, &status());

        assert_eq!(report, BroadcastReport { delivered: 1, failed: 1 });
        let frame = live_rx.try_recv().unwrap();
        assert!(frame.contains("\"passengers\""));
    }

    #[test]
    fn test_full_queue_drops_frame_for_that_client_only() {
        let mut registry = ClientRegistry::new();
        let (tx, _slow_rx) = mpsc::channel(1);
        let (fast, mut fast_rx) = ClientSender::channel();
        registry.register(client(1), ClientSender::new(tx)).unwrap();
        registry.register(client(2), fast).unwrap();

        registry.broadcast(Partition::All, &status());
        let report = registry.broadcast(Partition::All, &status());

        assert_eq!(report, BroadcastReport { delivered: 1, failed: 1 });
        assert!(fast_rx.try_recv().is_ok());
        assert!(fast_rx.try_recv().is_ok());
    }

    #[test]
    fn test_send_to() {
        let mut registry = ClientRegistry::new();
        let (sender, mut rx) = ClientSender::channel();
        registry.register(client(1), sender).unwrap();

        registry
            .send_to(client(1), &ServerMessage::error("bad frame"))
            .unwrap();
        assert_eq!(
            &*rx.try_recv().unwrap(),
            r#"{"event":"error","message":"bad frame"}"#
        );

        assert!(matches!(
            registry.send_to(client(2), &ServerMessage::shutdown()),
            Err(RelayError::ClientNotFound { .. })
        ));
    }
}
