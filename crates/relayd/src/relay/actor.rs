//! Relay actor: owns the client registry, the snapshot and the
//! upstream-present flag, and processes commands one at a time.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Response channel send failures are ignored (the requester went away)
//! - Per-client delivery failures are logged and never stop a broadcast

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use relay_core::{ClientId, Partition, Role};
use relay_protocol::{ServerMessage, StatusFrame};

use super::clients::{ClientRegistry, ClientSender};
use super::commands::{CommandOutcome, RelayCommand, RelayError};
use super::merger::StateMerger;
use crate::upstream::{UpstreamError, UpstreamHandle};

// ============================================================================
// Relay Actor
// ============================================================================

/// The relay actor - single owner of all shared relay state.
///
/// Commands from connection handlers and the upstream bridge arrive on one
/// mpsc channel and are handled sequentially, so a broadcast always sees
/// the registry and the snapshot in a consistent state.
pub struct RelayActor {
    receiver: mpsc::Receiver<RelayCommand>,
    clients: ClientRegistry,
    merger: StateMerger,
    upstream: UpstreamHandle,

    /// True between `UpstreamConnected` and `UpstreamLost`. Decides whether
    /// status frames carry the snapshot or `null`.
    upstream_present: bool,
}

impl RelayActor {
    pub fn new(
        receiver: mpsc::Receiver<RelayCommand>,
        merger: StateMerger,
        upstream: UpstreamHandle,
    ) -> Self {
        Self {
            receiver,
            clients: ClientRegistry::new(),
            merger,
            upstream,
            upstream_present: false,
        }
    }

    /// Runs until every `RelayHandle` is dropped.
    pub async fn run(mut self) {
        info!("Relay actor starting");

        while let Some(cmd) = self.receiver.recv().await {
            self.handle_command(cmd);
        }

        info!(clients = self.clients.len(), "Relay actor stopped");
    }

    fn handle_command(&mut self, cmd: RelayCommand) {
        match cmd {
            RelayCommand::Register {
                client_id,
                sender,
                respond_to,
            } => {
                let result = self.handle_register(client_id, sender);
                let _ = respond_to.send(result);
            }
            RelayCommand::Unregister { client_id } => {
                self.handle_unregister(client_id);
            }
            RelayCommand::Upgrade {
                client_id,
                role,
                respond_to,
            } => {
                let result = self.handle_upgrade(client_id, role);
                let _ = respond_to.send(result);
            }
            RelayCommand::Command {
                client_id,
                payload,
                respond_to,
            } => {
                let result = self.handle_client_command(client_id, &payload);
                let _ = respond_to.send(result);
            }
            RelayCommand::UpstreamConnected => {
                self.handle_upstream_connected();
            }
            RelayCommand::UpstreamLost => {
                self.handle_upstream_lost();
            }
            RelayCommand::Telemetry { update } => {
                self.handle_telemetry(update);
            }
            RelayCommand::Broadcast { partition, message } => {
                self.clients.broadcast(partition, &message);
            }
            RelayCommand::GetSnapshot { respond_to } => {
                let _ = respond_to.send(self.merger.snapshot().clone());
            }
            RelayCommand::GetStatus { respond_to } => {
                let _ = respond_to.send(self.status_frame());
            }
            RelayCommand::GetCounts { respond_to } => {
                let _ = respond_to.send(self.clients.counts());
            }
            RelayCommand::GetRole {
                client_id,
                respond_to,
            } => {
                let _ = respond_to.send(self.clients.role_of(client_id));
            }
        }
    }

    // ========================================================================
    // Command Handlers
    // ========================================================================

    fn handle_register(&mut self, client_id: ClientId, sender: ClientSender) -> Result<(), RelayError> {
        self.clients.register(client_id, sender)?;

        let counts = self.clients.counts();
        info!(
            client_id = %client_id,
            crew = counts.crew,
            passengers = counts.passengers,
            "Client connected"
        );

        let initial = ServerMessage::from(self.status_frame());
        if let Err(e) = self.clients.send_to(client_id, &initial) {
            warn!(client_id = %client_id, error = %e, "Failed to send initial status");
        }
        Ok(())
    }

    fn handle_unregister(&mut self, client_id: ClientId) {
        match self.clients.unregister(client_id) {
            Some(role) => {
                let counts = self.clients.counts();
                info!(
                    client_id = %client_id,
                    role = %role,
                    crew = counts.crew,
                    passengers = counts.passengers,
                    "Client disconnected"
                );
            }
            None => debug!(client_id = %client_id, "Unregister for unknown client ignored"),
        }
    }

    fn handle_upgrade(&mut self, client_id: ClientId, role: Role) -> Result<bool, RelayError> {
        let changed = self.clients.upgrade(client_id, role)?;
        if changed {
            let counts = self.clients.counts();
            info!(
                client_id = %client_id,
                role = %role,
                crew = counts.crew,
                passengers = counts.passengers,
                "Client upgraded"
            );
        }
        Ok(changed)
    }

    fn handle_client_command(
        &mut self,
        client_id: ClientId,
        payload: &Value,
    ) -> Result<CommandOutcome, RelayError> {
        let role = self
            .clients
            .role_of(client_id)
            .ok_or(RelayError::ClientNotFound { client_id })?;

        if !role.can_command() {
            info!(client_id = %client_id, role = %role, "Rejected command from non-crew client");
            return Err(RelayError::NotAuthorized { client_id, role });
        }

        match self.upstream.send_command(payload) {
            Ok(()) => {
                debug!(client_id = %client_id, "Command forwarded upstream");
                Ok(CommandOutcome::Forwarded)
            }
            Err(e) => {
                if !matches!(e, UpstreamError::NotConnected) {
                    warn!(client_id = %client_id, error = %e, "Command not forwarded upstream");
                } else {
                    debug!(client_id = %client_id, "Command dropped, upstream not connected");
                }
                Ok(CommandOutcome::Dropped)
            }
        }
    }

    fn handle_upstream_connected(&mut self) {
        self.upstream_present = true;
        info!("Upstream connected");
        self.clients
            .broadcast(Partition::All, &ServerMessage::from(self.status_frame()));
    }

    fn handle_upstream_lost(&mut self) {
        self.upstream_present = false;
        info!("Upstream connection lost");
        let frame = StatusFrame::link_lost(self.clients.counts());
        self.clients
            .broadcast(Partition::All, &ServerMessage::from(frame));
    }

    fn handle_telemetry(&mut self, update: Value) {
        let counts = self.clients.counts();
        let snapshot = match self.merger.merge(update) {
            Ok(snapshot) => snapshot.clone(),
            Err(e) => {
                warn!(error = %e, "Ignoring telemetry update");
                return;
            }
        };
        debug!(fields = snapshot.len(), clients = counts.total(), "Telemetry merged");

        let message = ServerMessage::status(Some(snapshot), counts);
        self.clients.broadcast(Partition::All, &message);
    }

    /// Status frame for the current state.
    fn status_frame(&self) -> StatusFrame {
        let boat = self
            .upstream_present
            .then(|| self.merger.snapshot().clone());
        StatusFrame::new(boat, self.clients.counts())
    }

    #[cfg(test)]
    pub(crate) fn partitions_consistent(&self) -> bool {
        self.clients.partitions_consistent()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::{LinkState, RoleCounts};
    use serde_json::json;
    use std::sync::Arc;
    use tokio::sync::oneshot;

    use crate::upstream::UpstreamEndpoint;

    fn create_actor() -> (RelayActor, UpstreamEndpoint) {
        let (_cmd_tx, cmd_rx) = mpsc::channel(16);
        let (upstream, endpoint) = UpstreamHandle::channel();
        (
            RelayActor::new(cmd_rx, StateMerger::default(), upstream),
            endpoint,
        )
    }

    fn register(actor: &mut RelayActor, n: u64) -> mpsc::Receiver<Arc<str>> {
        let (sender, rx) = ClientSender::channel();
        let (tx, _rx) = oneshot::channel();
        actor.handle_command(RelayCommand::Register {
            client_id: ClientId::new(n),
            sender,
            respond_to: tx,
        });
        rx
    }

    fn next_frame(rx: &mut mpsc::Receiver<Arc<str>>) -> Value {
        let text = rx.try_recv().unwrap();
        serde_json::from_str(&text).unwrap()
    }

    #[test]
    fn test_initial_status_without_upstream() {
        let (mut actor, _endpoint) = create_actor();
        let mut rx = register(&mut actor, 1);

        assert_eq!(
            next_frame(&mut rx),
            json!({"boat": null, "crew": 0, "passengers": 1})
        );
    }

    #[test]
    fn test_initial_status_with_upstream_carries_snapshot() {
        let (mut actor, _endpoint) = create_actor();
        actor.handle_command(RelayCommand::UpstreamConnected);
        actor.handle_command(RelayCommand::Telemetry {
            update: json!({"speed": 5}),
        });

        let mut rx = register(&mut actor, 1);

        assert_eq!(
            next_frame(&mut rx),
            json!({"boat": {"speed": 5}, "crew": 0, "passengers": 1})
        );
    }

    #[test]
    fn test_telemetry_broadcast_to_all() {
        let (mut actor, _endpoint) = create_actor();
        let mut a = register(&mut actor, 1);
        let mut b = register(&mut actor, 2);
        actor
            .handle_upgrade(ClientId::new(1), Role::Crew)
            .unwrap();
        next_frame(&mut a);
        next_frame(&mut b);

        actor.handle_command(RelayCommand::UpstreamConnected);
        next_frame(&mut a);
        next_frame(&mut b);

        actor.handle_command(RelayCommand::Telemetry {
            update: json!({"speed": 5}),
        });

        let expected = json!({"boat": {"speed": 5}, "crew": 1, "passengers": 1});
        assert_eq!(next_frame(&mut a), expected);
        assert_eq!(next_frame(&mut b), expected);
    }

    #[test]
    fn test_non_object_telemetry_not_broadcast() {
        let (mut actor, _endpoint) = create_actor();
        actor.handle_command(RelayCommand::UpstreamConnected);
        let mut rx = register(&mut actor, 1);
        next_frame(&mut rx);

        actor.handle_command(RelayCommand::Telemetry {
            update: json!(["not", "an", "object"]),
        });

        assert!(rx.try_recv().is_err());
        assert!(actor.merger.snapshot().is_empty());
    }

    #[test]
    fn test_link_lost_broadcasts_null_boat() {
        let (mut actor, _endpoint) = create_actor();
        actor.handle_command(RelayCommand::UpstreamConnected);
        actor.handle_command(RelayCommand::Telemetry {
            update: json!({"speed": 5}),
        });
        let mut rx = register(&mut actor, 1);
        next_frame(&mut rx);

        actor.handle_command(RelayCommand::UpstreamLost);

        assert_eq!(
            next_frame(&mut rx),
            json!({"boat": null, "crew": 0, "passengers": 1})
        );
        // The snapshot survives the link loss
        assert_eq!(actor.merger.snapshot().get("speed"), Some(&json!(5)));
    }

    #[test]
    fn test_passenger_command_rejected() {
        let (mut actor, endpoint) = create_actor();
        endpoint.set_state(LinkState::Connected);
        let _rx = register(&mut actor, 1);

        let result = actor.handle_client_command(ClientId::new(1), &json!({"action": "relay"}));

        assert!(matches!(
            result,
            Err(RelayError::NotAuthorized {
                role: Role::Passenger,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_crew_command_forwarded_when_connected() {
        let (mut actor, mut endpoint) = create_actor();
        endpoint.set_state(LinkState::Connected);
        let _rx = register(&mut actor, 1);
        actor.handle_upgrade(ClientId::new(1), Role::Crew).unwrap();

        let result = actor.handle_client_command(ClientId::new(1), &json!({"action": "relay"}));

        assert_eq!(result.unwrap(), CommandOutcome::Forwarded);
        let text = endpoint.recv_command().await.unwrap();
        assert_eq!(text, r#"{"action":"relay"}"#);
    }

    #[test]
    fn test_crew_command_dropped_when_disconnected() {
        let (mut actor, _endpoint) = create_actor();
        let _rx = register(&mut actor, 1);
        actor.handle_upgrade(ClientId::new(1), Role::Crew).unwrap();

        let result = actor.handle_client_command(ClientId::new(1), &json!({"action": "relay"}));

        assert_eq!(result.unwrap(), CommandOutcome::Dropped);
    }

    #[test]
    fn test_command_from_unknown_client() {
        let (mut actor, _endpoint) = create_actor();
        let result = actor.handle_client_command(ClientId::new(9), &json!({"action": "relay"}));
        assert!(matches!(result, Err(RelayError::ClientNotFound { .. })));
    }

    #[test]
    fn test_partitions_stay_consistent() {
        let (mut actor, _endpoint) = create_actor();
        let mut receivers = Vec::new();
        for n in 0..6 {
            receivers.push(register(&mut actor, n));
        }
        for n in [1, 3, 3, 5] {
            actor.handle_upgrade(ClientId::new(n), Role::Crew).unwrap();
            assert!(actor.partitions_consistent());
        }
        for n in [0, 3, 7] {
            actor.handle_command(RelayCommand::Unregister {
                client_id: ClientId::new(n),
            });
            assert!(actor.partitions_consistent());
        }

        assert_eq!(actor.clients.counts(), RoleCounts::new(2, 2));
    }
}
