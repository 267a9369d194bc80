//! Wires the relay together from a configuration.

use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::RelayConfig;
use crate::credentials::CredentialStore;
use crate::relay::{spawn_relay, RelayHandle, StateMerger};
use crate::server::{RelayServer, ServerError};
use crate::sink::{JsonLinesSink, SinkError, SnapshotSink, TracingSink};
use crate::upstream::{UpstreamBridge, UpstreamHandle};

/// A running gateway: relay actor, upstream bridge and bound server.
///
/// Cancelling the token passed to `start` stops the bridge and
/// makes `run` return after clients have been told about the shutdown.
pub struct Gateway {
    server: RelayServer,
    relay: RelayHandle,
    upstream: UpstreamHandle,
    bridge: JoinHandle<()>,
}

impl Gateway {
    /// Starts every component and binds the listener.
    ///
    /// # Errors
    ///
    /// - `GatewayError::Sink` if the snapshot log cannot be opened
    /// - `GatewayError::Server` if the listen address cannot be bound
    pub async fn start(config: &RelayConfig, cancel_token: CancellationToken) -> Result<Self, GatewayError> {
        let sink: Box<dyn SnapshotSink> = match &config.log.snapshot_log {
            Some(path) => {
                info!(path = %path.display(), "Writing snapshots to file");
                Box::new(JsonLinesSink::open(path)?)
            }
            None => Box::new(TracingSink),
        };

        let credentials = Arc::new(CredentialStore::from_hex_digests(&config.credentials.digests));
        if credentials.is_empty() {
            warn!("No crew credentials configured; nobody can send commands");
        } else {
            info!(digests = credentials.len(), "Loaded crew credentials");
        }

        let (upstream, endpoint) = UpstreamHandle::channel();
        let relay = spawn_relay(StateMerger::new(sink), upstream.clone());

        let server = RelayServer::bind(
            config.listen_addr,
            config.ws_path.clone(),
            relay.clone(),
            credentials,
            cancel_token.clone(),
        )
        .await?;

        let bridge = UpstreamBridge::new(
            config.upstream.clone(),
            relay.clone(),
            endpoint,
            cancel_token,
        );
        let bridge = tokio::spawn(bridge.run());

        Ok(Self {
            server,
            relay,
            upstream,
            bridge,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, GatewayError> {
        Ok(self.server.local_addr()?)
    }

    pub fn relay(&self) -> &RelayHandle {
        &self.relay
    }

    pub fn upstream(&self) -> &UpstreamHandle {
        &self.upstream
    }

    /// Serves clients until the cancellation token fires.
    pub async fn run(self) -> Result<(), GatewayError> {
        let Self { server, bridge, .. } = self;

        let result = server.run().await;
        if let Err(e) = bridge.await {
            warn!(error = %e, "Upstream bridge task failed");
        }
        Ok(result?)
    }
}

/// Errors that can occur while starting or running the gateway.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Snapshot log error: {0}")]
    Sink(#[from] SinkError),

    #[error("Server error: {0}")]
    Server(#[from] ServerError),
}
