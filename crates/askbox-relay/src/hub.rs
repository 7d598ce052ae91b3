//! Relay hub.
//!
//! The hub owns the connection registry, the outbound connection table, the
//! message router and the presence broadcaster. Transport code talks to the
//! hub only; the registry never leaves it.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, instrument, warn};

use crate::connections::ConnectionTable;
use crate::presence::{PresenceBroadcaster, PresenceMode};
use crate::protocol::{ClientFrame, ServerFrame};
use crate::registry::{ConnectionRegistry, RegistrationOutcome, RegistrationPolicy};
use crate::routing::{MessageRouter, RouteOutcome};
use crate::types::{ConnectionEntry, ConnectionId, UserId};

/// Default per-connection outbound buffer, in frames.
pub const DEFAULT_OUTBOUND_BUFFER: usize = 256;

/// Default presence topic capacity, in frames.
pub const DEFAULT_PRESENCE_CAPACITY: usize = 1024;

/// Relay hub configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Policy for a second registration of the same user
    pub registration_policy: RegistrationPolicy,
    /// How presence changes are published
    pub presence_mode: PresenceMode,
    /// Per-connection outbound channel size
    pub outbound_buffer: usize,
    /// Presence topic size before subscribers lag
    pub presence_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            registration_policy: RegistrationPolicy::default(),
            presence_mode: PresenceMode::default(),
            outbound_buffer: DEFAULT_OUTBOUND_BUFFER,
            presence_capacity: DEFAULT_PRESENCE_CAPACITY,
        }
    }
}

/// Everything a transport task needs to serve one accepted connection.
#[derive(Debug)]
pub struct ConnectionHandle {
    /// Identifier assigned to this connection
    pub id: ConnectionId,
    /// Frames addressed to this connection only
    pub outbound: mpsc::Receiver<ServerFrame>,
    /// Presence frames for every connection
    pub presence: broadcast::Receiver<ServerFrame>,
    /// Presence snapshot to send before anything else
    pub initial: ServerFrame,
}

/// What the hub did with a client frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameOutcome {
    Registered(RegistrationOutcome),
    Routed(RouteOutcome),
}

/// Shared relay state.
pub struct RelayHub {
    registry: Arc<ConnectionRegistry>,
    connections: Arc<ConnectionTable>,
    router: MessageRouter,
    presence: PresenceBroadcaster,
}

impl RelayHub {
    pub fn new(config: RelayConfig) -> Self {
        let registry = Arc::new(ConnectionRegistry::with_policy(config.registration_policy));
        let connections = Arc::new(ConnectionTable::new(config.outbound_buffer));
        let router = MessageRouter::new(Arc::clone(&registry), Arc::clone(&connections));
        let presence = PresenceBroadcaster::new(config.presence_mode, config.presence_capacity);

        Self {
            registry,
            connections,
            router,
            presence,
        }
    }

    /// Accept a new transport connection.
    ///
    /// The presence subscription is taken before the snapshot, so every
    /// mutation is either in the snapshot or on the subscription.
    pub fn connect(&self) -> ConnectionHandle {
        let id = ConnectionId::generate();
        let outbound = self.connections.insert(id.clone());
        let presence = self.presence.subscribe();
        let initial = self.resync_frame();

        info!(connection = %id, connections = self.connections.len(), "Connection accepted");

        ConnectionHandle {
            id,
            outbound,
            presence,
            initial,
        }
    }

    /// Apply a decoded client frame.
    #[instrument(skip(self, frame), fields(connection = %connection_id))]
    pub fn handle_frame(&self, connection_id: &ConnectionId, frame: ClientFrame) -> FrameOutcome {
        match frame {
            ClientFrame::Register { user_id } => {
                FrameOutcome::Registered(self.register(connection_id, user_id))
            }
            ClientFrame::Send(message) => FrameOutcome::Routed(self.router.route(message)),
        }
    }

    /// Decode and apply a text frame. Malformed frames are logged and
    /// dropped.
    pub fn handle_text(&self, connection_id: &ConnectionId, text: &str) -> Option<FrameOutcome> {
        match ClientFrame::parse(text) {
            Ok(frame) => Some(self.handle_frame(connection_id, frame)),
            Err(e) => {
                warn!(connection = %connection_id, error = %e, "Ignoring malformed frame");
                None
            }
        }
    }

    /// Tear down a connection and publish the users it took offline.
    pub fn disconnect(&self, connection_id: &ConnectionId) -> Vec<ConnectionEntry> {
        self.connections.remove(connection_id);
        let removed = self
            .registry
            .unregister_with(connection_id, |change| {
                self.presence.publish(change);
            });

        info!(
            connection = %connection_id,
            users_removed = removed.len(),
            connections = self.connections.len(),
            "Connection closed"
        );
        removed
    }

    /// Full presence frame for the current registry state.
    pub fn resync_frame(&self) -> ServerFrame {
        let (revision, users) = self.registry.versioned_snapshot();
        PresenceBroadcaster::snapshot_frame(revision, users)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn registered_count(&self) -> usize {
        self.registry.len()
    }

    pub fn presence_snapshot(&self) -> Vec<ConnectionEntry> {
        self.registry.snapshot()
    }

    pub fn is_online(&self, user_id: &UserId) -> bool {
        self.registry.is_registered(user_id)
    }

    pub fn config(&self) -> RelayConfig {
        RelayConfig {
            registration_policy: self.registry.policy(),
            presence_mode: self.presence.mode(),
            outbound_buffer: self.connections.buffer(),
            presence_capacity: self.presence.capacity(),
        }
    }

    fn register(&self, connection_id: &ConnectionId, user_id: UserId) -> RegistrationOutcome {
        if !self.connections.contains(connection_id) {
            debug!(user = %user_id, "Register from closed connection ignored");
            return RegistrationOutcome::Ignored {
                existing: connection_id.clone(),
            };
        }

        let outcome = self
            .registry
            .register_with(user_id.clone(), connection_id.clone(), |change| {
                self.presence.publish(change);
            });

        match &outcome {
            RegistrationOutcome::Inserted => info!(user = %user_id, "User registered"),
            RegistrationOutcome::Replaced { previous } => {
                info!(user = %user_id, previous = %previous, "User registration replaced")
            }
            RegistrationOutcome::Ignored { existing } => {
                debug!(user = %user_id, existing = %existing, "Registration ignored")
            }
        }
        outcome
    }
}

impl Default for RelayHub {
    fn default() -> Self {
        Self::new(RelayConfig::default())
    }
}

impl std::fmt::Debug for RelayHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayHub")
            .field("registry", &self.registry)
            .field("connections", &self.connections)
            .field("presence", &self.presence)
            .finish()
    }
}
