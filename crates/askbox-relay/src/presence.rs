//! Presence broadcasting.
//!
//! Every registry mutation is published on a single broadcast topic that all
//! open connections subscribe to. In [`PresenceMode::Delta`] each mutation is
//! one `presence_delta` frame; in [`PresenceMode::Snapshot`] each mutation
//! resends the full registry as a `presence` frame.
//!
//! Frames are published while the registry lock is held, so subscribers
//! receive them in revision order. Each connection also receives a full
//! snapshot when it is accepted; clients drop any frame whose revision is not
//! newer than the last one they applied.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, trace};

use crate::error::RelayError;
use crate::protocol::{PresenceChange, ServerFrame};
use crate::registry::{ChangeKind, RegistryChange};
use crate::types::ConnectionEntry;

/// How registry changes are announced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceMode {
    /// Publish only what changed
    #[default]
    Delta,
    /// Publish the full registry on every change
    Snapshot,
}

impl FromStr for PresenceMode {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "delta" | "deltas" => Ok(PresenceMode::Delta),
            "snapshot" | "full" => Ok(PresenceMode::Snapshot),
            other => Err(RelayError::config(format!(
                "unknown presence mode '{other}' (expected delta or snapshot)"
            ))),
        }
    }
}

impl fmt::Display for PresenceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PresenceMode::Delta => write!(f, "delta"),
            PresenceMode::Snapshot => write!(f, "snapshot"),
        }
    }
}

/// Publishes presence frames to every subscribed connection.
pub struct PresenceBroadcaster {
    mode: PresenceMode,
    capacity: usize,
    tx: broadcast::Sender<ServerFrame>,
}

impl PresenceBroadcaster {
    /// Create a broadcaster whose topic buffers `capacity` frames per
    /// subscriber before it starts lagging.
    pub fn new(mode: PresenceMode, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, _) = broadcast::channel(capacity);
        Self { mode, capacity, tx }
    }

    pub fn mode(&self) -> PresenceMode {
        self.mode
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Subscribe to the presence topic.
    pub fn subscribe(&self) -> broadcast::Receiver<ServerFrame> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Build the full-snapshot frame for a registry state.
    pub fn snapshot_frame(revision: u64, users: Vec<ConnectionEntry>) -> ServerFrame {
        ServerFrame::Presence { revision, users }
    }

    /// The frame a registry change is announced with in this mode.
    pub fn frame_for(&self, change: &RegistryChange) -> ServerFrame {
        match self.mode {
            PresenceMode::Snapshot => Self::snapshot_frame(change.revision, change.snapshot.clone()),
            PresenceMode::Delta => {
                let changes = match &change.kind {
                    ChangeKind::Joined(entry) => vec![PresenceChange::Joined(entry.clone())],
                    ChangeKind::Replaced { previous, current } => vec![
                        PresenceChange::Left(previous.clone()),
                        PresenceChange::Joined(current.clone()),
                    ],
                    ChangeKind::Left(entries) => {
                        entries.iter().cloned().map(PresenceChange::Left).collect()
                    }
                };
                ServerFrame::PresenceDelta {
                    revision: change.revision,
                    changes,
                }
            }
        }
    }

    /// Publish a registry change to every subscriber.
    ///
    /// Returns the number of subscribers the frame was queued for.
    pub fn publish(&self, change: &RegistryChange) -> usize {
        let frame = self.frame_for(change);
        trace!(revision = change.revision, event = frame.event_name(), "Publishing presence");
        match self.tx.send(frame) {
            Ok(count) => count,
            Err(_) => {
                debug!(revision = change.revision, "No presence subscribers");
                0
            }
        }
    }
}

impl fmt::Debug for PresenceBroadcaster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PresenceBroadcaster")
            .field("mode", &self.mode)
            .field("subscribers", &self.tx.receiver_count())
            .finish()
    }
}
