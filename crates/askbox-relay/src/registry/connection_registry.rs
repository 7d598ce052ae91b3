//! Connection Registry implementation.
//!
//! Tracks which user is behind which live connection for message routing
//! and presence.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::error::RelayError;
use crate::types::{ConnectionEntry, ConnectionId, UserId};

/// What to do when a user registers while already registered from another
/// connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistrationPolicy {
    /// Keep the existing mapping; the new registration is ignored.
    #[default]
    FirstWins,
    /// Replace the existing mapping with the new connection.
    LastWins,
}

impl FromStr for RegistrationPolicy {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "first_wins" | "first" => Ok(RegistrationPolicy::FirstWins),
            "last_wins" | "last" => Ok(RegistrationPolicy::LastWins),
            other => Err(RelayError::config(format!(
                "unknown registration policy '{other}' (expected first_wins or last_wins)"
            ))),
        }
    }
}

impl fmt::Display for RegistrationPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistrationPolicy::FirstWins => write!(f, "first_wins"),
            RegistrationPolicy::LastWins => write!(f, "last_wins"),
        }
    }
}

/// Result of a `register` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationOutcome {
    /// No mapping existed; one was added
    Inserted,
    /// A mapping existed and was replaced (last-wins)
    Replaced { previous: ConnectionId },
    /// A mapping existed and was kept (first-wins or same connection)
    Ignored { existing: ConnectionId },
}

impl RegistrationOutcome {
    /// Whether the registry changed.
    pub fn is_mutation(&self) -> bool {
        !matches!(self, RegistrationOutcome::Ignored { .. })
    }
}

/// What a single mutation did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeKind {
    Joined(ConnectionEntry),
    Replaced {
        previous: ConnectionEntry,
        current: ConnectionEntry,
    },
    Left(Vec<ConnectionEntry>),
}

/// A registry mutation, handed to observers while the registry lock is held.
#[derive(Debug, Clone)]
pub struct RegistryChange {
    /// Revision after this mutation
    pub revision: u64,
    pub kind: ChangeKind,
    /// Full registry contents after this mutation, in insertion order
    pub snapshot: Vec<ConnectionEntry>,
}

#[derive(Debug)]
struct Slot {
    connection_id: ConnectionId,
    /// Insertion sequence, used to keep snapshots in insertion order
    seq: u64,
}

#[derive(Debug, Default)]
struct RegistryState {
    slots: HashMap<UserId, Slot>,
    next_seq: u64,
    revision: u64,
}

impl RegistryState {
    fn insert(&mut self, user_id: UserId, connection_id: ConnectionId) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.slots.insert(user_id, Slot { connection_id, seq });
    }

    fn snapshot(&self) -> Vec<ConnectionEntry> {
        let mut slots: Vec<(&UserId, &Slot)> = self.slots.iter().collect();
        slots.sort_by_key(|(_, slot)| slot.seq);
        slots
            .into_iter()
            .map(|(user_id, slot)| ConnectionEntry::new(user_id.clone(), slot.connection_id.clone()))
            .collect()
    }
}

/// Registry mapping each user to the connection currently representing it.
///
/// Holds at most one entry per user. All mutations are serialized behind a
/// single lock; `lookup` and `snapshot` take the read side and never observe
/// a half-applied mutation.
///
/// ## Usage
///
/// ```ignore
/// let registry = ConnectionRegistry::with_policy(RegistrationPolicy::FirstWins);
///
/// // When a client announces itself:
/// registry.register_with(user_id, connection_id, |change| broadcaster.publish(change));
///
/// // When routing a message:
/// if let Some(connection_id) = registry.lookup(&receiver) { /* ... */ }
///
/// // When the transport closes:
/// registry.unregister_with(&connection_id, |change| broadcaster.publish(change));
/// ```
pub struct ConnectionRegistry {
    policy: RegistrationPolicy,
    state: RwLock<RegistryState>,
}

impl ConnectionRegistry {
    /// Create a new registry with the default (first-wins) policy.
    pub fn new() -> Self {
        Self::with_policy(RegistrationPolicy::default())
    }

    /// Create a new registry with the given duplicate-registration policy.
    pub fn with_policy(policy: RegistrationPolicy) -> Self {
        info!(policy = %policy, "Creating connection registry");
        Self {
            policy,
            state: RwLock::new(RegistryState::default()),
        }
    }

    pub fn policy(&self) -> RegistrationPolicy {
        self.policy
    }

    fn read(&self) -> RwLockReadGuard<'_, RegistryState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, RegistryState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a user on a connection.
    pub fn register(&self, user_id: UserId, connection_id: ConnectionId) -> RegistrationOutcome {
        self.register_with(user_id, connection_id, |_| {})
    }

    /// Register a user on a connection, calling `on_change` under the
    /// registry lock if the registry changed.
    #[instrument(skip(self, on_change), fields(user = %user_id, connection = %connection_id))]
    pub fn register_with<F>(
        &self,
        user_id: UserId,
        connection_id: ConnectionId,
        on_change: F,
    ) -> RegistrationOutcome
    where
        F: FnOnce(&RegistryChange),
    {
        let mut state = self.write();
        let current = ConnectionEntry::new(user_id.clone(), connection_id.clone());

        let existing = state
            .slots
            .get(&user_id)
            .map(|slot| slot.connection_id.clone());

        let (outcome, kind) = match existing {
            None => {
                state.insert(user_id, connection_id);
                debug!("Registered new user");
                (RegistrationOutcome::Inserted, ChangeKind::Joined(current))
            }
            Some(existing) if existing == connection_id => {
                debug!("User already registered on this connection");
                return RegistrationOutcome::Ignored { existing };
            }
            Some(existing) => match self.policy {
                RegistrationPolicy::FirstWins => {
                    debug!(existing = %existing, "User already registered, keeping first registration");
                    return RegistrationOutcome::Ignored { existing };
                }
                RegistrationPolicy::LastWins => {
                    state.insert(user_id.clone(), connection_id);
                    debug!(previous = %existing, "Replaced existing registration");
                    (
                        RegistrationOutcome::Replaced {
                            previous: existing.clone(),
                        },
                        ChangeKind::Replaced {
                            previous: ConnectionEntry::new(user_id, existing),
                            current,
                        },
                    )
                }
            },
        };

        state.revision += 1;
        let change = RegistryChange {
            revision: state.revision,
            kind,
            snapshot: state.snapshot(),
        };
        on_change(&change);

        outcome
    }

    /// Remove every mapping held by a connection.
    ///
    /// Returns the removed entries; an unknown connection is a no-op.
    pub fn unregister(&self, connection_id: &ConnectionId) -> Vec<ConnectionEntry> {
        self.unregister_with(connection_id, |_| {})
    }

    /// Remove every mapping held by a connection, calling `on_change` under
    /// the registry lock if anything was removed.
    #[instrument(skip(self, on_change), fields(connection = %connection_id))]
    pub fn unregister_with<F>(&self, connection_id: &ConnectionId, on_change: F) -> Vec<ConnectionEntry>
    where
        F: FnOnce(&RegistryChange),
    {
        let mut state = self.write();

        let mut removed: Vec<(u64, ConnectionEntry)> = Vec::new();
        state.slots.retain(|user_id, slot| {
            if &slot.connection_id == connection_id {
                removed.push((
                    slot.seq,
                    ConnectionEntry::new(user_id.clone(), slot.connection_id.clone()),
                ));
                false
            } else {
                true
            }
        });

        if removed.is_empty() {
            debug!("Connection was not registered");
            return Vec::new();
        }

        removed.sort_by_key(|(seq, _)| *seq);
        let removed: Vec<ConnectionEntry> = removed.into_iter().map(|(_, entry)| entry).collect();
        debug!(count = removed.len(), "Unregistered connection");

        state.revision += 1;
        let change = RegistryChange {
            revision: state.revision,
            kind: ChangeKind::Left(removed.clone()),
            snapshot: state.snapshot(),
        };
        on_change(&change);

        removed
    }

    /// Find the connection currently representing a user.
    pub fn lookup(&self, user_id: &UserId) -> Option<ConnectionId> {
        self.read()
            .slots
            .get(user_id)
            .map(|slot| slot.connection_id.clone())
    }

    /// Check if a user is currently registered.
    pub fn is_registered(&self, user_id: &UserId) -> bool {
        self.read().slots.contains_key(user_id)
    }

    /// All current mappings in insertion order.
    pub fn snapshot(&self) -> Vec<ConnectionEntry> {
        self.read().snapshot()
    }

    /// All current mappings together with the revision they belong to.
    pub fn versioned_snapshot(&self) -> (u64, Vec<ConnectionEntry>) {
        let state = self.read();
        (state.revision, state.snapshot())
    }

    /// Number of mutations applied so far.
    pub fn revision(&self) -> u64 {
        self.read().revision
    }

    /// Get the number of registered users.
    pub fn len(&self) -> usize {
        self.read().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().slots.is_empty()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("policy", &self.policy)
            .field("registered", &self.len())
            .finish()
    }
}
