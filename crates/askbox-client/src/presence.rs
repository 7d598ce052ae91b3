// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Askbox Contributors

//! Client mirror of the relay's presence registry.

use std::collections::BTreeMap;

use askbox_relay::{ConnectionEntry, ConnectionId, PresenceChange, UserId};

/// A presence frame received from the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceUpdate {
    /// Full registry contents
    Snapshot {
        revision: u64,
        users: Vec<ConnectionEntry>,
    },
    /// Changes made by one registry revision
    Delta {
        revision: u64,
        changes: Vec<PresenceChange>,
    },
}

impl PresenceUpdate {
    pub fn revision(&self) -> u64 {
        match self {
            PresenceUpdate::Snapshot { revision, .. } | PresenceUpdate::Delta { revision, .. } => {
                *revision
            }
        }
    }
}

/// Who is online, as last reported by the relay.
#[derive(Debug, Default, Clone)]
pub struct PresenceView {
    online: BTreeMap<UserId, ConnectionId>,
    revision: Option<u64>,
}

impl PresenceView {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a presence frame. Frames not newer than the last applied
    /// revision are ignored; returns whether the view changed revision.
    pub fn apply(&mut self, update: PresenceUpdate) -> bool {
        let revision = update.revision();
        if self.revision.is_some_and(|last| revision <= last) {
            tracing::trace!(revision, last = ?self.revision, "Ignoring stale presence frame");
            return false;
        }

        match update {
            PresenceUpdate::Snapshot { users, .. } => {
                self.online = users
                    .into_iter()
                    .map(|entry| (entry.user_id, entry.connection_id))
                    .collect();
            }
            PresenceUpdate::Delta { changes, .. } => {
                for change in changes {
                    match change {
                        PresenceChange::Joined(entry) => {
                            self.online.insert(entry.user_id, entry.connection_id);
                        }
                        PresenceChange::Left(entry) => {
                            if self.online.get(&entry.user_id) == Some(&entry.connection_id) {
                                self.online.remove(&entry.user_id);
                            }
                        }
                    }
                }
            }
        }

        self.revision = Some(revision);
        true
    }

    /// Forget everything; the next frame applies regardless of revision.
    ///
    /// Revisions restart when the relay restarts, so this runs on every
    /// reconnect.
    pub fn reset(&mut self) {
        self.online.clear();
        self.revision = None;
    }

    pub fn is_online(&self, user_id: &UserId) -> bool {
        self.online.contains_key(user_id)
    }

    /// Online users, sorted by id.
    pub fn online_users(&self) -> Vec<UserId> {
        self.online.keys().cloned().collect()
    }

    pub fn revision(&self) -> Option<u64> {
        self.revision
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(user: &str, conn: &str) -> ConnectionEntry {
        ConnectionEntry::new(UserId::new(user).unwrap(), ConnectionId::from(conn))
    }

    fn user(id: &str) -> UserId {
        UserId::new(id).unwrap()
    }

    #[test]
    fn test_snapshot_replaces_view() {
        let mut view = PresenceView::new();
        assert!(view.apply(PresenceUpdate::Snapshot {
            revision: 0,
            users: vec![],
        }));
        assert!(view.apply(PresenceUpdate::Snapshot {
            revision: 3,
            users: vec![entry("b", "c2"), entry("a", "c1")],
        }));

        assert_eq!(view.online_users(), vec![user("a"), user("b")]);
        assert_eq!(view.revision(), Some(3));
    }

    #[test]
    fn test_stale_frames_are_ignored() {
        let mut view = PresenceView::new();
        view.apply(PresenceUpdate::Snapshot {
            revision: 5,
            users: vec![entry("a", "c1")],
        });

        assert!(!view.apply(PresenceUpdate::Delta {
            revision: 5,
            changes: vec![PresenceChange::Left(entry("a", "c1"))],
        }));
        assert!(!view.apply(PresenceUpdate::Snapshot {
            revision: 4,
            users: vec![],
        }));
        assert!(view.is_online(&user("a")));
    }

    #[test]
    fn test_deltas_apply_in_order() {
        let mut view = PresenceView::new();
        view.apply(PresenceUpdate::Snapshot {
            revision: 1,
            users: vec![entry("a", "c1")],
        });
        view.apply(PresenceUpdate::Delta {
            revision: 2,
            changes: vec![PresenceChange::Joined(entry("b", "c2"))],
        });
        view.apply(PresenceUpdate::Delta {
            revision: 3,
            changes: vec![PresenceChange::Left(entry("a", "c1"))],
        });

        assert_eq!(view.online_users(), vec![user("b")]);
    }

    #[test]
    fn test_replacement_delta_keeps_user_online() {
        let mut view = PresenceView::new();
        view.apply(PresenceUpdate::Snapshot {
            revision: 1,
            users: vec![entry("a", "c1")],
        });
        view.apply(PresenceUpdate::Delta {
            revision: 2,
            changes: vec![
                PresenceChange::Left(entry("a", "c1")),
                PresenceChange::Joined(entry("a", "c2")),
            ],
        });

        assert!(view.is_online(&user("a")));
    }

    #[test]
    fn test_left_for_other_connection_is_ignored() {
        let mut view = PresenceView::new();
        view.apply(PresenceUpdate::Snapshot {
            revision: 1,
            users: vec![entry("a", "c2")],
        });
        view.apply(PresenceUpdate::Delta {
            revision: 2,
            changes: vec![PresenceChange::Left(entry("a", "c1"))],
        });

        assert!(view.is_online(&user("a")));
    }

    #[test]
    fn test_reset_accepts_lower_revision() {
        let mut view = PresenceView::new();
        view.apply(PresenceUpdate::Snapshot {
            revision: 9,
            users: vec![entry("a", "c1")],
        });
        view.reset();

        assert!(view.online_users().is_empty());
        assert!(view.apply(PresenceUpdate::Snapshot {
            revision: 0,
            users: vec![],
        }));
    }
}
