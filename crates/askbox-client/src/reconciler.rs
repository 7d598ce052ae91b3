// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Askbox Contributors

//! Conversation reconciler.
//!
//! Merges three sources into the one conversation the user is looking at:
//! history fetched from the persistence API, messages the user sends
//! (shown optimistically before any round trip completes) and messages
//! pushed by the relay.
//!
//! ```text
//!                    select(remote)
//!   NoConversationSelected ───────────▶ Loading { remote, ticket }
//!            ▲                              │          │
//!            │ resolution_failed(ticket)    │          │ resolution_succeeded(ticket)
//!            └──────────────────────────────┘          ▼
//!                                              Ready { remote, chat_id }
//! ```
//!
//! `select` is valid from every state. Each selection issues a fresh
//! [`ResolutionTicket`]; completions carrying any other ticket are ignored,
//! so a slow response for a previous selection can never overwrite a newer
//! one.
//!
//! The reconciler is synchronous and owns no I/O. The driver in
//! [`crate::app`] feeds it events one at a time.

use std::collections::HashSet;
use std::fmt;

use askbox_relay::{ChatId, Delivery, RelayMessage, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::store::StoredMessage;

/// How far apart an entry without a persistence id and a stored message
/// may be and still be treated as the same message.
const MATCH_WINDOW_SECS: i64 = 120;

/// Marks one in-flight history resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResolutionTicket(u64);

impl ResolutionTicket {
    pub fn value(&self) -> u64 {
        self.0
    }
}

/// Identifier of an optimistic entry, unique within one reconciler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LocalId(u64);

impl LocalId {
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for LocalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for LocalId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(LocalId)
    }
}

/// Conversation state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConversationState {
    NoConversationSelected,
    /// History for `remote` is being resolved
    Loading {
        remote: UserId,
        ticket: ResolutionTicket,
    },
    /// The chat with `remote` is open
    Ready { remote: UserId, chat_id: ChatId },
}

/// Delivery status of a conversation entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryStatus {
    /// Shown optimistically; the persistence write has not completed
    Pending,
    /// Persisted, or received from history or the relay
    Confirmed,
    /// The persistence write failed
    Failed(String),
}

/// One message in the visible conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationEntry {
    /// Persistence id, once known
    pub message_id: Option<String>,
    /// Set on entries the local user composed
    pub local_id: Option<LocalId>,
    pub user_id: UserId,
    pub message_text: String,
    pub sent_datetime: DateTime<Utc>,
    pub chat_id: ChatId,
    pub status: EntryStatus,
}

impl ConversationEntry {
    fn from_stored(message: StoredMessage) -> Self {
        Self {
            message_id: Some(message.message_id),
            local_id: None,
            user_id: message.user_id,
            message_text: message.message_text,
            sent_datetime: message.sent_datetime,
            chat_id: message.chat_id,
            status: EntryStatus::Confirmed,
        }
    }

    fn from_delivery(delivery: Delivery, received_at: DateTime<Utc>) -> Self {
        Self {
            message_id: None,
            local_id: None,
            user_id: delivery.sender_id,
            message_text: delivery.text,
            sent_datetime: received_at,
            chat_id: delivery.chat_id,
            status: EntryStatus::Confirmed,
        }
    }

    /// Whether this entry, which has no persistence id of its own, is
    /// `stored` seen from the other side of a round trip.
    fn matches_stored(&self, stored: &StoredMessage) -> bool {
        self.user_id == stored.user_id
            && self.message_text == stored.message_text
            && (self.sent_datetime - stored.sent_datetime).num_seconds().abs() <= MATCH_WINDOW_SECS
    }

    pub fn is_pending(&self) -> bool {
        self.status == EntryStatus::Pending
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.status, EntryStatus::Failed(_))
    }
}

/// A persistence write for an optimistic entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistRequest {
    pub local_id: LocalId,
    pub chat_id: ChatId,
    pub sender_id: UserId,
    pub text: String,
}

/// Everything that has to leave the client for one composed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    /// Frame for the relay
    pub relay: RelayMessage,
    /// Write for the persistence API
    pub persist: PersistRequest,
}

/// Why a message could not be composed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ComposeError {
    #[error("No conversation is open")]
    NoConversation,

    #[error("Conversation with {0} is still loading")]
    Loading(UserId),

    #[error("Message text is empty")]
    EmptyText,
}

/// What happened to a pushed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Appended to the open conversation
    Appended,
    /// Held until the loading conversation resolves
    Held,
    /// Sender marked unread; `added` is false if it already was
    MarkedUnread { added: bool },
}

/// Client-side conversation state machine.
#[derive(Debug)]
pub struct ConversationReconciler {
    state: ConversationState,
    buffer: Vec<ConversationEntry>,
    held: Vec<ConversationEntry>,
    unread: Vec<UserId>,
    unavailable: Option<UserId>,
    next_ticket: u64,
    next_local_id: u64,
}

impl Default for ConversationReconciler {
    fn default() -> Self {
        Self::new()
    }
}

impl ConversationReconciler {
    pub fn new() -> Self {
        Self {
            state: ConversationState::NoConversationSelected,
            buffer: Vec::new(),
            held: Vec::new(),
            unread: Vec::new(),
            unavailable: None,
            next_ticket: 0,
            next_local_id: 0,
        }
    }

    /// Open the conversation with `remote`.
    ///
    /// Valid from any state: clears the visible buffer, drops `remote`
    /// from the unread set and returns the ticket the resolution must
    /// report back with.
    pub fn select(&mut self, remote: UserId) -> ResolutionTicket {
        self.next_ticket += 1;
        let ticket = ResolutionTicket(self.next_ticket);

        self.buffer.clear();
        self.held.clear();
        self.unavailable = None;
        self.unread.retain(|u| u != &remote);

        debug!(remote = %remote, ticket = ticket.0, "Conversation selected");
        self.state = ConversationState::Loading { remote, ticket };
        ticket
    }

    fn is_current(&self, ticket: ResolutionTicket) -> Option<&UserId> {
        match &self.state {
            ConversationState::Loading { remote, ticket: current } if *current == ticket => {
                Some(remote)
            }
            _ => None,
        }
    }

    /// Complete a resolution. Returns false if `ticket` is stale.
    pub fn resolution_succeeded(
        &mut self,
        ticket: ResolutionTicket,
        chat_id: ChatId,
        history: Vec<StoredMessage>,
    ) -> bool {
        let Some(remote) = self.is_current(ticket).cloned() else {
            debug!(ticket = ticket.0, "Ignoring stale resolution");
            return false;
        };

        let mut seen = HashSet::new();
        let mut history: Vec<StoredMessage> = history
            .into_iter()
            .filter(|m| seen.insert(m.message_id.clone()))
            .collect();
        history.sort_by_key(|m| m.sent_datetime);

        let mut matched = vec![false; history.len()];
        let mut pushes = Vec::new();
        for push in std::mem::take(&mut self.held) {
            if push.chat_id != chat_id {
                self.mark_unread(push.user_id);
                continue;
            }
            let duplicate = history
                .iter()
                .enumerate()
                .position(|(i, m)| !matched[i] && push.matches_stored(m));
            match duplicate {
                Some(i) => matched[i] = true,
                None => pushes.push(push),
            }
        }

        let mut entries: Vec<ConversationEntry> =
            history.into_iter().map(ConversationEntry::from_stored).collect();
        entries.extend(pushes);

        debug!(remote = %remote, chat = %chat_id, messages = entries.len(), "Conversation ready");
        self.buffer = entries;
        self.state = ConversationState::Ready { remote, chat_id };
        true
    }

    /// Fail a resolution. Returns false if `ticket` is stale.
    pub fn resolution_failed(&mut self, ticket: ResolutionTicket, reason: &str) -> bool {
        let Some(remote) = self.is_current(ticket).cloned() else {
            debug!(ticket = ticket.0, "Ignoring stale resolution failure");
            return false;
        };

        debug!(remote = %remote, reason, "Conversation unavailable");
        self.buffer.clear();
        self.held.clear();
        self.unavailable = Some(remote);
        self.state = ConversationState::NoConversationSelected;
        true
    }

    /// Take in a message pushed by the relay, stamped with the current time.
    pub fn ingest(&mut self, delivery: Delivery) -> IngestOutcome {
        self.ingest_at(delivery, Utc::now())
    }

    /// Take in a pushed message that arrived at `received_at`.
    pub fn ingest_at(&mut self, delivery: Delivery, received_at: DateTime<Utc>) -> IngestOutcome {
        match &self.state {
            ConversationState::Ready { remote, chat_id }
                if *chat_id == delivery.chat_id && *remote == delivery.sender_id =>
            {
                self.buffer
                    .push(ConversationEntry::from_delivery(delivery, received_at));
                IngestOutcome::Appended
            }
            ConversationState::Loading { remote, .. } if *remote == delivery.sender_id => {
                self.held
                    .push(ConversationEntry::from_delivery(delivery, received_at));
                IngestOutcome::Held
            }
            _ => IngestOutcome::MarkedUnread {
                added: self.mark_unread(delivery.sender_id),
            },
        }
    }

    fn mark_unread(&mut self, user: UserId) -> bool {
        if self.unread.contains(&user) {
            return false;
        }
        self.unread.push(user);
        true
    }

    /// Compose a message in the open conversation.
    ///
    /// The optimistic entry is appended before anything is sent.
    pub fn compose(&mut self, local: &UserId, text: &str) -> Result<OutboundMessage, ComposeError> {
        let (remote, chat_id) = match &self.state {
            ConversationState::Ready { remote, chat_id } => (remote.clone(), chat_id.clone()),
            ConversationState::Loading { remote, .. } => {
                return Err(ComposeError::Loading(remote.clone()))
            }
            ConversationState::NoConversationSelected => return Err(ComposeError::NoConversation),
        };
        if text.trim().is_empty() {
            return Err(ComposeError::EmptyText);
        }

        self.next_local_id += 1;
        let local_id = LocalId(self.next_local_id);

        self.buffer.push(ConversationEntry {
            message_id: None,
            local_id: Some(local_id),
            user_id: local.clone(),
            message_text: text.to_string(),
            sent_datetime: Utc::now(),
            chat_id: chat_id.clone(),
            status: EntryStatus::Pending,
        });

        Ok(OutboundMessage {
            relay: RelayMessage {
                sender_id: local.clone(),
                receiver_id: remote,
                text: text.to_string(),
                chat_id: chat_id.clone(),
            },
            persist: PersistRequest {
                local_id,
                chat_id,
                sender_id: local.clone(),
                text: text.to_string(),
            },
        })
    }

    fn entry_mut(&mut self, local_id: LocalId) -> Option<&mut ConversationEntry> {
        self.buffer
            .iter_mut()
            .find(|e| e.local_id == Some(local_id))
    }

    /// Mark an optimistic entry persisted. Unknown ids are ignored.
    pub fn persist_succeeded(&mut self, local_id: LocalId, stored: StoredMessage) -> bool {
        let Some(entry) = self.entry_mut(local_id) else {
            return false;
        };
        entry.message_id = Some(stored.message_id);
        entry.status = EntryStatus::Confirmed;
        true
    }

    /// Mark an optimistic entry failed. Unknown ids are ignored, as are
    /// entries already confirmed by refetched history.
    pub fn persist_failed(&mut self, local_id: LocalId, reason: impl Into<String>) -> bool {
        let Some(entry) = self.entry_mut(local_id) else {
            return false;
        };
        if entry.message_id.is_some() {
            return false;
        }
        entry.status = EntryStatus::Failed(reason.into());
        true
    }

    /// Put a failed entry back to pending and return its write.
    pub fn retry_failed(&mut self, local_id: LocalId) -> Option<PersistRequest> {
        let entry = self.entry_mut(local_id)?;
        if !entry.is_failed() {
            return None;
        }
        entry.status = EntryStatus::Pending;
        Some(PersistRequest {
            local_id,
            chat_id: entry.chat_id.clone(),
            sender_id: entry.user_id.clone(),
            text: entry.message_text.clone(),
        })
    }

    /// Merge refetched history into the open conversation.
    ///
    /// Messages already shown are skipped: by persistence id, or for
    /// entries that have none yet (pushes and unconfirmed sends) by sender,
    /// text and time. Such an entry takes over the stored id. Returns how
    /// many entries were added.
    pub fn merge_history(&mut self, messages: Vec<StoredMessage>) -> usize {
        let ConversationState::Ready { chat_id, .. } = &self.state else {
            return 0;
        };
        let chat_id = chat_id.clone();

        let mut known: HashSet<String> = self
            .buffer
            .iter()
            .filter_map(|e| e.message_id.clone())
            .collect();

        let mut added = 0;
        for message in messages {
            if message.chat_id != chat_id || !known.insert(message.message_id.clone()) {
                continue;
            }
            let unconfirmed = self
                .buffer
                .iter_mut()
                .find(|e| e.message_id.is_none() && !e.is_failed() && e.matches_stored(&message));
            match unconfirmed {
                Some(entry) => {
                    entry.message_id = Some(message.message_id);
                    entry.status = EntryStatus::Confirmed;
                }
                None => {
                    self.buffer.push(ConversationEntry::from_stored(message));
                    added += 1;
                }
            }
        }
        if added > 0 {
            self.buffer.sort_by_key(|e| e.sent_datetime);
        }
        debug!(chat = %chat_id, added, "History merged");
        added
    }

    pub fn state(&self) -> &ConversationState {
        &self.state
    }

    /// The visible conversation.
    pub fn messages(&self) -> &[ConversationEntry] {
        &self.buffer
    }

    pub fn entry(&self, local_id: LocalId) -> Option<&ConversationEntry> {
        self.buffer.iter().find(|e| e.local_id == Some(local_id))
    }

    /// Users with unseen messages, in the order they were first marked.
    pub fn unread(&self) -> &[UserId] {
        &self.unread
    }

    pub fn is_unread(&self, user: &UserId) -> bool {
        self.unread.contains(user)
    }

    /// The remote user whose state this is, loading or open.
    pub fn selected(&self) -> Option<&UserId> {
        match &self.state {
            ConversationState::Loading { remote, .. } | ConversationState::Ready { remote, .. } => {
                Some(remote)
            }
            ConversationState::NoConversationSelected => None,
        }
    }

    pub fn chat_id(&self) -> Option<&ChatId> {
        match &self.state {
            ConversationState::Ready { chat_id, .. } => Some(chat_id),
            _ => None,
        }
    }

    /// The user whose conversation last failed to load, until the next
    /// selection.
    pub fn unavailable(&self) -> Option<&UserId> {
        self.unavailable.as_ref()
    }
}
