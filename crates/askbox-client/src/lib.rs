// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Askbox Contributors

//! Askbox chat client.
//!
//! - [`session`]: the relay WebSocket session with reconnect and identity
//!   announcement
//! - [`store`]: the persistence API used for chats, history and users
//! - [`reconciler`]: merges history, optimistic sends and relay pushes
//!   into the visible conversation
//! - [`app`]: the driver loop tying them together

pub mod app;
pub mod config;
pub mod console;
pub mod presence;
pub mod reconciler;
pub mod session;
pub mod store;

pub use app::{ChatClient, ClientNotice, Command, Completion, ConnectionState};
pub use config::{ClientConfig, ConfigError};
pub use presence::{PresenceUpdate, PresenceView};
pub use reconciler::{
    ComposeError, ConversationEntry, ConversationReconciler, ConversationState, EntryStatus,
    IngestOutcome, LocalId, OutboundMessage, PersistRequest, ResolutionTicket,
};
pub use session::{
    RetryState, SessionBinder, SessionCommand, SessionConfig, SessionError, SessionEvent,
    SessionHandle,
};
pub use store::{ChatStore, HttpChatStore, MemoryChatStore, StoreError, StoredMessage, UserSummary};
