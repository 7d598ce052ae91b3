// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Askbox Contributors

//! Client driver.
//!
//! [`ChatClient`] owns the reconciler and the presence view and is the
//! only thing that mutates them. Network calls run in spawned tasks whose
//! results come back as [`Completion`]s on a channel, so every transition
//! happens on the driver loop one at a time.

use std::sync::Arc;
use std::time::Duration;

use askbox_relay::{ChatId, UserId};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::presence::PresenceView;
use crate::reconciler::{
    ConversationEntry, ConversationReconciler, IngestOutcome, LocalId, PersistRequest,
    ResolutionTicket,
};
use crate::session::{SessionEvent, SessionHandle};
use crate::store::{ChatStore, StoreError, StoredMessage, UserSummary};

/// Input from the front end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    LoadDirectory,
    ListUsers,
    ListOnline,
    ListUnread,
    Select(UserId),
    /// Refetch the open conversation's history
    Refresh,
    Send(String),
    Retry(LocalId),
    Quit,
}

/// Result of a collaborator call, delivered back to the driver loop.
#[derive(Debug)]
pub enum Completion {
    Directory(Result<Vec<UserSummary>, StoreError>),
    Resolved {
        ticket: ResolutionTicket,
        remote: UserId,
        result: Result<(ChatId, Vec<StoredMessage>), StoreError>,
    },
    Persisted {
        local_id: LocalId,
        result: Result<StoredMessage, StoreError>,
    },
    Refreshed {
        chat_id: ChatId,
        result: Result<Vec<StoredMessage>, StoreError>,
    },
}

/// Relay connection state as shown to the user.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Reconnecting { attempt: u32, delay: Duration },
    Disconnected { reason: String },
    Closed,
}

/// Output for the front end.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientNotice {
    Directory(Vec<UserSummary>),
    OnlineUsers(Vec<UserId>),
    UnreadChanged(Vec<UserId>),
    ConversationLoading {
        remote: UserId,
    },
    ConversationReady {
        remote: UserId,
        chat_id: ChatId,
        messages: Vec<ConversationEntry>,
    },
    ConversationUnavailable {
        remote: UserId,
        reason: String,
    },
    MessageAppended(ConversationEntry),
    MessageConfirmed {
        local_id: LocalId,
    },
    MessageFailed {
        local_id: LocalId,
        reason: String,
    },
    PresenceChanged(Vec<UserId>),
    Connection(ConnectionState),
    /// A command could not be carried out
    Rejected(String),
}

pub struct ChatClient {
    local_user: UserId,
    store: Arc<dyn ChatStore>,
    session: SessionHandle,
    reconciler: ConversationReconciler,
    presence: PresenceView,
    directory: Vec<UserSummary>,
    connection: ConnectionState,
    resolution: Option<JoinHandle<()>>,
    completions_tx: mpsc::UnboundedSender<Completion>,
    completions_rx: mpsc::UnboundedReceiver<Completion>,
    notices: mpsc::UnboundedSender<ClientNotice>,
}

impl ChatClient {
    pub fn new(
        local_user: UserId,
        store: Arc<dyn ChatStore>,
        session: SessionHandle,
    ) -> (Self, mpsc::UnboundedReceiver<ClientNotice>) {
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        let (notices, notices_rx) = mpsc::unbounded_channel();

        let client = Self {
            local_user,
            store,
            session,
            reconciler: ConversationReconciler::new(),
            presence: PresenceView::new(),
            directory: Vec::new(),
            connection: ConnectionState::Connecting,
            resolution: None,
            completions_tx,
            completions_rx,
            notices,
        };
        (client, notices_rx)
    }

    fn notify(&self, notice: ClientNotice) {
        let _ = self.notices.send(notice);
    }

    /// Drive the client until `Quit` or the command channel closes.
    pub async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut session_events: mpsc::UnboundedReceiver<SessionEvent>,
    ) {
        info!(user = %self.local_user, "Chat client started");

        loop {
            tokio::select! {
                command = commands.recv() => {
                    let Some(command) = command else { break };
                    if !self.handle_command(command) {
                        break;
                    }
                }
                Some(event) = session_events.recv() => {
                    self.handle_session_event(event);
                }
                Some(completion) = self.completions_rx.recv() => {
                    self.handle_completion(completion);
                }
            }
        }

        if let Some(task) = self.resolution.take() {
            task.abort();
        }
        self.session.shutdown();
        info!("Chat client stopped");
    }

    /// Apply one front-end command. Returns false on `Quit`.
    pub fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::LoadDirectory => self.load_directory(),
            Command::ListUsers => self.notify(ClientNotice::Directory(self.directory.clone())),
            Command::ListOnline => {
                self.notify(ClientNotice::OnlineUsers(self.presence.online_users()))
            }
            Command::ListUnread => {
                self.notify(ClientNotice::UnreadChanged(self.reconciler.unread().to_vec()))
            }
            Command::Select(remote) => {
                self.select(remote);
            }
            Command::Refresh => {
                if !self.refresh() {
                    self.notify(ClientNotice::Rejected("No conversation is open".to_string()));
                }
            }
            Command::Send(text) => self.send(&text),
            Command::Retry(local_id) => self.retry(local_id),
            Command::Quit => return false,
        }
        true
    }

    /// Fetch the user directory in the background.
    pub fn load_directory(&self) {
        let store = Arc::clone(&self.store);
        let tx = self.completions_tx.clone();
        tokio::spawn(async move {
            let result = store.fetch_user_directory().await;
            let _ = tx.send(Completion::Directory(result));
        });
    }

    /// Open the conversation with `remote`, cancelling any resolution
    /// still in flight.
    pub fn select(&mut self, remote: UserId) -> ResolutionTicket {
        if let Some(previous) = self.resolution.take() {
            previous.abort();
        }

        let ticket = self.reconciler.select(remote.clone());
        self.notify(ClientNotice::ConversationLoading {
            remote: remote.clone(),
        });

        let store = Arc::clone(&self.store);
        let local = self.local_user.clone();
        let tx = self.completions_tx.clone();
        self.resolution = Some(tokio::spawn(async move {
            let result = async {
                let chat_id = store.fetch_or_create_chat(&local, &remote).await?;
                let history = store.fetch_messages(&chat_id).await?;
                Ok::<_, StoreError>((chat_id, history))
            }
            .await;
            let _ = tx.send(Completion::Resolved {
                ticket,
                remote,
                result,
            });
        }));

        ticket
    }

    /// Refetch history for the open conversation in the background.
    /// Returns false if no conversation is open.
    pub fn refresh(&self) -> bool {
        let Some(chat_id) = self.reconciler.chat_id().cloned() else {
            return false;
        };
        let store = Arc::clone(&self.store);
        let tx = self.completions_tx.clone();
        tokio::spawn(async move {
            let result = store.fetch_messages(&chat_id).await;
            let _ = tx.send(Completion::Refreshed { chat_id, result });
        });
        true
    }

    /// Send `text` to the open conversation: optimistic entry first, then
    /// the relay and the persistence write in parallel.
    pub fn send(&mut self, text: &str) {
        let outbound = match self.reconciler.compose(&self.local_user, text) {
            Ok(outbound) => outbound,
            Err(e) => {
                self.notify(ClientNotice::Rejected(e.to_string()));
                return;
            }
        };

        if let Some(entry) = self.reconciler.entry(outbound.persist.local_id) {
            self.notify(ClientNotice::MessageAppended(entry.clone()));
        }

        if let Err(e) = self.session.send(outbound.relay) {
            warn!(error = %e, "Relay session unavailable, message not relayed");
        }
        self.persist(outbound.persist);
    }

    /// Retry the persistence write of a failed message.
    pub fn retry(&mut self, local_id: LocalId) {
        match self.reconciler.retry_failed(local_id) {
            Some(request) => {
                debug!(%local_id, "Retrying message persistence");
                self.persist(request);
            }
            None => self.notify(ClientNotice::Rejected(format!(
                "No failed message with id {local_id}"
            ))),
        }
    }

    fn persist(&self, request: PersistRequest) {
        let store = Arc::clone(&self.store);
        let tx = self.completions_tx.clone();
        tokio::spawn(async move {
            let result = store
                .persist_message(&request.chat_id, &request.sender_id, &request.text)
                .await;
            let _ = tx.send(Completion::Persisted {
                local_id: request.local_id,
                result,
            });
        });
    }

    pub fn handle_session_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Connected => {
                self.presence.reset();
                self.set_connection(ConnectionState::Connected);
                // Pushes sent while we were away are only in the history.
                if self.refresh() {
                    debug!("Refetching open conversation after connect");
                }
            }
            SessionEvent::Disconnected { reason } => {
                self.set_connection(ConnectionState::Disconnected { reason });
            }
            SessionEvent::RetryScheduled { attempt, delay } => {
                self.set_connection(ConnectionState::Reconnecting { attempt, delay });
            }
            SessionEvent::Closed => self.set_connection(ConnectionState::Closed),
            SessionEvent::Presence(update) => {
                if self.presence.apply(update) {
                    self.notify(ClientNotice::PresenceChanged(self.presence.online_users()));
                }
            }
            SessionEvent::Delivered(delivery) => match self.reconciler.ingest(delivery) {
                IngestOutcome::Appended => {
                    if let Some(entry) = self.reconciler.messages().last() {
                        self.notify(ClientNotice::MessageAppended(entry.clone()));
                    }
                }
                IngestOutcome::Held => debug!("Push held until the conversation loads"),
                IngestOutcome::MarkedUnread { added } => {
                    if added {
                        self.notify(ClientNotice::UnreadChanged(
                            self.reconciler.unread().to_vec(),
                        ));
                    }
                }
            },
        }
    }

    fn set_connection(&mut self, state: ConnectionState) {
        self.connection = state.clone();
        self.notify(ClientNotice::Connection(state));
    }

    pub fn handle_completion(&mut self, completion: Completion) {
        match completion {
            Completion::Directory(Ok(users)) => {
                debug!(count = users.len(), "User directory loaded");
                self.directory = users;
                self.notify(ClientNotice::Directory(self.directory.clone()));
            }
            Completion::Directory(Err(e)) => {
                warn!(error = %e, "Failed to load user directory");
                self.directory.clear();
                self.notify(ClientNotice::Directory(Vec::new()));
            }
            Completion::Resolved {
                ticket,
                remote,
                result,
            } => self.resolved(ticket, remote, result),
            Completion::Persisted {
                local_id,
                result: Ok(stored),
            } => {
                if self.reconciler.persist_succeeded(local_id, stored) {
                    self.notify(ClientNotice::MessageConfirmed { local_id });
                }
            }
            Completion::Refreshed { chat_id, result } => self.refreshed(chat_id, result),
            Completion::Persisted {
                local_id,
                result: Err(e),
            } => {
                warn!(%local_id, error = %e, "Failed to persist message");
                let reason = e.to_string();
                if self.reconciler.persist_failed(local_id, reason.clone()) {
                    self.notify(ClientNotice::MessageFailed { local_id, reason });
                }
            }
        }
    }

    fn resolved(
        &mut self,
        ticket: ResolutionTicket,
        remote: UserId,
        result: Result<(ChatId, Vec<StoredMessage>), StoreError>,
    ) {
        match result {
            Ok((chat_id, history)) => {
                if self
                    .reconciler
                    .resolution_succeeded(ticket, chat_id.clone(), history)
                {
                    self.resolution = None;
                    let unread = self.reconciler.unread().to_vec();
                    self.notify(ClientNotice::ConversationReady {
                        remote,
                        chat_id,
                        messages: self.reconciler.messages().to_vec(),
                    });
                    if !unread.is_empty() {
                        self.notify(ClientNotice::UnreadChanged(unread));
                    }
                }
            }
            Err(e) => {
                warn!(remote = %remote, error = %e, "Failed to open conversation");
                if self.reconciler.resolution_failed(ticket, &e.to_string()) {
                    self.resolution = None;
                    self.notify(ClientNotice::ConversationUnavailable {
                        remote,
                        reason: e.to_string(),
                    });
                }
            }
        }
    }

    fn refreshed(&mut self, chat_id: ChatId, result: Result<Vec<StoredMessage>, StoreError>) {
        if self.reconciler.chat_id() != Some(&chat_id) {
            debug!(chat = %chat_id, "Ignoring refresh for a conversation no longer open");
            return;
        }
        match result {
            Ok(history) => {
                if self.reconciler.merge_history(history) == 0 {
                    return;
                }
                if let Some(remote) = self.reconciler.selected().cloned() {
                    self.notify(ClientNotice::ConversationReady {
                        remote,
                        chat_id,
                        messages: self.reconciler.messages().to_vec(),
                    });
                }
            }
            Err(e) => {
                warn!(chat = %chat_id, error = %e, "Failed to refresh conversation");
                self.notify(ClientNotice::Rejected(format!("Could not refresh: {e}")));
            }
        }
    }

    /// Wait for the next collaborator completion.
    pub async fn next_completion(&mut self) -> Option<Completion> {
        self.completions_rx.recv().await
    }

    pub fn local_user(&self) -> &UserId {
        &self.local_user
    }

    pub fn reconciler(&self) -> &ConversationReconciler {
        &self.reconciler
    }

    pub fn presence(&self) -> &PresenceView {
        &self.presence
    }

    pub fn directory(&self) -> &[UserSummary] {
        &self.directory
    }

    pub fn connection_state(&self) -> &ConnectionState {
        &self.connection
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presence::PresenceUpdate;
    use crate::reconciler::{ConversationState, EntryStatus};
    use crate::session::SessionCommand;
    use crate::store::MemoryChatStore;
    use askbox_relay::{ConnectionEntry, ConnectionId, Delivery, PresenceChange};

    fn user(id: &str) -> UserId {
        UserId::new(id).unwrap()
    }

    struct Harness {
        client: ChatClient,
        store: Arc<MemoryChatStore>,
        commands: mpsc::UnboundedReceiver<SessionCommand>,
        notices: mpsc::UnboundedReceiver<ClientNotice>,
    }

    fn harness() -> Harness {
        let store = Arc::new(MemoryChatStore::with_users(vec![
            UserSummary {
                id: user("bob"),
                name: Some("Bob".into()),
            },
            UserSummary {
                id: user("carol"),
                name: None,
            },
        ]));
        let (session, commands) = SessionHandle::pair();
        let (client, notices) = ChatClient::new(user("alice"), store.clone(), session);
        Harness {
            client,
            store,
            commands,
            notices,
        }
    }

    impl Harness {
        async fn complete(&mut self) {
            let completion = tokio::time::timeout(Duration::from_secs(5), self.client.next_completion())
                .await
                .expect("timed out waiting for completion")
                .expect("completion channel closed");
            self.client.handle_completion(completion);
        }

        fn drain_notices(&mut self) -> Vec<ClientNotice> {
            let mut out = Vec::new();
            while let Ok(notice) = self.notices.try_recv() {
                out.push(notice);
            }
            out
        }

        async fn open(&mut self, remote: &str) -> ChatId {
            self.client.select(user(remote));
            self.complete().await;
            self.client.reconciler().chat_id().cloned().unwrap()
        }
    }

    #[tokio::test]
    async fn test_select_loads_history() {
        let mut h = harness();
        let chat = h.store.chat_between(&user("alice"), &user("bob"));
        h.store.insert_message(&chat, &user("bob"), "earlier");

        h.client.select(user("bob"));
        h.complete().await;

        assert_eq!(
            h.client.reconciler().state(),
            &ConversationState::Ready {
                remote: user("bob"),
                chat_id: chat.clone()
            }
        );
        let notices = h.drain_notices();
        assert!(matches!(
            &notices[0],
            ClientNotice::ConversationLoading { remote } if remote == &user("bob")
        ));
        assert!(matches!(
            &notices[1],
            ClientNotice::ConversationReady { messages, .. } if messages.len() == 1
        ));
    }

    #[tokio::test]
    async fn test_latest_selection_wins() {
        let mut h = harness();
        h.store.set_latency(user("dave"), Duration::from_millis(200));

        h.client.select(user("dave"));
        h.client.select(user("erin"));
        h.complete().await;

        assert_eq!(h.client.reconciler().selected(), Some(&user("erin")));
        assert!(matches!(
            h.client.reconciler().state(),
            ConversationState::Ready { .. }
        ));

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(h.client.completions_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_stale_completion_is_ignored() {
        let mut h = harness();
        h.store.set_latency(user("dave"), Duration::from_millis(200));
        let stale = h.client.select(user("dave"));
        h.open("erin").await;
        h.drain_notices();

        h.client.handle_completion(Completion::Resolved {
            ticket: stale,
            remote: user("dave"),
            result: Ok((ChatId::new("dave-chat"), vec![])),
        });

        assert_eq!(h.client.reconciler().selected(), Some(&user("erin")));
        assert!(h.drain_notices().is_empty());
    }

    #[tokio::test]
    async fn test_resolution_failure_reports_unavailable() {
        let mut h = harness();
        h.store.set_fail_resolve(true);

        h.client.select(user("bob"));
        h.complete().await;

        assert_eq!(
            h.client.reconciler().state(),
            &ConversationState::NoConversationSelected
        );
        assert!(h.drain_notices().iter().any(|n| matches!(
            n,
            ClientNotice::ConversationUnavailable { remote, .. } if remote == &user("bob")
        )));
    }

    #[tokio::test]
    async fn test_send_relays_and_persists() {
        let mut h = harness();
        let chat = h.open("bob").await;

        h.client.send("hello");

        let entry = &h.client.reconciler().messages()[0];
        assert_eq!(entry.status, EntryStatus::Pending);
        match h.commands.try_recv().unwrap() {
            SessionCommand::Send(msg) => {
                assert_eq!(msg.receiver_id, user("bob"));
                assert_eq!(msg.chat_id, chat);
                assert_eq!(msg.text, "hello");
            }
            other => panic!("unexpected command {other:?}"),
        }

        h.complete().await;
        assert_eq!(
            h.client.reconciler().messages()[0].status,
            EntryStatus::Confirmed
        );
        assert_eq!(h.store.messages(&chat).len(), 1);
    }

    #[tokio::test]
    async fn test_failed_persist_can_be_retried() {
        let mut h = harness();
        let chat = h.open("bob").await;
        h.store.set_fail_persist(true);

        h.client.send("hello");
        h.complete().await;

        let local_id = h.client.reconciler().messages()[0].local_id.unwrap();
        assert!(h.client.reconciler().messages()[0].is_failed());
        assert!(h
            .drain_notices()
            .iter()
            .any(|n| matches!(n, ClientNotice::MessageFailed { .. })));

        h.store.set_fail_persist(false);
        h.client.retry(local_id);
        assert!(h.client.reconciler().messages()[0].is_pending());
        h.complete().await;

        assert_eq!(
            h.client.reconciler().messages()[0].status,
            EntryStatus::Confirmed
        );
        assert_eq!(h.store.messages(&chat).len(), 1);

        assert!(h.commands.try_recv().is_ok());
        assert!(h.commands.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_send_without_conversation_is_rejected() {
        let mut h = harness();
        h.client.send("hello");

        assert!(matches!(
            h.drain_notices().as_slice(),
            [ClientNotice::Rejected(_)]
        ));
        assert!(h.commands.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_push_for_other_chat_marks_unread() {
        let mut h = harness();
        let chat = h.open("bob").await;
        h.drain_notices();

        h.client
            .handle_session_event(SessionEvent::Delivered(Delivery {
                sender_id: user("carol"),
                text: "hey".into(),
                chat_id: ChatId::new("carol-chat"),
            }));
        h.client
            .handle_session_event(SessionEvent::Delivered(Delivery {
                sender_id: user("bob"),
                text: "yo".into(),
                chat_id: chat,
            }));

        let notices = h.drain_notices();
        assert_eq!(
            notices[0],
            ClientNotice::UnreadChanged(vec![user("carol")])
        );
        assert!(matches!(&notices[1], ClientNotice::MessageAppended(e) if e.message_text == "yo"));
        assert_eq!(h.client.reconciler().messages().len(), 1);
    }

    #[tokio::test]
    async fn test_refresh_merges_missed_messages_once() {
        let mut h = harness();
        let chat = h.open("bob").await;
        h.client
            .handle_session_event(SessionEvent::Delivered(Delivery {
                sender_id: user("bob"),
                text: "pushed".into(),
                chat_id: chat.clone(),
            }));
        h.store.insert_message(&chat, &user("bob"), "pushed");
        h.store.insert_message(&chat, &user("bob"), "missed");
        h.drain_notices();

        h.client.handle_command(Command::Refresh);
        h.complete().await;

        let texts: Vec<_> = h
            .client
            .reconciler()
            .messages()
            .iter()
            .map(|e| e.message_text.as_str())
            .collect();
        assert_eq!(texts, vec!["pushed", "missed"]);
        assert!(matches!(
            h.drain_notices().as_slice(),
            [ClientNotice::ConversationReady { messages, .. }] if messages.len() == 2
        ));
    }

    #[tokio::test]
    async fn test_reconnect_refetches_open_conversation() {
        let mut h = harness();
        let chat = h.open("bob").await;
        h.store.insert_message(&chat, &user("bob"), "while offline");

        h.client.handle_session_event(SessionEvent::Connected);
        h.complete().await;

        assert_eq!(h.client.reconciler().messages().len(), 1);
        assert_eq!(
            h.client.reconciler().messages()[0].message_text,
            "while offline"
        );
    }

    #[tokio::test]
    async fn test_refresh_without_conversation_is_rejected() {
        let mut h = harness();
        assert!(h.client.handle_command(Command::Refresh));
        assert!(matches!(
            h.drain_notices().as_slice(),
            [ClientNotice::Rejected(_)]
        ));
    }

    #[tokio::test]
    async fn test_directory_failure_yields_empty_list() {
        let mut h = harness();
        h.store.set_fail_directory(true);

        h.client.load_directory();
        h.complete().await;

        assert!(h.client.directory().is_empty());
        assert_eq!(h.drain_notices(), vec![ClientNotice::Directory(vec![])]);
    }

    #[tokio::test]
    async fn test_directory_loads() {
        let mut h = harness();
        h.client.load_directory();
        h.complete().await;
        assert_eq!(h.client.directory().len(), 2);
    }

    #[tokio::test]
    async fn test_presence_resets_on_reconnect() {
        let mut h = harness();
        let entry = ConnectionEntry::new(user("bob"), ConnectionId::from("c1"));

        h.client.handle_session_event(SessionEvent::Connected);
        h.client
            .handle_session_event(SessionEvent::Presence(PresenceUpdate::Snapshot {
                revision: 4,
                users: vec![entry.clone()],
            }));
        assert!(h.client.presence().is_online(&user("bob")));

        h.client.handle_session_event(SessionEvent::Disconnected {
            reason: "gone".into(),
        });
        h.client.handle_session_event(SessionEvent::Connected);
        h.client
            .handle_session_event(SessionEvent::Presence(PresenceUpdate::Snapshot {
                revision: 0,
                users: vec![],
            }));
        h.client
            .handle_session_event(SessionEvent::Presence(PresenceUpdate::Delta {
                revision: 1,
                changes: vec![PresenceChange::Joined(entry)],
            }));

        assert!(h.client.presence().is_online(&user("bob")));
        assert_eq!(h.client.presence().revision(), Some(1));
        assert_eq!(h.client.connection_state(), &ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_run_loop_processes_commands() {
        let h = harness();
        let store = h.store.clone();
        let mut notices = h.notices;
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (_event_tx, event_rx) = mpsc::unbounded_channel();

        let task = tokio::spawn(h.client.run(command_rx, event_rx));

        command_tx.send(Command::Select(user("bob"))).unwrap();
        loop {
            let notice = tokio::time::timeout(Duration::from_secs(5), notices.recv())
                .await
                .unwrap()
                .unwrap();
            if matches!(notice, ClientNotice::ConversationReady { .. }) {
                break;
            }
        }

        command_tx.send(Command::Send("from the loop".into())).unwrap();
        loop {
            let notice = tokio::time::timeout(Duration::from_secs(5), notices.recv())
                .await
                .unwrap()
                .unwrap();
            if matches!(notice, ClientNotice::MessageConfirmed { .. }) {
                break;
            }
        }

        command_tx.send(Command::Quit).unwrap();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();

        let chat = store.chat_between(&user("alice"), &user("bob"));
        assert_eq!(store.messages(&chat)[0].message_text, "from the loop");
    }
}
