// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Askbox Contributors

//! Chat persistence collaborator.
//!
//! The relay never stores anything. Chats, message history and the user
//! directory live behind an HTTP API, reached through [`ChatStore`]:
//!
//! | Operation              | Request                               |
//! |------------------------|---------------------------------------|
//! | `fetch_or_create_chat` | `POST /api/chats/private`             |
//! | `fetch_messages`       | `GET /api/chats/{chat_id}/messages`   |
//! | `persist_message`      | `POST /api/messages`                  |
//! | `fetch_user_directory` | `GET /api/users`                      |

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use askbox_relay::{ChatId, UserId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, instrument};

/// Persistence errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Transport-level failure talking to the API
    #[error("Request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The API answered with a non-success status
    #[error("API returned {status}: {body}")]
    Status { status: u16, body: String },

    /// The requested resource does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// The store refused or could not complete the operation
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid API URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("Unsupported API URL scheme: {0}")]
    UnsupportedScheme(String),
}

impl StoreError {
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }
}

/// A persisted chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredMessage {
    #[serde(alias = "_id")]
    pub message_id: String,
    pub chat_id: ChatId,
    pub user_id: UserId,
    pub message_text: String,
    pub sent_datetime: DateTime<Utc>,
}

/// A user directory entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSummary {
    #[serde(alias = "_id")]
    pub id: UserId,
    #[serde(default)]
    pub name: Option<String>,
}

impl UserSummary {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(self.id.as_str())
    }
}

/// Request/response contracts of the persistence collaborator.
#[async_trait]
pub trait ChatStore: Send + Sync {
    /// Resolve the private chat between two users, creating it if needed.
    async fn fetch_or_create_chat(&self, local: &UserId, remote: &UserId)
        -> Result<ChatId, StoreError>;

    /// Message history of a chat.
    async fn fetch_messages(&self, chat_id: &ChatId) -> Result<Vec<StoredMessage>, StoreError>;

    /// Durably store a message.
    async fn persist_message(
        &self,
        chat_id: &ChatId,
        sender_id: &UserId,
        text: &str,
    ) -> Result<StoredMessage, StoreError>;

    /// Users to offer as conversation partners.
    async fn fetch_user_directory(&self) -> Result<Vec<UserSummary>, StoreError>;
}

#[derive(Debug, Serialize)]
struct PrivateChatRequest<'a> {
    user_id: &'a UserId,
    other_user_id: &'a UserId,
}

#[derive(Debug, Deserialize)]
struct PrivateChatResponse {
    #[serde(alias = "_id")]
    chat_id: ChatId,
}

#[derive(Debug, Serialize)]
struct PersistMessageRequest<'a> {
    chat_id: &'a ChatId,
    user_id: &'a UserId,
    message_text: &'a str,
}

/// [`ChatStore`] backed by the Askbox HTTP API.
pub struct HttpChatStore {
    client: reqwest::Client,
    base_url: url::Url,
    token: Option<String>,
}

impl HttpChatStore {
    /// Create a new API client
    pub fn new(base_url: &str, token: Option<String>) -> Result<Self, StoreError> {
        let parsed = url::Url::parse(base_url)?;
        if !matches!(parsed.scheme(), "http" | "https") || parsed.cannot_be_a_base() {
            return Err(StoreError::UnsupportedScheme(parsed.scheme().to_string()));
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            base_url: parsed,
            token,
        })
    }

    /// Base URL extended by `segments`, each percent-encoded as one path
    /// segment.
    fn endpoint(&self, segments: &[&str]) -> url::Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn request(&self, method: reqwest::Method, segments: &[&str]) -> reqwest::RequestBuilder {
        let builder = self.client.request(method, self.endpoint(segments));
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn send_json<T: serde::de::DeserializeOwned>(
        &self,
        builder: reqwest::RequestBuilder,
        what: &str,
    ) -> Result<T, StoreError> {
        let response = builder.send().await?;
        let status = response.status();

        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(StoreError::NotFound(what.to_string()));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StoreError::Status {
                status: status.as_u16(),
                body,
            });
        }

        Ok(response.json().await?)
    }
}

#[async_trait]
impl ChatStore for HttpChatStore {
    #[instrument(skip_all, fields(local = %local, remote = %remote))]
    async fn fetch_or_create_chat(
        &self,
        local: &UserId,
        remote: &UserId,
    ) -> Result<ChatId, StoreError> {
        let request = self
            .request(reqwest::Method::POST, &["api", "chats", "private"])
            .json(&PrivateChatRequest {
                user_id: local,
                other_user_id: remote,
            });
        let response: PrivateChatResponse = self.send_json(request, "private chat").await?;
        debug!(chat = %response.chat_id, "Resolved private chat");
        Ok(response.chat_id)
    }

    #[instrument(skip_all, fields(chat = %chat_id))]
    async fn fetch_messages(&self, chat_id: &ChatId) -> Result<Vec<StoredMessage>, StoreError> {
        let request = self.request(
            reqwest::Method::GET,
            &["api", "chats", chat_id.as_str(), "messages"],
        );
        self.send_json(request, "chat").await
    }

    #[instrument(skip_all, fields(chat = %chat_id, sender = %sender_id))]
    async fn persist_message(
        &self,
        chat_id: &ChatId,
        sender_id: &UserId,
        text: &str,
    ) -> Result<StoredMessage, StoreError> {
        let request = self
            .request(reqwest::Method::POST, &["api", "messages"])
            .json(&PersistMessageRequest {
                chat_id,
                user_id: sender_id,
                message_text: text,
            });
        self.send_json(request, "chat").await
    }

    async fn fetch_user_directory(&self) -> Result<Vec<UserSummary>, StoreError> {
        let request = self.request(reqwest::Method::GET, &["api", "users"]);
        self.send_json(request, "users").await
    }
}

impl std::fmt::Debug for HttpChatStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpChatStore")
            .field("base_url", &self.base_url.as_str())
            .field("authenticated", &self.token.is_some())
            .finish()
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    users: Vec<UserSummary>,
    chats: HashMap<(UserId, UserId), ChatId>,
    messages: HashMap<ChatId, Vec<StoredMessage>>,
    latency: HashMap<UserId, Duration>,
    fail_resolve: bool,
    fail_persist: bool,
    fail_directory: bool,
}

/// In-process [`ChatStore`] for tests and offline runs.
#[derive(Debug, Default)]
pub struct MemoryChatStore {
    state: Mutex<MemoryState>,
}

impl MemoryChatStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store with a preloaded user directory.
    pub fn with_users(users: impl IntoIterator<Item = UserSummary>) -> Self {
        let store = Self::new();
        store.lock().users = users.into_iter().collect();
        store
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn chat_key(a: &UserId, b: &UserId) -> (UserId, UserId) {
        if a <= b {
            (a.clone(), b.clone())
        } else {
            (b.clone(), a.clone())
        }
    }

    /// Delay chat resolution with `remote` by `latency`.
    pub fn set_latency(&self, remote: UserId, latency: Duration) {
        self.lock().latency.insert(remote, latency);
    }

    pub fn set_fail_resolve(&self, fail: bool) {
        self.lock().fail_resolve = fail;
    }

    pub fn set_fail_persist(&self, fail: bool) {
        self.lock().fail_persist = fail;
    }

    pub fn set_fail_directory(&self, fail: bool) {
        self.lock().fail_directory = fail;
    }

    /// Every message stored for a chat, in storage order.
    pub fn messages(&self, chat_id: &ChatId) -> Vec<StoredMessage> {
        self.lock().messages.get(chat_id).cloned().unwrap_or_default()
    }

    /// Store a message directly, bypassing failure injection.
    pub fn insert_message(&self, chat_id: &ChatId, sender_id: &UserId, text: &str) -> StoredMessage {
        let message = StoredMessage {
            message_id: uuid::Uuid::new_v4().to_string(),
            chat_id: chat_id.clone(),
            user_id: sender_id.clone(),
            message_text: text.to_string(),
            sent_datetime: Utc::now(),
        };
        self.lock()
            .messages
            .entry(chat_id.clone())
            .or_default()
            .push(message.clone());
        message
    }

    /// Resolve a chat without latency or failure injection.
    pub fn chat_between(&self, a: &UserId, b: &UserId) -> ChatId {
        let mut state = self.lock();
        state
            .chats
            .entry(Self::chat_key(a, b))
            .or_insert_with(|| ChatId::new(uuid::Uuid::new_v4().to_string()))
            .clone()
    }
}

#[async_trait]
impl ChatStore for MemoryChatStore {
    async fn fetch_or_create_chat(
        &self,
        local: &UserId,
        remote: &UserId,
    ) -> Result<ChatId, StoreError> {
        let (latency, fail) = {
            let state = self.lock();
            (state.latency.get(remote).copied(), state.fail_resolve)
        };
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if fail {
            return Err(StoreError::unavailable("chat resolution disabled"));
        }
        Ok(self.chat_between(local, remote))
    }

    async fn fetch_messages(&self, chat_id: &ChatId) -> Result<Vec<StoredMessage>, StoreError> {
        Ok(self.messages(chat_id))
    }

    async fn persist_message(
        &self,
        chat_id: &ChatId,
        sender_id: &UserId,
        text: &str,
    ) -> Result<StoredMessage, StoreError> {
        if self.lock().fail_persist {
            return Err(StoreError::unavailable("message persistence disabled"));
        }
        Ok(self.insert_message(chat_id, sender_id, text))
    }

    async fn fetch_user_directory(&self) -> Result<Vec<UserSummary>, StoreError> {
        let state = self.lock();
        if state.fail_directory {
            return Err(StoreError::unavailable("user directory disabled"));
        }
        Ok(state.users.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn user(id: &str) -> UserId {
        UserId::new(id).unwrap()
    }

    #[test]
    fn test_http_store_rejects_bad_urls() {
        assert!(matches!(
            HttpChatStore::new("not a url", None),
            Err(StoreError::InvalidUrl(_))
        ));
        assert!(matches!(
            HttpChatStore::new("ws://localhost:3000", None),
            Err(StoreError::UnsupportedScheme(s)) if s == "ws"
        ));
        assert!(HttpChatStore::new("https://api.example/", None).is_ok());
    }

    #[tokio::test]
    async fn test_http_fetch_or_create_chat() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chats/private"))
            .and(header("authorization", "Bearer token-1"))
            .and(body_json(serde_json::json!({
                "user_id": "alice",
                "other_user_id": "bob"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "chat_id": "chat-42"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let store = HttpChatStore::new(&server.uri(), Some("token-1".into())).unwrap();
        let chat = store
            .fetch_or_create_chat(&user("alice"), &user("bob"))
            .await
            .unwrap();

        assert_eq!(chat, ChatId::new("chat-42"));
    }

    #[tokio::test]
    async fn test_http_fetch_messages() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/chats/chat-42/messages"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                {
                    "_id": "m1",
                    "chat_id": "chat-42",
                    "user_id": "bob",
                    "message_text": "hello",
                    "sent_datetime": "2026-01-02T03:04:05Z"
                }
            ])))
            .mount(&server)
            .await;

        let store = HttpChatStore::new(&server.uri(), None).unwrap();
        let messages = store.fetch_messages(&ChatId::new("chat-42")).await.unwrap();

        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].message_id, "m1");
        assert_eq!(messages[0].user_id, user("bob"));
        assert_eq!(messages[0].message_text, "hello");
    }

    #[tokio::test]
    async fn test_http_chat_id_is_one_path_segment() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/prefix/api/chats/a%2Fb%3Fc%23d/messages"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([])))
            .expect(1)
            .mount(&server)
            .await;

        let store = HttpChatStore::new(&format!("{}/prefix/", server.uri()), None).unwrap();
        let messages = store.fetch_messages(&ChatId::new("a/b?c#d")).await.unwrap();

        assert!(messages.is_empty());
    }

    #[tokio::test]
    async fn test_http_directory_with_blank_user_id_is_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/users"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!([{ "id": "" }])),
            )
            .mount(&server)
            .await;

        let store = HttpChatStore::new(&server.uri(), None).unwrap();
        assert!(store.fetch_user_directory().await.is_err());
    }

    #[tokio::test]
    async fn test_http_persist_message_failure_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/messages"))
            .respond_with(ResponseTemplate::new(500).set_body_string("database down"))
            .mount(&server)
            .await;

        let store = HttpChatStore::new(&server.uri(), None).unwrap();
        let err = store
            .persist_message(&ChatId::new("chat-42"), &user("alice"), "hi")
            .await
            .unwrap_err();

        match err {
            StoreError::Status { status, body } => {
                assert_eq!(status, 500);
                assert_eq!(body, "database down");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_http_missing_chat_is_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/chats/nope/messages"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let store = HttpChatStore::new(&server.uri(), None).unwrap();
        let err = store.fetch_messages(&ChatId::new("nope")).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_http_user_directory() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/users"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                { "_id": "alice", "name": "Alice" },
                { "id": "bob" }
            ])))
            .mount(&server)
            .await;

        let store = HttpChatStore::new(&format!("{}/", server.uri()), None).unwrap();
        let users = store.fetch_user_directory().await.unwrap();

        assert_eq!(users.len(), 2);
        assert_eq!(users[0].display_name(), "Alice");
        assert_eq!(users[1].display_name(), "bob");
    }

    #[tokio::test]
    async fn test_memory_chat_is_shared_by_both_users() {
        let store = MemoryChatStore::new();
        let ab = store.fetch_or_create_chat(&user("a"), &user("b")).await.unwrap();
        let ba = store.fetch_or_create_chat(&user("b"), &user("a")).await.unwrap();
        let ac = store.fetch_or_create_chat(&user("a"), &user("c")).await.unwrap();

        assert_eq!(ab, ba);
        assert_ne!(ab, ac);
    }

    #[tokio::test]
    async fn test_memory_persist_and_fetch() {
        let store = MemoryChatStore::new();
        let chat = store.chat_between(&user("a"), &user("b"));

        let stored = store.persist_message(&chat, &user("a"), "hi").await.unwrap();
        let history = store.fetch_messages(&chat).await.unwrap();

        assert_eq!(history, vec![stored]);
    }

    #[tokio::test]
    async fn test_memory_failure_injection() {
        let store = MemoryChatStore::new();
        store.set_fail_persist(true);
        store.set_fail_resolve(true);
        store.set_fail_directory(true);

        let chat = ChatId::new("x");
        assert!(store.persist_message(&chat, &user("a"), "hi").await.is_err());
        assert!(store.fetch_or_create_chat(&user("a"), &user("b")).await.is_err());
        assert!(store.fetch_user_directory().await.is_err());
        assert!(store.messages(&chat).is_empty());
    }
}
