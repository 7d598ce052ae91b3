//! Identifier types shared by the relay and its clients.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::RelayError;

/// Stable identifier of a user, as issued by the identity provider.
///
/// The relay treats it as opaque; it only has to be non-empty. That holds
/// for deserialized ids too.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct UserId(String);

impl UserId {
    /// Create a user id, rejecting empty or whitespace-only values.
    pub fn new(id: impl Into<String>) -> Result<Self, RelayError> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(RelayError::invalid_frame("user id must not be empty"));
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for UserId {
    type Error = RelayError;

    fn try_from(id: String) -> Result<Self, Self::Error> {
        Self::new(id)
    }
}

impl From<UserId> for String {
    fn from(id: UserId) -> Self {
        id.0
    }
}

impl std::str::FromStr for UserId {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// Identifier the server assigns to each accepted transport connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Generate a fresh random connection id.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of a persisted chat between two users.
///
/// Chat ids are issued by the persistence service; the relay passes them
/// through untouched.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChatId(String);

impl ChatId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChatId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A single `user_id -> connection_id` mapping held by the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionEntry {
    pub user_id: UserId,
    pub connection_id: ConnectionId,
}

impl ConnectionEntry {
    pub fn new(user_id: UserId, connection_id: ConnectionId) -> Self {
        Self {
            user_id,
            connection_id,
        }
    }
}

/// A chat message in transit between two users.
///
/// Relay messages are never persisted by the relay and carry no timestamp;
/// the receiving client stamps them on arrival.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayMessage {
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub text: String,
    pub chat_id: ChatId,
}
