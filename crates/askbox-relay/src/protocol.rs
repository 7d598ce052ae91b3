//! Wire protocol for the relay WebSocket.
//!
//! Every frame is a JSON text message of the form
//! `{"event": "<name>", "data": { ... }}`.
//!
//! ```text
//! client -> server   register        { user_id }
//! client -> server   send            { sender_id, receiver_id, text, chat_id }
//! server -> client   presence        { revision, users: [{ user_id, connection_id }] }
//! server -> client   presence_delta  { revision, changes: [{ kind, entry }] }
//! server -> client   deliver         { sender_id, text, chat_id }
//! ```

use serde::{Deserialize, Serialize};

use crate::error::RelayError;
use crate::types::{ChatId, ConnectionEntry, RelayMessage, UserId};

/// Frames sent by clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Announce the identity behind this connection.
    Register { user_id: UserId },
    /// Relay a chat message to another user.
    Send(RelayMessage),
}

impl ClientFrame {
    /// Decode a client frame. Blank user ids are rejected while decoding.
    pub fn parse(text: &str) -> Result<Self, RelayError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Encode the frame as JSON text.
    pub fn to_text(&self) -> Result<String, RelayError> {
        Ok(serde_json::to_string(self)?)
    }

}

/// A single presence change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "entry", rename_all = "snake_case")]
pub enum PresenceChange {
    Joined(ConnectionEntry),
    Left(ConnectionEntry),
}

/// Payload of a `deliver` frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delivery {
    pub sender_id: UserId,
    pub text: String,
    pub chat_id: ChatId,
}

impl From<RelayMessage> for Delivery {
    fn from(msg: RelayMessage) -> Self {
        Self {
            sender_id: msg.sender_id,
            text: msg.text,
            chat_id: msg.chat_id,
        }
    }
}

/// Frames sent by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerFrame {
    /// Full registry snapshot.
    Presence {
        revision: u64,
        users: Vec<ConnectionEntry>,
    },
    /// Incremental registry change; one frame per registry revision.
    PresenceDelta {
        revision: u64,
        changes: Vec<PresenceChange>,
    },
    /// A relayed chat message.
    Deliver(Delivery),
}

impl ServerFrame {
    /// Decode a server frame.
    pub fn parse(text: &str) -> Result<Self, RelayError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Encode the frame as JSON text.
    pub fn to_text(&self) -> Result<String, RelayError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Short name used in log fields.
    pub fn event_name(&self) -> &'static str {
        match self {
            ServerFrame::Presence { .. } => "presence",
            ServerFrame::PresenceDelta { .. } => "presence_delta",
            ServerFrame::Deliver(_) => "deliver",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ConnectionId;

    #[test]
    fn test_parse_register() {
        let frame = ClientFrame::parse(r#"{"event":"register","data":{"user_id":"alice"}}"#).unwrap();
        assert_eq!(
            frame,
            ClientFrame::Register {
                user_id: UserId::new("alice").unwrap()
            }
        );
    }

    #[test]
    fn test_parse_send() {
        let frame = ClientFrame::parse(
            r#"{"event":"send","data":{"sender_id":"a","receiver_id":"b","text":"hi","chat_id":"x"}}"#,
        )
        .unwrap();
        match frame {
            ClientFrame::Send(msg) => {
                assert_eq!(msg.sender_id.as_str(), "a");
                assert_eq!(msg.receiver_id.as_str(), "b");
                assert_eq!(msg.text, "hi");
                assert_eq!(msg.chat_id.as_str(), "x");
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn test_parse_rejects_empty_user_id() {
        let err = ClientFrame::parse(r#"{"event":"register","data":{"user_id":""}}"#).unwrap_err();
        assert!(err.to_string().contains("user id must not be empty"));

        let err = ClientFrame::parse(
            r#"{"event":"send","data":{"sender_id":"a","receiver_id":" ","text":"x","chat_id":"c"}}"#,
        )
        .unwrap_err();
        assert!(matches!(err, RelayError::Json(_)));
    }

    #[test]
    fn test_parse_rejects_unknown_event() {
        let err = ClientFrame::parse(r#"{"event":"shout","data":{}}"#).unwrap_err();
        assert!(matches!(err, RelayError::Json(_)));
    }

    #[test]
    fn test_deliver_wire_shape() {
        let frame = ServerFrame::Deliver(Delivery {
            sender_id: UserId::new("a").unwrap(),
            text: "hi".into(),
            chat_id: ChatId::new("x"),
        });
        let json: serde_json::Value = serde_json::from_str(&frame.to_text().unwrap()).unwrap();
        assert_eq!(json["event"], "deliver");
        assert_eq!(json["data"]["sender_id"], "a");
        assert_eq!(json["data"]["text"], "hi");
        assert_eq!(json["data"]["chat_id"], "x");
    }

    #[test]
    fn test_presence_delta_wire_shape() {
        let frame = ServerFrame::PresenceDelta {
            revision: 7,
            changes: vec![PresenceChange::Left(ConnectionEntry::new(
                UserId::new("a").unwrap(),
                ConnectionId::from("c1"),
            ))],
        };
        let json: serde_json::Value = serde_json::from_str(&frame.to_text().unwrap()).unwrap();
        assert_eq!(json["event"], "presence_delta");
        assert_eq!(json["data"]["revision"], 7);
        assert_eq!(json["data"]["changes"][0]["kind"], "left");
        assert_eq!(json["data"]["changes"][0]["entry"]["connection_id"], "c1");
    }
}
