//! Outbound channels for every open transport connection.
//!
//! Unlike the registry, this table holds every accepted socket, registered or
//! not, so that presence reaches clients that have not announced themselves.

use std::fmt;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, instrument, warn};

use crate::protocol::ServerFrame;
use crate::types::ConnectionId;

/// Result of attempting to send a frame to a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendResult {
    /// Frame was queued for delivery
    Sent,
    /// No such connection
    NotConnected,
    /// The connection's outbound channel is full; the frame was dropped
    ChannelFull,
    /// The connection's outbound channel is closed; the entry was removed
    ChannelClosed,
}

/// Map of connection id to outbound frame channel.
pub struct ConnectionTable {
    connections: DashMap<ConnectionId, mpsc::Sender<ServerFrame>>,
    buffer: usize,
}

impl ConnectionTable {
    /// Create a table whose per-connection channels hold `buffer` frames.
    pub fn new(buffer: usize) -> Self {
        Self {
            connections: DashMap::new(),
            buffer: buffer.max(1),
        }
    }

    /// Open an outbound channel for a connection.
    ///
    /// If the id is already present its old channel is replaced and closed.
    pub fn insert(&self, connection_id: ConnectionId) -> mpsc::Receiver<ServerFrame> {
        let (tx, rx) = mpsc::channel(self.buffer);
        if self.connections.insert(connection_id, tx).is_some() {
            warn!("Replaced outbound channel for existing connection id");
        }
        rx
    }

    /// Drop a connection's outbound channel.
    pub fn remove(&self, connection_id: &ConnectionId) -> bool {
        self.connections.remove(connection_id).is_some()
    }

    /// Per-connection channel size.
    pub fn buffer(&self) -> usize {
        self.buffer
    }

    pub fn contains(&self, connection_id: &ConnectionId) -> bool {
        self.connections.contains_key(connection_id)
    }

    /// Get the number of open connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Queue a frame for a connection without waiting.
    #[instrument(skip(self, frame), fields(to = %connection_id, event = frame.event_name()))]
    pub fn send_to(&self, connection_id: &ConnectionId, frame: ServerFrame) -> SendResult {
        let sender = match self.connections.get(connection_id) {
            Some(entry) => entry.value().clone(),
            None => {
                debug!("Connection not open");
                return SendResult::NotConnected;
            }
        };

        match sender.try_send(frame) {
            Ok(()) => {
                debug!("Frame queued for delivery");
                SendResult::Sent
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("Outbound channel full, dropping frame");
                SendResult::ChannelFull
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Outbound channel closed, connection may have dropped");
                self.connections.remove(connection_id);
                SendResult::ChannelClosed
            }
        }
    }
}

impl fmt::Debug for ConnectionTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionTable")
            .field("connection_count", &self.connections.len())
            .field("buffer", &self.buffer)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Delivery;
    use crate::types::{ChatId, UserId};

    fn deliver(text: &str) -> ServerFrame {
        ServerFrame::Deliver(Delivery {
            sender_id: UserId::new("alice").unwrap(),
            text: text.to_string(),
            chat_id: ChatId::new("chat-1"),
        })
    }

    #[tokio::test]
    async fn test_send_to_open_connection() {
        let table = ConnectionTable::new(16);
        let id = ConnectionId::from("c1");
        let mut rx = table.insert(id.clone());

        assert_eq!(table.send_to(&id, deliver("hi")), SendResult::Sent);
        assert_eq!(rx.recv().await, Some(deliver("hi")));
    }

    #[test]
    fn test_send_to_unknown_connection() {
        let table = ConnectionTable::new(16);
        assert_eq!(
            table.send_to(&ConnectionId::from("missing"), deliver("hi")),
            SendResult::NotConnected
        );
    }

    #[test]
    fn test_send_to_closed_channel_removes_entry() {
        let table = ConnectionTable::new(16);
        let id = ConnectionId::from("c1");
        let rx = table.insert(id.clone());
        drop(rx);

        assert_eq!(table.send_to(&id, deliver("hi")), SendResult::ChannelClosed);
        assert!(!table.contains(&id));
    }

    #[test]
    fn test_send_to_full_channel() {
        let table = ConnectionTable::new(1);
        let id = ConnectionId::from("c1");
        let _rx = table.insert(id.clone());

        assert_eq!(table.send_to(&id, deliver("one")), SendResult::Sent);
        assert_eq!(table.send_to(&id, deliver("two")), SendResult::ChannelFull);
    }

    #[test]
    fn test_remove() {
        let table = ConnectionTable::new(4);
        let id = ConnectionId::from("c1");
        let _rx = table.insert(id.clone());

        assert_eq!(table.len(), 1);
        assert!(table.remove(&id));
        assert!(!table.remove(&id));
        assert!(table.is_empty());
    }
}
