//! Point-to-point message routing.
//!
//! This module provides the `MessageRouter`, which forwards a chat message to
//! the connection currently registered for its receiver.
//!
//! # Routing Logic
//!
//! For each message, the router:
//! 1. Looks up the receiver in the `ConnectionRegistry`
//! 2. If registered: queues a `deliver` frame on that connection only
//! 3. If not registered: drops the message
//!
//! Delivery is fire-and-forget. There is no retry, no queue for offline users
//! and no signal back to the sender; every outcome is informational.
//!
//! # Example
//!
//! ```ignore
//! use askbox_relay::routing::MessageRouter;
//!
//! let router = MessageRouter::new(registry, connections);
//!
//! match router.route(message) {
//!     RouteOutcome::Delivered { .. } => {}
//!     RouteOutcome::NotRegistered => {} // receiver offline, dropped
//!     _ => {}
//! }
//! ```

use std::sync::Arc;

use tracing::{debug, instrument, warn};

use crate::connections::{ConnectionTable, SendResult};
use crate::protocol::{Delivery, ServerFrame};
use crate::registry::ConnectionRegistry;
use crate::types::{ConnectionId, RelayMessage};

/// Result of a routing operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    /// The message was queued on the receiver's connection
    Delivered {
        /// Connection the message was queued on
        connection_id: ConnectionId,
    },
    /// The receiver is not registered; the message was dropped
    NotRegistered,
    /// The receiver's outbound channel was full; the message was dropped
    Backpressured,
    /// The receiver was registered but its connection had already gone away
    ConnectionGone,
}

impl RouteOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, RouteOutcome::Delivered { .. })
    }
}

/// Router for relay messages between registered users.
pub struct MessageRouter {
    /// Connection registry used to resolve receivers
    registry: Arc<ConnectionRegistry>,
    /// Outbound channels of open connections
    connections: Arc<ConnectionTable>,
}

impl MessageRouter {
    /// Create a new message router.
    pub fn new(registry: Arc<ConnectionRegistry>, connections: Arc<ConnectionTable>) -> Self {
        Self {
            registry,
            connections,
        }
    }

    /// Route a message to its receiver.
    ///
    /// A receiver equal to the sender is not special-cased: it routes to the
    /// sender's own connection when registered.
    #[instrument(
        skip(self, message),
        fields(from = %message.sender_id, to = %message.receiver_id, chat = %message.chat_id)
    )]
    pub fn route(&self, message: RelayMessage) -> RouteOutcome {
        let Some(connection_id) = self.registry.lookup(&message.receiver_id) else {
            debug!("Receiver not registered, dropping message");
            return RouteOutcome::NotRegistered;
        };

        let frame = ServerFrame::Deliver(Delivery::from(message));

        match self.connections.send_to(&connection_id, frame) {
            SendResult::Sent => {
                debug!(connection = %connection_id, "Message relayed");
                RouteOutcome::Delivered { connection_id }
            }
            SendResult::ChannelFull => {
                warn!(connection = %connection_id, "Receiver channel full, dropping message");
                RouteOutcome::Backpressured
            }
            SendResult::NotConnected | SendResult::ChannelClosed => {
                debug!(connection = %connection_id, "Receiver connection gone, dropping message");
                RouteOutcome::ConnectionGone
            }
        }
    }
}

impl std::fmt::Debug for MessageRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageRouter")
            .field("registry", &self.registry)
            .field("connections", &self.connections)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ChatId, UserId};
    use tokio::sync::mpsc::error::TryRecvError;

    fn user(id: &str) -> UserId {
        UserId::new(id).unwrap()
    }

    fn message(from: &str, to: &str, text: &str, chat: &str) -> RelayMessage {
        RelayMessage {
            sender_id: user(from),
            receiver_id: user(to),
            text: text.to_string(),
            chat_id: ChatId::new(chat),
        }
    }

    fn setup() -> (Arc<ConnectionRegistry>, Arc<ConnectionTable>, MessageRouter) {
        let registry = Arc::new(ConnectionRegistry::new());
        let connections = Arc::new(ConnectionTable::new(16));
        let router = MessageRouter::new(Arc::clone(&registry), Arc::clone(&connections));
        (registry, connections, router)
    }

    #[tokio::test]
    async fn test_route_delivers_only_to_receiver() {
        let (registry, connections, router) = setup();
        let c1 = ConnectionId::from("c1");
        let c2 = ConnectionId::from("c2");
        let mut rx_a = connections.insert(c1.clone());
        let mut rx_b = connections.insert(c2.clone());
        registry.register(user("a"), c1);
        registry.register(user("b"), c2.clone());

        let outcome = router.route(message("a", "b", "hi", "x"));

        assert_eq!(outcome, RouteOutcome::Delivered { connection_id: c2 });
        assert_eq!(
            rx_b.recv().await,
            Some(ServerFrame::Deliver(Delivery {
                sender_id: user("a"),
                text: "hi".into(),
                chat_id: ChatId::new("x"),
            }))
        );
        assert_eq!(rx_b.try_recv(), Err(TryRecvError::Empty));
        assert_eq!(rx_a.try_recv(), Err(TryRecvError::Empty));
    }

    #[tokio::test]
    async fn test_route_to_unregistered_receiver_is_dropped() {
        let (registry, connections, router) = setup();
        let c1 = ConnectionId::from("c1");
        let mut rx_a = connections.insert(c1.clone());
        registry.register(user("a"), c1);

        let outcome = router.route(message("a", "c", "hello?", "x"));

        assert_eq!(outcome, RouteOutcome::NotRegistered);
        assert_eq!(rx_a.try_recv(), Err(TryRecvError::Empty));
    }

    #[tokio::test]
    async fn test_route_to_self() {
        let (registry, connections, router) = setup();
        let c1 = ConnectionId::from("c1");
        let mut rx = connections.insert(c1.clone());
        registry.register(user("a"), c1);

        assert!(router.route(message("a", "a", "note to self", "x")).is_delivered());
        assert!(matches!(rx.recv().await, Some(ServerFrame::Deliver(d)) if d.text == "note to self"));
    }

    #[test]
    fn test_route_to_registered_but_closed_connection() {
        let (registry, connections, router) = setup();
        let c2 = ConnectionId::from("c2");
        drop(connections.insert(c2.clone()));
        registry.register(user("b"), c2);

        assert_eq!(router.route(message("a", "b", "hi", "x")), RouteOutcome::ConnectionGone);
    }

    #[tokio::test]
    async fn test_route_preserves_per_sender_order() {
        let (registry, connections, router) = setup();
        let c2 = ConnectionId::from("c2");
        let mut rx_b = connections.insert(c2.clone());
        registry.register(user("b"), c2);

        for i in 0..5 {
            router.route(message("a", "b", &format!("m{i}"), "x"));
        }

        for i in 0..5 {
            match rx_b.recv().await {
                Some(ServerFrame::Deliver(d)) => assert_eq!(d.text, format!("m{i}")),
                other => panic!("unexpected frame: {other:?}"),
            }
        }
    }
}
