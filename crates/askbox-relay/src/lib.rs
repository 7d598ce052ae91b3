//! # askbox-relay
//!
//! Presence registry and point-to-point message relay for Askbox chat.
//!
//! This crate holds the transport-independent core of the relay server and
//! the wire protocol shared with `askbox-client`.
//!
//! ## Architecture
//!
//! - **Registry**: maps each registered user to its one live connection
//! - **Connection table**: outbound frame channel for every accepted socket
//! - **Router**: forwards `send` frames to the receiver's connection, best effort
//! - **Presence**: publishes registry changes to every connection over a
//!   broadcast topic, as deltas or full snapshots
//! - **Hub**: owns all of the above; transport code only talks to the hub

pub mod connections;
pub mod hub;
pub mod presence;
pub mod protocol;
pub mod registry;
pub mod routing;

mod error;
mod types;

pub use connections::{ConnectionTable, SendResult};
pub use error::RelayError;
pub use hub::{ConnectionHandle, FrameOutcome, RelayConfig, RelayHub};
pub use presence::{PresenceBroadcaster, PresenceMode};
pub use protocol::{ClientFrame, Delivery, PresenceChange, ServerFrame};
pub use registry::{RegistrationOutcome, RegistrationPolicy};
pub use routing::{MessageRouter, RouteOutcome};
pub use types::*;
