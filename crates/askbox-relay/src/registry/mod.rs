//! Connection Registry for presence and message routing.
//!
//! The registry is the only shared mutable state in the relay. It maps each
//! registered user to the single connection currently representing it.
//!
//! ## Architecture
//!
//! ```text
//! socket task (alice, c1) --register--> ConnectionRegistry <--lookup-- MessageRouter
//!                                             |
//!                                             | RegistryChange (under lock)
//!                                             v
//!                                     PresenceBroadcaster --> every socket task
//! ```

mod connection_registry;

pub use connection_registry::{
    ChangeKind, ConnectionRegistry, RegistrationOutcome, RegistrationPolicy, RegistryChange,
};
