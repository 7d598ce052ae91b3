//! # askbox-server
//!
//! WebSocket relay server for Askbox chat: tracks which users are connected,
//! announces presence to every client and forwards point-to-point messages.
//!
//! ## Endpoints
//!
//! - `GET /relay`: WebSocket speaking the relay protocol
//!   (see [`askbox_relay::protocol`])
//! - `GET /health`: liveness and connection counts

pub mod config;
pub mod server;
pub mod telemetry;

pub use config::ServerConfig;
pub use server::{create_router, serve, start, AppState};
