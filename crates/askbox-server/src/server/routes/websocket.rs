//! Presence and message relay over WebSocket.
//!
//! Each accepted socket is served by one task that multiplexes three
//! sources: frames read from the client, frames addressed to this
//! connection, and the shared presence topic.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
    routing::get,
    Router,
};
use futures::{stream::SplitSink, SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};

use askbox_relay::{ConnectionHandle, ServerFrame};

use crate::server::AppState;

/// Create the relay WebSocket router
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/relay", get(relay_websocket_handler))
        .with_state(state)
}

/// GET /relay
///
/// Upgrades the HTTP connection to a WebSocket speaking the relay protocol.
async fn relay_websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> Response {
    debug!("Relay WebSocket connection request");
    ws.on_upgrade(move |socket| handle_relay_socket(socket, state))
}

type Outbound = SplitSink<WebSocket, Message>;

/// Encode and write one frame. Returns false when the socket is unusable.
async fn send_frame(sender: &mut Outbound, frame: &ServerFrame) -> bool {
    let text = match frame.to_text() {
        Ok(text) => text,
        Err(e) => {
            error!(error = %e, event = frame.event_name(), "Failed to encode frame");
            return true;
        }
    };

    if let Err(e) = sender.send(Message::Text(text)).await {
        debug!(error = %e, "Failed to send WebSocket message");
        return false;
    }
    true
}

/// Serve one relay connection until either side closes it.
async fn handle_relay_socket(socket: WebSocket, state: Arc<AppState>) {
    let ConnectionHandle {
        id,
        mut outbound,
        mut presence,
        initial,
    } = state.hub.connect();

    info!(connection = %id, "Relay WebSocket connection established");

    let (mut sender, mut receiver) = socket.split();

    if !send_frame(&mut sender, &initial).await {
        state.hub.disconnect(&id);
        return;
    }

    loop {
        tokio::select! {
            _ = state.stop_token.cancelled() => {
                let _ = sender.send(Message::Close(None)).await;
                break;
            }
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        debug!(connection = %id, len = text.len(), "Received relay frame");
                        state.hub.handle_text(&id, &text);
                    }
                    Some(Ok(Message::Binary(_))) => {
                        warn!(connection = %id, "Received binary WebSocket message (not supported)");
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = sender.send(Message::Pong(data)).await {
                            error!(connection = %id, error = %e, "Failed to send pong");
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) | None => {
                        debug!(connection = %id, "WebSocket close requested");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(connection = %id, error = %e, "WebSocket error");
                        break;
                    }
                }
            }
            frame = outbound.recv() => {
                let Some(frame) = frame else {
                    debug!(connection = %id, "Outbound channel closed");
                    break;
                };
                if !send_frame(&mut sender, &frame).await {
                    break;
                }
            }
            frame = presence.recv() => {
                let frame = match frame {
                    Ok(frame) => frame,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(connection = %id, skipped, "Presence subscriber lagged, resyncing");
                        state.hub.resync_frame()
                    }
                    Err(RecvError::Closed) => break,
                };
                if !send_frame(&mut sender, &frame).await {
                    break;
                }
            }
        }
    }

    state.hub.disconnect(&id);
}
