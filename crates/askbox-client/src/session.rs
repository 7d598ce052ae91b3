// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Askbox Contributors

//! Relay session over WebSocket.
//!
//! A [`SessionBinder`] task owns at most one connection to the relay at a
//! time. It announces the local identity after every connect, reconnects
//! with jittered exponential backoff, and turns server frames into
//! [`SessionEvent`]s. Transport failures are reported as events and never
//! as errors to the caller.

use std::time::Duration;

use askbox_relay::{ClientFrame, Delivery, RelayError, RelayMessage, ServerFrame, UserId};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use rand::Rng;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::presence::PresenceUpdate;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

/// Connection settings for a relay session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// WebSocket URL of the relay endpoint
    pub url: String,
    /// Reconnect after the connection drops
    pub reconnect: bool,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// Give up after this many reconnect attempts without a successful connect
    pub max_attempts: Option<u32>,
    pub connect_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            url: "ws://localhost:3000/relay".into(),
            reconnect: true,
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(30),
            max_attempts: None,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Relay session has stopped")]
    Closed,

    #[error("WebSocket error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Connection attempt timed out after {0:?}")]
    Timeout(Duration),

    #[error("Failed to encode frame: {0}")]
    Encode(#[from] RelayError),
}

/// Requests from the application to the session task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionCommand {
    Send(RelayMessage),
    Announce(UserId),
}

/// Events from the session task to the application.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Connected,
    Disconnected { reason: String },
    RetryScheduled { attempt: u32, delay: Duration },
    Presence(PresenceUpdate),
    Delivered(Delivery),
    /// The session task has exited and will not reconnect
    Closed,
}

/// Cloneable handle to a running session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<SessionCommand>,
    cancel: CancellationToken,
}

impl SessionHandle {
    /// A handle with no session task behind it; commands are readable from
    /// the returned receiver.
    pub fn pair() -> (Self, mpsc::UnboundedReceiver<SessionCommand>) {
        let (commands, rx) = mpsc::unbounded_channel();
        (
            Self {
                commands,
                cancel: CancellationToken::new(),
            },
            rx,
        )
    }

    /// Relay a message. Fire-and-forget: dropped if not connected.
    pub fn send(&self, message: RelayMessage) -> Result<(), SessionError> {
        self.command(SessionCommand::Send(message))
    }

    /// Set the identity announced on this and every later connection.
    pub fn announce(&self, user_id: UserId) -> Result<(), SessionError> {
        self.command(SessionCommand::Announce(user_id))
    }

    fn command(&self, command: SessionCommand) -> Result<(), SessionError> {
        if self.cancel.is_cancelled() {
            return Err(SessionError::Closed);
        }
        self.commands
            .send(command)
            .map_err(|_| SessionError::Closed)
    }

    /// Stop the session task, closing the connection.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled() || self.commands.is_closed()
    }
}

/// Reconnect backoff: doubles from `base` up to `max`, with ±25% jitter.
#[derive(Debug, Clone)]
pub struct RetryState {
    attempt: u32,
    base: Duration,
    max: Duration,
}

impl RetryState {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            attempt: 0,
            base,
            max,
        }
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Count a failed attempt and return the delay before the next one.
    pub fn schedule_retry(&mut self) -> Duration {
        self.attempt += 1;
        let exponent = (self.attempt - 1).min(30) as i32;
        let base_secs = (self.base.as_secs_f64() * 2f64.powi(exponent))
            .min(self.max.as_secs_f64());
        let jitter = 1.0 + rand::rng().random_range(-0.25..=0.25);
        Duration::from_secs_f64(base_secs * jitter)
    }
}

enum Exit {
    /// Shutdown requested
    Cancelled,
    /// Every handle was dropped
    Abandoned,
    /// The connection was lost
    Dropped(String),
}

/// Spawns and drives relay sessions.
pub struct SessionBinder {
    config: SessionConfig,
    identity: Option<UserId>,
    commands: mpsc::UnboundedReceiver<SessionCommand>,
    events: mpsc::UnboundedSender<SessionEvent>,
    cancel: CancellationToken,
    retry: RetryState,
}

impl SessionBinder {
    /// Start a session task. Must be called inside a Tokio runtime.
    pub fn spawn(
        config: SessionConfig,
        identity: Option<UserId>,
    ) -> (SessionHandle, mpsc::UnboundedReceiver<SessionEvent>) {
        let (handle, commands) = SessionHandle::pair();
        let (events, events_rx) = mpsc::unbounded_channel();

        let binder = Self {
            retry: RetryState::new(config.backoff_base, config.backoff_max),
            config,
            identity,
            commands,
            events,
            cancel: handle.cancel.clone(),
        };
        tokio::spawn(binder.run());

        (handle, events_rx)
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    async fn run(mut self) {
        info!(url = %self.config.url, "Starting relay session");

        loop {
            let attempt = tokio::select! {
                _ = self.cancel.cancelled() => break,
                result = connect(&self.config) => result,
            };

            match attempt {
                Ok(ws) => {
                    info!(url = %self.config.url, "Relay connected");
                    self.retry.reset();
                    self.emit(SessionEvent::Connected);

                    match self.serve(ws).await {
                        Exit::Cancelled | Exit::Abandoned => break,
                        Exit::Dropped(reason) => {
                            warn!(%reason, "Relay connection lost");
                            self.emit(SessionEvent::Disconnected { reason });
                        }
                    }
                }
                Err(e) => {
                    warn!(url = %self.config.url, error = %e, "Relay connection attempt failed");
                }
            }

            if !self.config.reconnect {
                break;
            }
            if self
                .config
                .max_attempts
                .is_some_and(|max| self.retry.attempt() >= max)
            {
                error!(attempts = self.retry.attempt(), "Giving up on relay connection");
                break;
            }

            let delay = self.retry.schedule_retry();
            info!(attempt = self.retry.attempt(), ?delay, "Reconnecting to relay");
            self.emit(SessionEvent::RetryScheduled {
                attempt: self.retry.attempt(),
                delay,
            });

            if !self.wait_offline(delay).await {
                break;
            }
        }

        self.cancel.cancel();
        info!("Relay session closed");
        self.emit(SessionEvent::Closed);
    }

    /// Sleep out a backoff delay while still taking commands. Returns false
    /// when the session should stop.
    async fn wait_offline(&mut self, delay: Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return false,
                _ = &mut sleep => return true,
                command = self.commands.recv() => match command {
                    None => return false,
                    Some(SessionCommand::Announce(user_id)) => {
                        debug!(user = %user_id, "Identity set while offline");
                        self.identity = Some(user_id);
                    }
                    Some(SessionCommand::Send(message)) => {
                        warn!(
                            receiver = %message.receiver_id,
                            "Not connected to relay, dropping message"
                        );
                    }
                },
            }
        }
    }

    async fn serve(&mut self, ws: WsStream) -> Exit {
        let (mut sink, mut source) = ws.split();

        if let Some(user_id) = self.identity.clone() {
            if let Err(e) = register(&mut sink, user_id).await {
                return Exit::Dropped(e.to_string());
            }
        }

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    let _ = sink.send(Message::Close(None)).await;
                    return Exit::Cancelled;
                }
                command = self.commands.recv() => {
                    let result = match command {
                        None => {
                            let _ = sink.send(Message::Close(None)).await;
                            return Exit::Abandoned;
                        }
                        Some(SessionCommand::Send(message)) => {
                            send_frame(&mut sink, &ClientFrame::Send(message)).await
                        }
                        Some(SessionCommand::Announce(user_id)) => {
                            self.identity = Some(user_id.clone());
                            register(&mut sink, user_id).await
                        }
                    };
                    if let Err(e) = result {
                        return Exit::Dropped(e.to_string());
                    }
                }
                message = source.next() => {
                    if let Some(exit) = self.receive(message) {
                        return exit;
                    }
                }
            }
        }
    }

    fn receive(
        &self,
        message: Option<Result<Message, tokio_tungstenite::tungstenite::Error>>,
    ) -> Option<Exit> {
        match message {
            Some(Ok(Message::Text(text))) => {
                self.dispatch(text.as_str());
                None
            }
            Some(Ok(Message::Close(frame))) => {
                let reason = frame
                    .map(|f| f.reason.as_str().to_string())
                    .filter(|r| !r.is_empty())
                    .unwrap_or_else(|| "closed by server".to_string());
                Some(Exit::Dropped(reason))
            }
            Some(Ok(Message::Binary(_))) => {
                warn!("Ignoring binary frame from relay");
                None
            }
            Some(Ok(_)) => None,
            Some(Err(e)) => Some(Exit::Dropped(e.to_string())),
            None => Some(Exit::Dropped("connection closed".to_string())),
        }
    }

    fn dispatch(&self, text: &str) {
        let frame = match ServerFrame::parse(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "Ignoring malformed relay frame");
                return;
            }
        };
        debug!(event = frame.event_name(), "Relay frame received");

        let event = match frame {
            ServerFrame::Presence { revision, users } => {
                SessionEvent::Presence(PresenceUpdate::Snapshot { revision, users })
            }
            ServerFrame::PresenceDelta { revision, changes } => {
                SessionEvent::Presence(PresenceUpdate::Delta { revision, changes })
            }
            ServerFrame::Deliver(delivery) => SessionEvent::Delivered(delivery),
        };
        self.emit(event);
    }
}

async fn connect(config: &SessionConfig) -> Result<WsStream, SessionError> {
    debug!(url = %config.url, "Connecting to relay");
    match tokio::time::timeout(config.connect_timeout, connect_async(config.url.as_str())).await {
        Ok(Ok((ws, _response))) => Ok(ws),
        Ok(Err(e)) => Err(e.into()),
        Err(_) => Err(SessionError::Timeout(config.connect_timeout)),
    }
}

async fn register(sink: &mut WsSink, user_id: UserId) -> Result<(), SessionError> {
    debug!(user = %user_id, "Announcing identity");
    send_frame(sink, &ClientFrame::Register { user_id }).await
}

async fn send_frame(sink: &mut WsSink, frame: &ClientFrame) -> Result<(), SessionError> {
    let text = frame.to_text()?;
    sink.send(Message::text(text)).await?;
    Ok(())
}
