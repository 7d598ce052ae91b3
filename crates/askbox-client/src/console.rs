// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Askbox Contributors

//! Line-oriented terminal front end: input parsing and notice rendering.

use askbox_relay::UserId;
use thiserror::Error;

use crate::app::{ClientNotice, Command, ConnectionState};
use crate::reconciler::{ConversationEntry, EntryStatus};

pub const HELP: &str = "\
/users           list known users
/online          list users currently online
/open <user>     open the conversation with <user>
/unread          list users with unread messages
/refresh         reload the open conversation
/retry <id>      retry saving a failed message
/quit            exit
anything else is sent to the open conversation";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InputError {
    #[error("Usage: {0}")]
    MissingArgument(&'static str),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Unknown command /{0}, try /help")]
    UnknownCommand(String),

    #[error("{}", HELP)]
    Help,
}

/// Turn one input line into a command. Blank lines yield `None`.
pub fn parse_line(line: &str) -> Result<Option<Command>, InputError> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.trim().is_empty() {
        return Ok(None);
    }

    let Some(rest) = line.trim_start().strip_prefix('/') else {
        return Ok(Some(Command::Send(line.to_string())));
    };

    let mut parts = rest.splitn(2, char::is_whitespace);
    let name = parts.next().unwrap_or_default();
    let arg = parts.next().map(str::trim).filter(|a| !a.is_empty());

    let command = match name {
        "users" => Command::ListUsers,
        "online" => Command::ListOnline,
        "unread" => Command::ListUnread,
        "refresh" => Command::Refresh,
        "quit" | "exit" => Command::Quit,
        "help" => return Err(InputError::Help),
        "open" => {
            let arg = arg.ok_or(InputError::MissingArgument("/open <user>"))?;
            let user = UserId::new(arg).map_err(|e| InputError::InvalidArgument(e.to_string()))?;
            Command::Select(user)
        }
        "retry" => {
            let arg = arg.ok_or(InputError::MissingArgument("/retry <id>"))?;
            let id = arg
                .parse()
                .map_err(|_| InputError::InvalidArgument(format!("not a message id: {arg}")))?;
            Command::Retry(id)
        }
        other => return Err(InputError::UnknownCommand(other.to_string())),
    };
    Ok(Some(command))
}

fn render_entry(entry: &ConversationEntry) -> String {
    let time = entry.sent_datetime.format("%H:%M");
    let marker = match (&entry.status, entry.local_id) {
        (EntryStatus::Pending, _) => " …".to_string(),
        (EntryStatus::Failed(_), Some(id)) => format!(" [failed, /retry {id}]"),
        (EntryStatus::Failed(_), None) => " [failed]".to_string(),
        (EntryStatus::Confirmed, _) => String::new(),
    };
    format!("[{time}] {}: {}{marker}", entry.user_id, entry.message_text)
}

fn join_users(users: &[UserId]) -> String {
    if users.is_empty() {
        return "(none)".to_string();
    }
    users
        .iter()
        .map(UserId::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Text to print for a notice, if any.
pub fn render_notice(notice: &ClientNotice) -> Option<String> {
    let text = match notice {
        ClientNotice::Directory(users) if users.is_empty() => "No users found".to_string(),
        ClientNotice::Directory(users) => users
            .iter()
            .map(|u| match &u.name {
                Some(name) => format!("  {} ({name})", u.id),
                None => format!("  {}", u.id),
            })
            .collect::<Vec<_>>()
            .join("\n"),
        ClientNotice::OnlineUsers(users) => format!("Online: {}", join_users(users)),
        ClientNotice::UnreadChanged(users) => format!("Unread: {}", join_users(users)),
        ClientNotice::ConversationLoading { remote } => format!("Opening chat with {remote}..."),
        ClientNotice::ConversationReady {
            remote, messages, ..
        } => {
            let mut lines = vec![format!("── chat with {remote} ──")];
            lines.extend(messages.iter().map(render_entry));
            lines.join("\n")
        }
        ClientNotice::ConversationUnavailable { remote, reason } => {
            format!("Could not open chat with {remote}: {reason}")
        }
        ClientNotice::MessageAppended(entry) => render_entry(entry),
        ClientNotice::MessageConfirmed { .. } => return None,
        ClientNotice::MessageFailed { local_id, reason } => {
            format!("Message {local_id} was not saved ({reason}), /retry {local_id}")
        }
        ClientNotice::PresenceChanged(_) => return None,
        ClientNotice::Connection(state) => match state {
            ConnectionState::Connecting => return None,
            ConnectionState::Connected => "Connected".to_string(),
            ConnectionState::Reconnecting { attempt, delay } => {
                format!("Reconnecting in {:.1}s (attempt {attempt})", delay.as_secs_f64())
            }
            ConnectionState::Disconnected { reason } => format!("Disconnected: {reason}"),
            ConnectionState::Closed => "Connection closed".to_string(),
        },
        ClientNotice::Rejected(reason) => reason.clone(),
    };
    Some(text)
}
