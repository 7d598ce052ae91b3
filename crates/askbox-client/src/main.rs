// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Askbox Contributors

//! askbox-chat - terminal client for the Askbox relay.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use askbox_client::console::{self, InputError};
use askbox_client::{
    ChatClient, ChatStore, ClientConfig, Command, HttpChatStore, MemoryChatStore, SessionBinder,
};
use askbox_relay::UserId;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// askbox-chat - one-to-one chat over the Askbox relay
#[derive(Parser)]
#[command(name = "askbox-chat")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Your user id
    #[arg(short, long, env = "ASKBOX_USER")]
    user: Option<String>,

    /// Relay WebSocket URL (e.g. ws://localhost:3000/relay)
    #[arg(long)]
    server_url: Option<String>,

    /// Persistence API base URL (e.g. http://localhost:3000)
    #[arg(long)]
    api_url: Option<String>,

    /// Config file (defaults to the XDG config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Keep chats in memory instead of using the persistence API
    #[arg(long)]
    offline: bool,
}

fn init_logging() -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn,askbox_client=info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false),
        )
        .try_init()?;
    Ok(())
}

fn load_config(cli: &Cli) -> Result<ClientConfig> {
    let mut config = match &cli.config {
        Some(path) => ClientConfig::load_from(path),
        None => ClientConfig::load(),
    }
    .context("Failed to load configuration")?;

    if let Some(url) = &cli.server_url {
        config.server.url = url.clone();
    }
    if let Some(url) = &cli.api_url {
        config.api.base_url = url.clone();
    }
    if let Some(user) = &cli.user {
        config.session.user_id = Some(user.clone());
    }
    Ok(config)
}

/// Forward stdin lines to the client as commands.
async fn read_input(commands: mpsc::UnboundedSender<Command>) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Some(line) = lines.next_line().await? {
        match console::parse_line(&line) {
            Ok(Some(command)) => {
                let quit = command == Command::Quit;
                if commands.send(command).is_err() || quit {
                    return Ok(());
                }
            }
            Ok(None) => {}
            Err(InputError::Help) => println!("{}", console::HELP),
            Err(e) => eprintln!("{e}"),
        }
    }

    let _ = commands.send(Command::Quit);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging()?;

    let config = load_config(&cli)?;
    let user_id = config
        .session
        .user_id
        .clone()
        .context("No user id given; pass --user or set session.user_id in the config file")?;
    let user_id = UserId::new(user_id).context("Invalid user id")?;

    let store: Arc<dyn ChatStore> = if cli.offline {
        Arc::new(MemoryChatStore::new())
    } else {
        Arc::new(
            HttpChatStore::new(&config.api.base_url, config.api.token.clone())
                .context("Invalid API URL")?,
        )
    };

    info!(user = %user_id, relay = %config.server.url, "askbox-chat starting");
    println!("Signed in as {user_id}. Type /help for commands.");

    let (session, session_events) = SessionBinder::spawn(config.session_config(), Some(user_id.clone()));
    let (client, mut notices) = ChatClient::new(user_id, store, session);

    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let _ = command_tx.send(Command::LoadDirectory);

    tokio::spawn(async move {
        while let Some(notice) = notices.recv().await {
            if let Some(text) = console::render_notice(&notice) {
                println!("{text}");
            }
        }
    });
    let input = tokio::spawn(read_input(command_tx));

    client.run(command_rx, session_events).await;
    input.abort();

    Ok(())
}
