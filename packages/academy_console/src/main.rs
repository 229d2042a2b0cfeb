//! Terminal front-end for the chat synchronization core.
//!
//! Drives a session in widget mode (one conversation) or console mode
//! (all conversations, recency-ordered). All chat logic lives in
//! `academy_chat`; this binary only renders committed state and turns
//! typed lines into commands.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;
use tracing_subscriber::prelude::*;

use academy_chat::{
    ChatSession, ConnectionState, HttpApi, LocalUser, MessageUpdate, ReceiptUpdate,
    SessionProfile, Status, TypingUpdate, WsTransport, load_config,
};

#[derive(Parser)]
#[command(name = "academy-console")]
#[command(about = "Realtime chat client for the training platform")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Directory holding chat.toml (defaults to the current directory)
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,

    /// Opaque API credential (or set ACADEMY_CREDENTIAL)
    #[arg(long, global = true)]
    credential: Option<String>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// End-user widget: the signed-in user's own support conversation
    Widget(IdentityArgs),

    /// Admin console: every conversation, sorted by recency
    Console(IdentityArgs),
}

#[derive(Parser)]
struct IdentityArgs {
    /// Signed-in user id
    #[arg(long)]
    user_id: String,

    /// Display name shown on outbound messages
    #[arg(long)]
    display_name: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_directive = if cli.debug {
        "academy=debug,academy_chat=debug,info"
    } else {
        "academy=info,academy_chat=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();

    let config_dir = cli
        .config_dir
        .clone()
        .unwrap_or_else(|| PathBuf::from("."));
    let cfg: academy_chat::ChatConfig = load_config(&config_dir)
        .extract()
        .context("invalid configuration")?;

    let credential = cli
        .credential
        .clone()
        .or_else(|| std::env::var("ACADEMY_CREDENTIAL").ok())
        .context("no credential: pass --credential or set ACADEMY_CREDENTIAL")?;

    let (identity, profile) = match &cli.command {
        Commands::Widget(args) => (args, SessionProfile::Widget),
        Commands::Console(args) => (args, SessionProfile::Console),
    };
    let local = LocalUser {
        user_id: identity.user_id.clone(),
        display_name: identity.display_name.clone(),
    };

    let api = Arc::new(HttpApi::new(&cfg.endpoints.api_url, &credential));
    let transport = Arc::new(WsTransport::new(&cfg.endpoints.ws_url));

    info!("Connecting to {}", cfg.endpoints.ws_url);
    let session = ChatSession::login(cfg, local, credential, api, transport, profile)
        .await
        .context("login failed")?;

    let focused = match profile {
        SessionProfile::Widget => {
            let conversation = session
                .own_conversation_id()
                .context("widget session has no conversation")?
                .to_string();
            session.focus(&conversation).await;
            Some(conversation)
        }
        SessionProfile::Console => None,
    };

    println!("Commands: /list, /open <id>, /close, /resend <temp-id>, /quit; anything else sends.");
    run_repl(&session, focused).await?;

    session.logout();
    Ok(())
}

/// Line-oriented loop: inbound updates interleave with typed commands.
async fn run_repl(session: &ChatSession, mut focused: Option<String>) -> Result<()> {
    let mut messages = session.messages();
    let mut typing = session.typing();
    let mut receipts = session.receipts();
    let mut state = session.connection_state();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("stdin closed")? else {
                    return Ok(());
                };
                let line = line.trim().to_string();
                if line.is_empty() {
                    continue;
                }
                if !handle_line(session, &mut focused, &line).await? {
                    return Ok(());
                }
            }

            update = messages.recv() => {
                match update {
                    Ok(update) => render_message(&update),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return Ok(()),
                }
            }

            update = typing.recv() => {
                if let Ok(update) = update {
                    match update {
                        TypingUpdate::Started { conversation_id, user_id } => {
                            println!("[{}] {} is typing…", conversation_id, user_id);
                        }
                        TypingUpdate::Stopped { conversation_id, user_id } => {
                            println!("[{}] {} stopped typing", conversation_id, user_id);
                        }
                    }
                }
            }

            update = receipts.recv() => {
                if let Ok(update) = update {
                    match update {
                        ReceiptUpdate::UnreadChanged { conversation_id, unread } => {
                            println!("[{}] unread: {}", conversation_id, unread);
                        }
                        ReceiptUpdate::CounterpartRead { conversation_id } => {
                            println!("[{}] read by counterpart", conversation_id);
                        }
                    }
                }
            }

            changed = state.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
                let snapshot: ConnectionState = state.borrow_and_update().clone();
                println!("[connection] {:?} (retries: {})", snapshot.status, snapshot.retry_count);
                if snapshot.status == Status::Failed {
                    if let Some(error) = snapshot.last_error {
                        eprintln!("[connection] fatal: {}", error);
                    }
                    return Ok(());
                }
            }
        }
    }
}

/// Returns false when the REPL should exit.
async fn handle_line(
    session: &ChatSession,
    focused: &mut Option<String>,
    line: &str,
) -> Result<bool> {
    if let Some(rest) = line.strip_prefix('/') {
        let mut parts = rest.splitn(2, ' ');
        let command = parts.next().unwrap_or_default();
        let argument = parts.next().map(str::trim);

        match (command, argument) {
            ("quit", _) => return Ok(false),
            ("list", _) => {
                for row in session.conversations().await {
                    let name = row
                        .counterpart_name
                        .unwrap_or_else(|| row.conversation_id.clone());
                    let typing = if row.remote_typing { " [typing…]" } else { "" };
                    println!(
                        "{:<24} {:<20} unread: {}{}  {}",
                        row.conversation_id,
                        name,
                        row.unread,
                        typing,
                        row.preview.unwrap_or_default()
                    );
                }
            }
            ("open", Some(id)) => {
                if let Some(previous) = focused.take() {
                    session.unfocus(&previous).await;
                }
                session.focus(id).await;
                *focused = Some(id.to_string());
                if let Some(snapshot) = session.snapshot(id).await {
                    for message in snapshot {
                        println!("  {} {}: {}", message.created_at, message.sender_name, message.body);
                    }
                }
            }
            ("close", _) => {
                if let Some(previous) = focused.take() {
                    session.unfocus(&previous).await;
                }
            }
            ("resend", Some(temp_id)) => match focused {
                Some(conversation) => match session.resend(conversation, temp_id).await {
                    Ok(()) => println!("resent {}", temp_id),
                    Err(err) => eprintln!("resend failed: {}", err),
                },
                None => eprintln!("no conversation open"),
            },
            _ => eprintln!("unknown command: /{}", rest),
        }
        return Ok(true);
    }

    match focused {
        Some(conversation) => {
            session.keystroke(conversation).await;
            match session.send_message(conversation, line).await {
                Ok(temp_id) => println!("… sending as {}", temp_id),
                Err(err) => eprintln!("send refused: {}", err),
            }
        }
        None => eprintln!("no conversation open — /open <id> first"),
    }
    Ok(true)
}

fn render_message(update: &MessageUpdate) {
    match update {
        MessageUpdate::Appended {
            conversation_id,
            message,
        } => {
            println!(
                "[{}] {}: {}",
                conversation_id, message.sender_name, message.body
            );
        }
        MessageUpdate::Reconciled {
            conversation_id,
            message,
            ..
        } => {
            println!("[{}] delivered as {}", conversation_id, message.id);
        }
        MessageUpdate::SendFailed {
            conversation_id,
            temp_id,
        } => {
            eprintln!(
                "[{}] send failed: {} (use /resend {})",
                conversation_id, temp_id, temp_id
            );
        }
        MessageUpdate::Resent {
            conversation_id,
            temp_id,
        } => {
            println!("[{}] resending {}", conversation_id, temp_id);
        }
    }
}
