//! `flagchat`: line-oriented terminal client for Flag chat.
//!
//! Mounts one conversation, prints its history and live messages, and sends
//! each line typed on stdin. Configuration via CLI flags, environment
//! variables, or config file (`~/.config/flagchat/config.toml`).
//!
//! ```bash
//! # Join room 7
//! cargo run --bin flagchat -- --token alice-token --user-id 1 --room 7
//!
//! # Private chat with user 2 through a remote server
//! FLAGCHAT_WS_URL=wss://chat.example.com FLAGCHAT_API_URL=https://chat.example.com \
//!     cargo run --bin flagchat -- --token alice-token --user-id 1 --peer 2
//! ```
//!
//! Commands: `/room <id>`, `/peer <user id>`, `/help`, `/quit`.

use std::error::Error;
use std::path::Path;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_appender::non_blocking::WorkerGuard;

use flagchat::chat::ChatMessage;
use flagchat::chat::history::{HistoryLoader, HttpHistorySource};
use flagchat::config::{CliArgs, ClientConfig, parse_peer};
use flagchat::conversation::ConversationIdentity;
use flagchat::net::ConnectionState;
use flagchat::session::{ChatSession, SessionEvent};
use flagchat::transport::ws::WsConnector;

type Session = ChatSession<WsConnector, HttpHistorySource>;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let cli = CliArgs::parse();
    let _log_guard = init_logging(&cli.log_level, cli.log_file.as_deref());

    let config = ClientConfig::load(&cli)?;
    let session_config = config.session_config()?;
    let identity = cli.identity(&session_config.profile)?;

    let history_source = HttpHistorySource::new(
        config.api_base()?,
        session_config.credentials.clone(),
        config.request_timeout,
    )?;
    let history = HistoryLoader::new(history_source, config.history_limit);

    tracing::info!(conversation = %identity, "starting flagchat");
    println!("-- {identity} --");
    let mut session =
        ChatSession::mount(session_config, WsConnector::new(), history, identity).await?;
    print_all(session.messages());

    run(&mut session).await;
    session.unmount().await;
    Ok(())
}

/// Initialize file-based tracing so log output doesn't interleave with chat
/// output on stdout.
///
/// Returns a guard that must be held until shutdown to flush buffered logs.
/// Returns `None` if the log path has no parent directory or file name.
fn init_logging(level: &str, file_path: Option<&Path>) -> Option<WorkerGuard> {
    let default_path = std::env::temp_dir().join("flagchat.log");
    let log_path = file_path.unwrap_or(&default_path);

    let log_dir = log_path.parent()?;
    let file_name = log_path.file_name()?.to_str()?;

    let file_appender = tracing_appender::rolling::never(log_dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_writer(non_blocking)
        .with_env_filter(env_filter)
        .with_ansi(false)
        .init();

    Some(guard)
}

/// Interleave stdin lines and session events until `/quit` or EOF.
async fn run(session: &mut Session) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut live = true;

    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if !handle_line(session, &line).await {
                        return;
                    }
                    live = true;
                }
                Ok(None) => return,
                Err(e) => {
                    tracing::warn!(err = %e, "stdin read failed");
                    return;
                }
            },
            event = session.next_event(), if live => match event {
                Some(event) => print_event(&event),
                // Connection is final; keep reading commands so the user can switch.
                None => live = false,
            },
        }
    }
}

/// Handle one input line. Returns `false` when the user quits.
async fn handle_line(session: &mut Session, line: &str) -> bool {
    let trimmed = line.trim();
    let Some(command) = trimmed.strip_prefix('/') else {
        if let Err(e) = session.send(line) {
            println!("! {}", e.notice());
        }
        return true;
    };

    let (name, arg) = command
        .split_once(char::is_whitespace)
        .map_or((command, ""), |(n, a)| (n, a.trim()));
    let target = match name {
        "quit" | "q" => return false,
        "help" => {
            println!("! /room <id>, /peer <user id>, /quit");
            return true;
        }
        "room" if !arg.is_empty() => ConversationIdentity::room(arg),
        "peer" => match parse_peer(arg, session.profile()) {
            Ok(identity) => identity,
            Err(e) => {
                println!("! {e}");
                return true;
            }
        },
        _ => {
            println!("! unknown command /{name}; try /help");
            return true;
        }
    };

    println!("-- {target} --");
    match session.switch(target).await {
        Ok(()) => print_all(session.messages()),
        Err(e) => println!("! {e}"),
    }
    true
}

fn print_all(messages: &[ChatMessage]) {
    for message in messages {
        print_message(message);
    }
}

fn print_message(message: &ChatMessage) {
    let time = message
        .created_at
        .with_timezone(&chrono::Local)
        .format("%H:%M");
    let name = if message.is_me {
        "you"
    } else {
        message.sender_name.as_str()
    };
    println!("[{time}] {name}: {}", message.content);
}

fn print_event(event: &SessionEvent) {
    match event {
        SessionEvent::Appended(message) => print_message(message),
        SessionEvent::Notice(notice) => println!("! {notice}"),
        SessionEvent::StateChanged {
            state: ConnectionState::Open,
            ..
        } => println!("* connected"),
        SessionEvent::RetryScheduled { attempt, delay } => {
            println!("* reconnecting in {}s (attempt {attempt})", delay.as_secs());
        }
        SessionEvent::StateChanged { .. } => {}
    }
}
