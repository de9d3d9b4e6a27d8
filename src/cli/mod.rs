//! Command-line interface for sisilink.
//!
//! Provides commands for following a live session, syncing server-side
//! history, inspecting the persisted transcript and the diagnostics log.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use crate::adapters::{HistorySource, HttpHistoryClient, WsConnector};
use crate::config::{self, BackendMode};
use crate::core::backend_history::untimed;
use crate::core::diagnostics::DiagnosticsSink;
use crate::core::{
    Fanout, FileStorage, JsonlSink, KeyValueStorage, Reconciler, Session, SessionConfig,
    SessionUpdate, TracingSink, TranscriptStore,
};
use crate::domain::{AgentId, Message};

pub mod history;

/// sisilink - Streaming conversation client for a two-agent voice backend
#[derive(Parser, Debug)]
#[command(name = "sisilink")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a live session and print transcript changes until Ctrl-C
    Listen {
        /// WebSocket url (overrides config; forces real mode)
        #[arg(short, long)]
        url: Option<String>,

        /// Skip the history fetch on startup
        #[arg(long)]
        no_history: bool,
    },

    /// Manage server-side history
    History {
        #[command(subcommand)]
        command: history::HistoryCommands,
    },

    /// Print the persisted transcript
    Transcript {
        /// Only this agent (sisi or liuye)
        #[arg(short, long, value_parser = parse_agent)]
        agent: Option<AgentId>,

        /// Maximum number of messages to show per agent
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Record a local user message in the persisted transcript
    Send {
        /// Agent to address (sisi or liuye)
        #[arg(value_parser = parse_agent)]
        agent: AgentId,

        /// Message text
        text: String,
    },

    /// Print the diagnostics log
    Events {
        /// Maximum number of events to show
        #[arg(short, long, default_value = "50")]
        limit: usize,
    },

    /// Show resolved configuration (debug)
    Config,
}

fn parse_agent(value: &str) -> Result<AgentId, String> {
    AgentId::parse(value).ok_or_else(|| format!("unknown agent '{}' (expected sisi or liuye)", value))
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Listen { url, no_history } => listen(url, !no_history).await,
            Commands::History { command } => execute_history(command).await,
            Commands::Transcript { agent, limit } => show_transcript(agent, limit).await,
            Commands::Send { agent, text } => send_local(agent, &text).await,
            Commands::Events { limit } => show_events(limit).await,
            Commands::Config => show_config().await,
        }
    }
}

/// Execute history subcommands
async fn execute_history(command: history::HistoryCommands) -> Result<()> {
    match command {
        history::HistoryCommands::Sync { http_base, limit } => {
            history::execute_sync(http_base, limit).await
        }
    }
}

/// Storage under the configured home
fn open_storage() -> Result<FileStorage> {
    FileStorage::open_default().context("Failed to open storage")
}

/// Tracing plus the JSONL log under the configured home
fn diagnostics_sink() -> Result<Arc<dyn DiagnosticsSink>> {
    let jsonl = JsonlSink::open_default().context("Failed to resolve events log")?;
    Ok(Arc::new(Fanout::new().with(TracingSink).with(jsonl)))
}

fn load_transcript(storage: Arc<dyn KeyValueStorage>) -> Result<TranscriptStore> {
    let cfg = config::config()?;
    Ok(TranscriptStore::load(storage, cfg.transcript.history_limit))
}

/// Run a live session until Ctrl-C
async fn listen(url: Option<String>, fetch_history: bool) -> Result<()> {
    let cfg = config::config()?;
    let mut session_config = SessionConfig::from(cfg);
    if let Some(url) = url {
        session_config.backend.mode = BackendMode::Real;
        session_config.backend.ws_url = url;
    }

    let storage: Arc<dyn KeyValueStorage> = Arc::new(open_storage()?);
    let store = load_transcript(storage.clone())?;
    let reconciler = Reconciler::new(store, session_config.echo_window);
    let diagnostics = diagnostics_sink()?;

    let http_base = session_config.backend.http_base.clone();
    match session_config.backend.live_target() {
        Some(target) => info!("Listening on {}", target),
        None => info!("Backend in mock mode; transport stays closed"),
    }

    let session = Session::new(
        session_config,
        reconciler,
        Arc::new(WsConnector::new()),
        diagnostics.clone(),
    );
    let mut updates = session.subscribe_updates();
    let mut intents = session.subscribe_intents();
    let (handle, task) = session.spawn();

    if fetch_history {
        let handle = handle.clone();
        let client = HttpHistoryClient::new(&http_base).with_storage(storage);
        tokio::spawn(async move {
            match client.fetch().await {
                Ok(payload) => {
                    if handle.hydrate(payload).await.is_err() {
                        warn!("Session closed before history arrived");
                    }
                }
                Err(e) => history::record_failure(diagnostics.as_ref(), &e),
            }
        });
    }

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                eprintln!();
                break;
            }
            update = updates.recv() => match update {
                Ok(update) => print_update(&update),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Update stream lagged"),
                Err(RecvError::Closed) => break,
            },
            intent = intents.recv() => match intent {
                Ok(intent) => println!("[intent] {}", intent),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Intent stream lagged"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    let _ = handle.shutdown().await;
    task.await.context("Session task failed")?;
    Ok(())
}

fn print_update(update: &SessionUpdate) {
    match update {
        SessionUpdate::Connectivity { connected, url } => {
            let state = if *connected { "connected" } else { "disconnected" };
            println!("[ws] {} {}", state, url);
        }
        SessionUpdate::Message { message, appended } => {
            let marker = if *appended { "+" } else { "~" };
            println!("{} {}", marker, format_message(message));
        }
        SessionUpdate::Status { agent, status } => {
            println!("[{}] status: {}", agent, status.as_str());
        }
        SessionUpdate::Focus(agent) => println!("[focus] {} ({})", agent, agent.display_name()),
        SessionUpdate::AudioPlaying(playing) => {
            println!("[audio] {}", if *playing { "playing" } else { "stopped" });
        }
        SessionUpdate::Hydrated => println!("[history] restored from backend"),
    }
}

fn format_message(message: &Message) -> String {
    let stamp = if message.created_at == untimed() {
        "-".to_string()
    } else {
        message.created_at.format("%Y-%m-%d %H:%M:%S").to_string()
    };
    let mut line = format!(
        "[{}] {} {}: {}",
        message.agent_id,
        stamp,
        message.role.as_str(),
        message.content
    );
    if !message.attachments.is_empty() {
        line.push_str(&format!(" ({} attachments)", message.attachments.len()));
    }
    if message.meta.pending_reply() {
        line.push_str(" [pending]");
    } else if message.meta.stream_open() {
        line.push_str(" [streaming]");
    }
    line
}

/// Print the persisted transcript
async fn show_transcript(agent: Option<AgentId>, limit: usize) -> Result<()> {
    let storage: Arc<dyn KeyValueStorage> = Arc::new(open_storage()?);
    let store = load_transcript(storage)?;

    let agents = match agent {
        Some(agent) => vec![agent],
        None => AgentId::ALL.to_vec(),
    };

    for agent in agents {
        let messages = store.messages(agent);
        println!("{} ({}) - {} messages", agent, agent.display_name(), messages.len());
        if messages.is_empty() {
            println!("  (empty)");
        }
        let skip = messages.len().saturating_sub(limit);
        for message in &messages[skip..] {
            println!("  {}", format_message(message));
        }
        println!();
    }

    Ok(())
}

/// Record a local user message with a pending reply placeholder
async fn send_local(agent: AgentId, text: &str) -> Result<()> {
    let cfg = config::config()?;
    let storage: Arc<dyn KeyValueStorage> = Arc::new(open_storage()?);
    let store = load_transcript(storage)?;
    let mut reconciler = Reconciler::new(store, cfg.transcript.echo_window());

    let submission = reconciler
        .submit_local(agent, text, Vec::new())
        .context("Nothing to send: message is empty")?;

    println!("Recorded message {} for {}", submission.user_id, agent);
    println!("Pending reply placeholder: {}", submission.placeholder_id);
    Ok(())
}

/// Print the most recent diagnostics
async fn show_events(limit: usize) -> Result<()> {
    let sink = JsonlSink::open_default()?;
    let events = sink.replay()?;

    if events.is_empty() {
        println!("No events recorded at {}", sink.path().display());
        return Ok(());
    }

    let skip = events.len().saturating_sub(limit);
    for event in &events[skip..] {
        println!(
            "{} {:<7} {:<6} [{}] {}: {}",
            event.timestamp.format("%Y-%m-%d %H:%M:%S"),
            format!("{:?}", event.level).to_lowercase(),
            format!("{:?}", event.kind).to_lowercase(),
            event.agent_id,
            event.title,
            event.message
        );
    }

    Ok(())
}

/// Show resolved configuration
async fn show_config() -> Result<()> {
    let cfg = config::config()?;

    println!("sisilink configuration");
    println!();
    println!(
        "Config file: {}",
        cfg.config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!("Storage:     {}", cfg.storage_dir().display());
    println!("Events log:  {}", cfg.events_log_path().display());
    println!();
    print!("{}", serde_yaml::to_string(cfg).context("Failed to render configuration")?);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Role;

    #[test]
    fn test_parse_agent() {
        assert_eq!(parse_agent(" Liuye ").unwrap(), AgentId::Liuye);
        assert!(parse_agent("bob").is_err());
    }

    #[test]
    fn test_cli_parses_send() {
        let cli = Cli::try_parse_from(["sisilink", "send", "liuye", "hello"]).unwrap();
        match cli.command {
            Commands::Send { agent, text } => {
                assert_eq!(agent, AgentId::Liuye);
                assert_eq!(text, "hello");
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_cli_parses_history_sync() {
        let cli = Cli::try_parse_from(["sisilink", "history", "sync"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::History {
                command: history::HistoryCommands::Sync {
                    http_base: None,
                    limit: 320
                }
            }
        ));

        let cli = Cli::try_parse_from(["sisilink", "history", "sync", "--limit", "50"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::History {
                command: history::HistoryCommands::Sync { limit: 50, .. }
            }
        ));
    }

    #[test]
    fn test_format_message_flags() {
        let mut message = Message::new(AgentId::Sisi, Role::Assistant, "");
        message.meta.set_pending_reply(true);
        assert!(format_message(&message).ends_with("[pending]"));
    }

    #[test]
    fn test_format_message_untimed() {
        let mut message = Message::new(AgentId::Liuye, Role::User, "hi");
        message.created_at = untimed();
        assert_eq!(format_message(&message), "[liuye] - user: hi");
    }
}
