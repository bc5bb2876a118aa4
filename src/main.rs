//! Interactive assistant on stdin/stdout.
//!
//! ```bash
//! # Workspace config from ./.aide/aide.json merged over the global one
//! aide
//!
//! # Explicit config file, complete (non-streamed) answers
//! aide --config ./aide.json --no-stream
//!
//! # Verbose logging
//! RUST_LOG=aide=debug aide
//! ```

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use aide::adapters::build_backend;
use aide::adapters::tools::{register_builtin, spawn_reminder_watcher, ReminderStore};
use aide::config::{AiConfig, ConfigManager};
use aide::{event_types, logging, ConversationTurn, EventBus, Message, Orchestrator, OrchestratorSettings};
use aide::{ResponseChunk, ToolRegistry};
use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

const REMINDER_CHECK_INTERVAL: Duration = Duration::from_secs(30);
const CHUNK_POLL: Duration = Duration::from_millis(100);

/// Personal assistant with tool calling
#[derive(Parser, Debug)]
#[command(name = "aide")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file; skips the global and workspace files
    #[arg(short = 'c', long, env = "AIDE_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Workspace whose .aide/aide.json is merged over the global config
    #[arg(short = 'w', long, value_name = "DIR")]
    workspace: Option<PathBuf>,

    /// Wait for complete answers instead of streaming them
    #[arg(long)]
    no_stream: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, env = "AIDE_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

fn print_chunks(orch: Orchestrator) {
    let mut stdout = std::io::stdout();
    loop {
        match orch.next_chunk(CHUNK_POLL) {
            Some(ResponseChunk::Text(text)) => {
                let _ = write!(stdout, "{text}");
                let _ = stdout.flush();
            }
            Some(ResponseChunk::EndOfStream) => break,
            None => {}
        }
    }
    let _ = writeln!(stdout);
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    logging::init(&args.log_level);

    let mut manager = ConfigManager::new();
    match &args.config {
        Some(path) => manager
            .load_file(path)
            .with_context(|| format!("Failed to load config {path:?}"))?,
        None => {
            let workspace = args.workspace.clone().or_else(|| std::env::current_dir().ok());
            manager
                .load(workspace.as_deref())
                .context("Failed to load configuration")?;
        }
    }

    let mut config = manager.config().clone();
    if args.no_stream {
        let mut ai: AiConfig = config.ai();
        ai.stream_response = false;
        config.ai = Some(ai);
    }
    config.validate();

    let bus = Arc::new(EventBus::new(&config.event_bus()));
    let reminders = Arc::new(ReminderStore::new());

    let tools = config.tools();
    let mut registry = ToolRegistry::with_duplicate_rejection(tools.reject_duplicates);
    register_builtin(&mut registry, &tools, &reminders).context("Failed to register tools")?;

    let backend = build_backend(&config).context("Failed to set up the model backend")?;
    let settings = OrchestratorSettings::from_config(&config);
    let window = settings.context_window_size;
    let orch = Orchestrator::new(backend, registry, Arc::clone(&bus), settings);

    bus.subscribe(event_types::REMINDER_DUE, |event| {
        let title = event.get("title").and_then(|v| v.as_str()).unwrap_or_default();
        let description = event.get("description").and_then(|v| v.as_str()).unwrap_or_default();
        println!("\n[reminder] {title} {description}");
        Ok(())
    });
    let watcher = spawn_reminder_watcher(Arc::clone(&reminders), Arc::clone(&bus), REMINDER_CHECK_INTERVAL);

    let name = config.assistant().name;
    info!(assistant = %name, streaming = orch.is_streaming(), "Assistant started");
    println!("{name} is ready. Type 'exit' to quit.");

    let mut history: Vec<Message> = Vec::new();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        let _ = std::io::stdout().flush();

        let Some(line) = lines.next_line().await.context("Failed to read stdin")? else {
            break;
        };
        let text = line.trim();
        if text.is_empty() {
            continue;
        }
        if matches!(text.to_lowercase().as_str(), "exit" | "quit" | "salir") {
            break;
        }

        history.push(Message::user(text));
        let turn = ConversationTurn::new(text).with_history(history.clone());

        let outcome = if orch.is_streaming() {
            let printer = tokio::task::spawn_blocking({
                let orch = orch.clone();
                move || print_chunks(orch)
            });
            let outcome = orch.spawn(turn).await.context("Turn task failed")?;
            printer.await.context("Chunk printer failed")?;
            if outcome.error.is_some() {
                println!("{}", outcome.answer);
            }
            outcome
        } else {
            let outcome = orch.process(turn).await;
            println!("{}", outcome.answer);
            outcome
        };

        if let Some(error) = &outcome.error {
            warn!(error = %error, "Turn failed");
        }
        history.push(Message::assistant(outcome.answer));
        let keep = window.saturating_mul(2);
        if history.len() > keep {
            history.drain(..history.len() - keep);
        }
    }

    watcher.abort();
    bus.shutdown();
    info!("Assistant stopped");
    Ok(())
}
