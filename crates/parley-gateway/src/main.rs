#![allow(clippy::print_stdout, clippy::print_stderr)] // CLI binary: stdout is the UI

mod agent;
mod cli;
mod config;
mod conversation_cache;
mod orchestrator;
mod tracing_setup;
mod trigger;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use parley_channels::terminal_pair;
use parley_core::{Channel, ChatLog, ConversationKey, TurnReconstructor, TurnStore};
use parley_memory::{ChatLogWindow, SqliteStore};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, info, info_span, warn};

use crate::agent::EchoAgent;
use crate::cli::{Cli, Commands};
use crate::config::Config;
use crate::conversation_cache::ConversationCache;
use crate::orchestrator::{Orchestrator, ReplyHandler, Scheduler};
use crate::trigger::Triggers;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _tracing_guard = tracing_setup::init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = std::process::id(),
        "parley starting"
    );

    let config = cli.config.as_deref();
    match cli.command {
        Commands::Start {
            conversation,
            sender,
        } => cmd_start(config, &conversation, &sender).await,
        Commands::Turns { key, limit } => cmd_turns(config, &key, limit).await,
        Commands::ChatLog { key, minutes } => cmd_chat_log(config, &key, minutes).await,
        Commands::Check => cmd_check(config),
        Commands::Version => {
            println!("parley {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

/// Load and validate config, then open the store it points at.
fn open_store(config_path: Option<&str>) -> Result<(Config, Arc<SqliteStore>)> {
    let (config, config_file) = Config::load_or_default(config_path)?;
    config.validate()?;

    let config_dir = config_file
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    let db_path = config.resolve_db_path(config_dir);
    let store = SqliteStore::open(&db_path)
        .with_context(|| format!("failed to open turn store at {}", db_path.display()))?;
    Ok((config, Arc::new(store)))
}

fn parse_key(key: &str) -> Result<ConversationKey> {
    key.parse()
        .with_context(|| format!("expected `group:<id>` or `dm:<id>`, got '{key}'"))
}

fn cmd_check(config_path: Option<&str>) -> Result<()> {
    let (config, store) = open_store(config_path)?;
    Triggers::from_config(&config)?;

    println!("config ok");
    println!("  agent:         {}", config.agent.id);
    println!("  batch delay:   {}ms", config.scheduler.batch_delay_ms);
    println!("  max keys:      {}", config.scheduler.max_keys);
    println!("  history turns: {}", config.memory.history_turns);
    println!("  cached convs:  {}", config.memory.max_conversations);
    println!("  conversations: {}", config.conversations.len());
    println!("  database:      {}", store.path().display());
    Ok(())
}

async fn cmd_turns(config_path: Option<&str>, key: &str, limit: usize) -> Result<()> {
    let key = parse_key(key)?;
    let (_config, store) = open_store(config_path)?;
    let reconstructor = TurnReconstructor::new(store as Arc<dyn TurnStore>);

    let turns = reconstructor.reconstruct(&key, limit).await?;
    if turns.is_empty() {
        println!("no turns recorded for {key}");
        return Ok(());
    }

    for turn in &turns {
        let run = turn.run_id().map_or("(orphan)", |run| run.as_str());
        println!("--- {run} @ {}", turn.started_at().to_rfc3339());
        for record in turn.records() {
            let actor = record.actor_id.as_deref().unwrap_or("-");
            println!("{:>8} {actor}: {}", record.kind.as_str(), record.text());
        }
    }
    Ok(())
}

async fn cmd_chat_log(config_path: Option<&str>, key: &str, minutes: Option<u32>) -> Result<()> {
    let key = parse_key(key)?;
    let (_config, store) = open_store(config_path)?;

    let window = ChatLogWindow::minutes(minutes);
    let (start, end) = window.bounds(Utc::now());
    let entries = store.recent(&key, start, end).await?;
    if entries.is_empty() {
        println!(
            "no messages in {key} during the last {} minutes",
            window.as_minutes()
        );
        return Ok(());
    }

    for entry in entries {
        println!(
            "{} {:>8} {}: {}",
            entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
            entry.direction.as_str(),
            entry.actor_id,
            entry.content
        );
    }
    Ok(())
}

async fn cmd_start(config_path: Option<&str>, conversation: &str, sender: &str) -> Result<()> {
    let default_key = parse_key(conversation)?;
    let (config, store) = open_store(config_path)?;
    let triggers = Triggers::from_config(&config)?;
    let history_turns = config.memory.history_turns;

    let cache = Arc::new(ConversationCache::new(
        history_turns,
        config.memory.max_conversations,
    ));
    if config.memory.warm_on_start {
        warm_cache(&cache, &store, history_turns).await;
    }

    let (mut channel, handle) = terminal_pair(64, default_key, sender);
    let handler = ReplyHandler::new(
        Arc::new(EchoAgent::new(config.agent.id.clone())),
        Arc::clone(&store) as Arc<dyn TurnStore>,
        Arc::clone(&store) as Arc<dyn ChatLog>,
        cache,
        channel.outbound(),
        history_turns,
    );
    let scheduler = Scheduler::new(Arc::new(handler), config.scheduler.batcher_config());
    let orchestrator = Orchestrator::new(scheduler, triggers, store as Arc<dyn ChatLog>);

    let console_tx = handle.tx;
    let mut console_rx = handle.rx;

    tokio::spawn(
        async move {
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if console_tx.send(line).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(error) => {
                        warn!(error = %error, "failed to read stdin");
                        break;
                    }
                }
            }
        }
        .instrument(info_span!("stdin_reader")),
    );

    let printer = tokio::spawn(async move {
        while let Some(line) = console_rx.recv().await {
            println!("{line}");
        }
    });

    info!(
        agent = %config.agent.id,
        batch_delay_ms = config.scheduler.batch_delay_ms,
        "gateway started"
    );
    eprintln!("parley is listening; type `group:<id> <name>: text` or plain text, Ctrl-C to quit");

    let shutdown_token = CancellationToken::new();
    tokio::select! {
        result = orchestrator.run(&mut channel, shutdown_token.clone()) => {
            if let Err(error) = result {
                info!(error = %format!("{error:#}"), "inbound loop ended");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
        }
    }

    shutdown_token.cancel();
    let flushed = orchestrator.shutdown().await;
    info!(
        flushed,
        conversations = orchestrator.scheduler().key_count(),
        "pending batches flushed"
    );

    // Let replies already handed to the sink reach stdout.
    drop(orchestrator);
    drop(channel);
    if tokio::time::timeout(Duration::from_secs(1), printer)
        .await
        .is_err()
    {
        warn!("timed out flushing replies");
    }
    Ok(())
}

async fn warm_cache(cache: &ConversationCache, store: &Arc<SqliteStore>, history_turns: usize) {
    let keys = match store.conversations().await {
        Ok(keys) => keys,
        Err(error) => {
            warn!(error = %format!("{error:#}"), "skipping history warm-up");
            return;
        }
    };

    let reconstructor = TurnReconstructor::new(Arc::clone(store) as Arc<dyn TurnStore>);
    let reconstructor = &reconstructor;
    cache
        .warm(keys, |key| async move {
            reconstructor.reconstruct(&key, history_turns).await
        })
        .await;
}
