//! usagesync - count user-initiated LLM requests and sync them to a counter service
//!
//! Commands:
//! - `run`: track observations read from stdin (one JSON object per line)
//! - `status`: show local sync state and server totals
//! - `flush`: handshake and push pending counts now
//! - `clear`: discard pending counts
//! - `classify`: show how one request would be classified
//!
//! Uses XDG Base Directory specification for file locations:
//! - State store: $XDG_DATA_HOME/usagesync/state.db (~/.local/share/usagesync/state.db)
//! - Logs: $XDG_STATE_HOME/usagesync/usagesync.log (~/.local/state/usagesync/usagesync.log)
//! - Config: $XDG_CONFIG_HOME/usagesync/config.toml (~/.config/usagesync/config.toml)

mod process_lock;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use usagesync_core::store::{self, CLIENT_ID_KEY, SEQ_KEY};
use usagesync_core::{
    Config, CounterTransport, FlushOutcome, HandshakeOutcome, HttpTransport, Observation,
    PendingAggregator, RuleSet, SqliteStore, SyncEngine, Tracker,
};

use crate::process_lock::acquire_writer_guard;

#[derive(Parser)]
#[command(name = "usagesync")]
#[command(about = "Count LLM sends and sync them to a counter service")]
#[command(version)]
struct Args {
    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Track observations read from stdin as JSON lines ({"method","url","scope"})
    Run,

    /// Show local sync state and server totals
    Status {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Handshake with the server and push pending counts now
    Flush,

    /// Discard all pending counts
    Clear,

    /// Classify a single request against the active rules
    Classify {
        /// HTTP method
        method: String,
        /// Full request URL
        url: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Ensure XDG environment variables are set before using core library
    Config::ensure_xdg_env();

    let config = Config::load().context("failed to load configuration")?;

    let _log_guard =
        usagesync_core::logging::init(&config.logging).context("failed to initialize logging")?;

    match args.command {
        Command::Run => cmd_run(&config, args.verbose).await,
        Command::Status { json } => cmd_status(&config, json).await,
        Command::Flush => cmd_flush(&config).await,
        Command::Clear => cmd_clear(),
        Command::Classify { method, url } => cmd_classify(&config, &method, &url),
    }
}

fn open_store() -> Result<Arc<SqliteStore>> {
    let store_path = Config::store_path();
    tracing::info!(path = %store_path.display(), "Opening state store");
    let store = SqliteStore::open(&store_path).context("failed to open state store")?;
    Ok(Arc::new(store))
}

fn http_transport(config: &Config) -> Result<Arc<HttpTransport>> {
    if !config.collector.is_ready() {
        anyhow::bail!(
            "collector is not configured; set [collector] enabled and server_url in {}",
            Config::config_path().display()
        );
    }
    let transport = HttpTransport::new(&config.collector).context("failed to create HTTP client")?;
    Ok(Arc::new(transport))
}

async fn cmd_run(config: &Config, verbose: bool) -> Result<()> {
    let _guard = acquire_writer_guard(&Config::store_path())?;

    let transport = http_transport(config)?;
    let store = open_store()?;
    let rules = RuleSet::load(config.rules.as_ref()).context("failed to load rules")?;

    let tracker = Tracker::start(&config.tracking, store, transport, rules)
        .context("failed to start tracker")?;
    tracing::info!(client_id = %tracker.client_id(), "usagesync run starting");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                tracing::info!("Interrupted, shutting down");
                break;
            }
            line = lines.next_line() => {
                let Some(line) = line.context("failed to read stdin")? else {
                    break;
                };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }

                let observation: Observation = match serde_json::from_str(line) {
                    Ok(observation) => observation,
                    Err(e) => {
                        tracing::warn!(error = %e, "Skipping malformed observation");
                        eprintln!("skipping malformed line: {}", e);
                        continue;
                    }
                };

                let decision = tracker
                    .observe(observation.clone())
                    .await
                    .context("failed to record observation")?;
                if verbose {
                    eprintln!("{} {} {}", decision, observation.method, observation.url);
                }
            }
        }
    }

    let status = tracker.shutdown().await.context("failed to drain tracker")?;
    tracing::info!(
        seq = status.seq,
        pending = status.pending_total(),
        "usagesync run finished"
    );
    println!(
        "{}",
        serde_json::to_string_pretty(&status).context("failed to render status")?
    );
    Ok(())
}

async fn cmd_status(config: &Config, json: bool) -> Result<()> {
    let store = open_store()?;

    let client_id: Option<String> =
        store::get_json(&*store, CLIENT_ID_KEY).context("failed to read client id")?;
    let seq: u64 = store::get_json(&*store, SEQ_KEY)
        .context("failed to read seq")?
        .unwrap_or(0);
    let pending = PendingAggregator::load(store.clone())
        .context("failed to read pending counts")?
        .snapshot()?;

    let server = match (&client_id, config.collector.is_ready()) {
        (Some(client_id), true) => {
            let transport = http_transport(config)?;
            match transport.counters(client_id).await {
                Ok(counters) => Some(counters),
                Err(e) => {
                    tracing::warn!(error = %e, "Server counters unavailable");
                    None
                }
            }
        }
        _ => None,
    };

    if json {
        let body = serde_json::json!({
            "client_id": client_id,
            "seq": seq,
            "pending": pending,
            "server": server,
        });
        println!("{}", serde_json::to_string_pretty(&body)?);
        return Ok(());
    }

    println!("usagesync status");
    println!("================");
    println!();
    println!(
        "Client ID:       {}",
        client_id.as_deref().unwrap_or("<not created>")
    );
    println!("Last seq:        {}", seq);
    println!("Pending:         {}", pending.values().sum::<u64>());
    for (host, count) in &pending {
        println!("  {:<40} {}", host, count);
    }

    println!();
    match server {
        Some(counters) => {
            println!("Server totals:");
            for (host, count) in &counters {
                println!("  {:<40} {}", host, count);
            }
        }
        None if config.collector.is_ready() => println!("Server totals:   unavailable"),
        None => println!("Server totals:   collector not configured"),
    }

    Ok(())
}

async fn cmd_flush(config: &Config) -> Result<()> {
    let _guard = acquire_writer_guard(&Config::store_path())?;

    let transport = http_transport(config)?;
    let store = open_store()?;
    let engine = SyncEngine::open(store.clone(), transport).context("failed to open sync state")?;
    let pending =
        Arc::new(PendingAggregator::load(store).context("failed to read pending counts")?);

    match engine.handshake().await? {
        HandshakeOutcome::Synced { last_seq, .. } => println!("Handshake: server seq {}", last_seq),
        HandshakeOutcome::Failed { reason } => println!("Handshake failed: {}", reason),
    }

    let mut attempts = 0;
    loop {
        match engine.flush(&pending).await? {
            FlushOutcome::Empty => {
                println!("Nothing pending");
                return Ok(());
            }
            FlushOutcome::Applied { seq, sent } => {
                println!(
                    "Pushed {} count(s) across {} host(s), seq {}",
                    sent.values().sum::<u64>(),
                    sent.len(),
                    seq
                );
                return Ok(());
            }
            FlushOutcome::Conflict {
                expected_next,
                realigned_seq,
            } => {
                attempts += 1;
                if attempts > config.tracking.max_conflict_retries {
                    anyhow::bail!(
                        "server kept rejecting the sequence number (expected {})",
                        expected_next
                    );
                }
                println!("Sequence realigned to {}, retrying", realigned_seq);
            }
            FlushOutcome::Failed { reason } => {
                anyhow::bail!("flush failed, counts remain pending: {}", reason);
            }
        }
    }
}

fn cmd_clear() -> Result<()> {
    let _guard = acquire_writer_guard(&Config::store_path())?;

    let store = open_store()?;
    let pending = PendingAggregator::load(store).context("failed to read pending counts")?;
    let discarded: u64 = pending.snapshot()?.values().sum();
    pending.clear().context("failed to clear pending counts")?;

    tracing::info!(discarded, "Pending counts cleared");
    println!("Discarded {} pending count(s)", discarded);
    Ok(())
}

fn cmd_classify(config: &Config, method: &str, url: &str) -> Result<()> {
    let rules = RuleSet::load(config.rules.as_ref()).context("failed to load rules")?;
    println!("{}", rules.classify_str(method, url));
    Ok(())
}
