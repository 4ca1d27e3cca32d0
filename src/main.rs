//! # agent-rag CLI
//!
//! Ingests per-agent document directories into vector collections and
//! serves retrieval over HTTP.
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `agent-rag init` | Create the SQLite database and run schema migrations |
//! | `agent-rag serve` | Start the HTTP server |
//! | `agent-rag ingest <agent>` | Rebuild an agent's collection in the foreground |
//! | `agent-rag query <agent> "<prompt>"` | Print the chunks most similar to a prompt |
//! | `agent-rag status <agent>` | Show the agent's ingestion job record |
//! | `agent-rag delete <agent>` | Drop the agent's collection and job record |
//! | `agent-rag outbox dead` | List status notifications that gave up |
//! | `agent-rag outbox retry <id>` | Re-arm a dead notification |
//! | `agent-rag outbox flush` | Deliver every due notification now |
//!
//! Logs go to stderr (`RUST_LOG`, default `info`); command output goes to
//! stdout.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use agent_rag::config;
use agent_rag::db;
use agent_rag::migrate;
use agent_rag::server;
use agent_rag::services::Services;

#[derive(Parser)]
#[command(
    name = "agent-rag",
    about = "Per-agent document ingestion and retrieval service",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/agent-rag.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run repeatedly.
    Init,

    /// Start the HTTP server.
    Serve,

    /// Re-read an agent's documents and rebuild its collection.
    Ingest {
        agent: String,
    },

    /// Retrieve the chunks most similar to a prompt.
    Query {
        agent: String,
        prompt: String,

        /// Number of results (defaults to `[retrieval] top_k`).
        #[arg(long)]
        top_k: Option<usize>,
    },

    /// Show an agent's ingestion job record.
    Status {
        agent: String,
    },

    /// Delete an agent's collection and job record.
    Delete {
        agent: String,
    },

    /// Inspect and drive the status notification outbox.
    Outbox {
        #[command(subcommand)]
        action: OutboxAction,
    },
}

#[derive(Subcommand)]
enum OutboxAction {
    /// List notifications that exhausted their retries.
    Dead,
    /// Re-arm a dead notification for delivery.
    Retry { id: i64 },
    /// Attempt delivery of every due notification once.
    Flush,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            let pool = db::connect(&cfg).await?;
            migrate::run_migrations(&pool).await?;
            println!("Database initialized successfully.");
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
        Commands::Ingest { agent } => {
            let services = Services::open(cfg).await?;
            let result = services.ingestor.run(&agent).await;
            // Deliver the queued outcome right away; the server's worker
            // retries whatever is left.
            if let Err(e) = services.outbox.deliver_due(services.notifier.as_ref()).await {
                tracing::warn!(error = %e, "status notification not delivered");
            }
            let report = result.with_context(|| format!("ingestion of agent {} failed", agent))?;
            println!("ingest {}", report.agent);
            println!("  documents: {}", report.documents);
            println!("  chunks: {}", report.chunks);
            println!("  generation: {}", report.generation);
            println!("  fingerprint: {}", report.fingerprint);
            println!("  elapsed: {} ms", report.elapsed.as_millis());
            println!("ok");
        }
        Commands::Query {
            agent,
            prompt,
            top_k,
        } => {
            let services = Services::open(cfg).await?;
            let hits = services
                .retriever
                .retrieve_scored(&agent, &prompt, top_k)
                .await?;
            if hits.is_empty() {
                println!("No results.");
            }
            for (i, hit) in hits.iter().enumerate() {
                println!("{}. [{:.4}] {}", i + 1, hit.score, hit.id);
                println!("   {}", hit.text.replace('\n', " "));
            }
        }
        Commands::Status { agent } => {
            let services = Services::open(cfg).await?;
            let record = services.ingestor.status(&agent).await?;
            println!("agent: {}", record.agent_name);
            println!("  state: {}", record.state);
            println!("  attempts: {}", record.attempt_count);
            if let Some(t) = record.started_at {
                println!("  started: {}", t.to_rfc3339());
            }
            if let Some(t) = record.finished_at {
                println!("  finished: {}", t.to_rfc3339());
            }
            if let Some(err) = &record.last_error {
                println!("  last error: {}", err);
            }
            match services.index.info(&agent).await? {
                Some(info) => {
                    println!("  collection: {} ({})", info.name, info.physical);
                    println!("  chunks: {}", info.size);
                    println!("  built: {}", info.created_at.to_rfc3339());
                }
                None => println!("  collection: none"),
            }
        }
        Commands::Delete { agent } => {
            let services = Services::open(cfg).await?;
            if services.ingestor.delete_agent(&agent).await? {
                println!("deleted collection for agent {}", agent);
            } else {
                println!("agent {} had no collection", agent);
            }
        }
        Commands::Outbox { action } => {
            let services = Services::open(cfg).await?;
            match action {
                OutboxAction::Dead => {
                    let entries = services.outbox.dead_letters().await?;
                    if entries.is_empty() {
                        println!("No dead notifications.");
                    }
                    for e in entries {
                        println!(
                            "{}  {}  {}  attempts={}  {}",
                            e.id,
                            e.agent_name,
                            e.status,
                            e.attempts,
                            e.last_error.as_deref().unwrap_or("")
                        );
                    }
                }
                OutboxAction::Retry { id } => {
                    if !services.outbox.requeue(id).await? {
                        bail!("no dead outbox entry with id {}", id);
                    }
                    println!("requeued {}", id);
                }
                OutboxAction::Flush => {
                    let report = services
                        .outbox
                        .deliver_due(services.notifier.as_ref())
                        .await?;
                    println!("outbox flush");
                    println!("  delivered: {}", report.delivered);
                    println!("  retried: {}", report.retried);
                    println!("  dead: {}", report.dead);
                    println!("ok");
                }
            }
        }
    }

    Ok(())
}
