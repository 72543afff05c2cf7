//! # Kedro RAG CLI (`kedro-rag`)
//!
//! ## Usage
//!
//! ```bash
//! kedro-rag --config ./config/kedro-rag.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `kedro-rag init` | Create the index file and schema |
//! | `kedro-rag sources` | List configured sources and index counts |
//! | `kedro-rag channels` | List Slack channels visible to the bot |
//! | `kedro-rag sync <source>` | Ingest `docs`, `slack`, or `all` |
//! | `kedro-rag search "<query>"` | Query the knowledge base |
//! | `kedro-rag get <id>` | Show a document and its chunks |
//! | `kedro-rag stats` | Index statistics |
//! | `kedro-rag purge` | Remove the documents of a source |
//! | `kedro-rag rebuild` | Discard the index and re-ingest every source |
//! | `kedro-rag serve mcp` | MCP server on stdio |
//! | `kedro-rag serve http` | JSON + MCP Streamable HTTP server |
//!
//! Logs go to stderr (`RUST_LOG`, default `info`); results go to stdout.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use kedro_rag::config::{self, Config};
use kedro_rag::error::error_body;
use kedro_rag::kb::KnowledgeBase;
use kedro_rag::store::KnowledgeStore;
use kedro_rag::{get, ingest, mcp, search, server, sources, stats};

/// Kedro RAG: an incremental knowledge base over the Kedro docs and
/// community Slack, served to AI assistants over MCP.
///
/// Settings come from a TOML file (default `./config/kedro-rag.toml`, optional)
/// and the environment: `KEDRO_RAG_INDEX_PATH`, `KEDRO_RAG_DOCS_URL`,
/// `SLACK_BOT_TOKEN`, `KEDRO_RAG_SLACK_CHANNELS`, `OPENAI_API_KEY`.
#[derive(Parser)]
#[command(name = "kedro-rag", version)]
struct Cli {
    /// Path to the settings file (TOML). Must exist when given.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the index file and schema. Idempotent.
    Init,

    /// List configured sources with document counts and last run.
    Sources,

    /// List Slack channels visible to the bot and its membership.
    Channels,

    /// Fetch a source and incrementally update the index.
    Sync {
        /// `docs`, `slack`, or `all`.
        source: String,

        /// Count what would change without writing.
        #[arg(long)]
        dry_run: bool,

        /// Slack: only the last N days of history.
        #[arg(long)]
        days_back: Option<u32>,

        /// Slack: channel id or name (repeatable), instead of the configured list.
        #[arg(long = "channel")]
        channels: Vec<String>,
    },

    /// Query the knowledge base.
    Search {
        query: String,

        /// `documentation` or `chat`.
        #[arg(long)]
        kind: Option<String>,

        /// Doc section path or Slack channel id.
        #[arg(long)]
        origin: Option<String>,

        /// Number of results.
        #[arg(short, long)]
        k: Option<usize>,
    },

    /// Show a document and its chunks.
    Get { id: String },

    /// Index statistics.
    Stats,

    /// Remove the documents of one source, or of all sources.
    Purge {
        /// Source name; omit to purge everything.
        #[arg(long)]
        source: Option<String>,
    },

    /// Discard the index and re-ingest every configured source.
    Rebuild,

    /// Serve the tools to an assistant.
    Serve {
        #[command(subcommand)]
        service: ServeService,
    },
}

#[derive(Subcommand)]
enum ServeService {
    /// MCP over stdin/stdout.
    Mcp,
    /// JSON API and MCP Streamable HTTP on `[server].bind`.
    Http,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        let body = error_body(&e);
        eprintln!("error [{}]: {}", body.kind, body.message);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let cfg = config::load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Init => {
            let store = KnowledgeStore::open_writer(&cfg.index.path).await?;
            store.close().await;
            println!("Index initialized at {}.", cfg.index.path.display());
        }
        Commands::Sources => {
            sources::list_sources(&cfg).await?;
        }
        Commands::Channels => {
            run_channels(cfg).await?;
        }
        Commands::Sync {
            source,
            dry_run,
            days_back,
            channels,
        } => {
            ingest::run_sync(&cfg, &source, dry_run, days_back, channels).await?;
        }
        Commands::Search {
            query,
            kind,
            origin,
            k,
        } => {
            search::run_search(&cfg, &query, kind, origin, k).await?;
        }
        Commands::Get { id } => {
            get::run_get(&cfg, &id).await?;
        }
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
        Commands::Purge { source } => {
            let kb = KnowledgeBase::new(cfg)?;
            let report = kb.purge(source.as_deref()).await?;
            println!(
                "purged {} document(s) from {}",
                report.documents_removed,
                report.source.as_deref().unwrap_or("all sources")
            );
        }
        Commands::Rebuild => {
            let kb = KnowledgeBase::new(cfg)?;
            let reports = kb.rebuild().await?;
            for r in &reports {
                println!(
                    "rebuilt {}: {} document(s), {} chunk(s), {} failed",
                    r.source,
                    r.added,
                    r.chunks_written,
                    r.failed.len()
                );
            }
            if reports.is_empty() {
                println!("index reset; no sources are configured");
            }
            kb.shutdown().await;
        }
        Commands::Serve { service } => {
            let kb = Arc::new(KnowledgeBase::new(cfg)?);
            match service {
                ServeService::Mcp => mcp::run_stdio(kb).await?,
                ServeService::Http => server::run_server(kb).await?,
            }
        }
    }

    Ok(())
}

async fn run_channels(cfg: Config) -> anyhow::Result<()> {
    let kb = KnowledgeBase::new(cfg)?;
    let channels = kb.list_channels().await?;
    println!(
        "{:<12} {:<28} {:<7} {:>7}",
        "ID", "NAME", "MEMBER", "MEMBERS"
    );
    for c in &channels {
        println!(
            "{:<12} {:<28} {:<7} {:>7}",
            c.id,
            format!("#{}", c.name),
            if c.is_member { "yes" } else { "no" },
            c.num_members.map(|n| n.to_string()).unwrap_or_default()
        );
    }
    Ok(())
}
