//! # kbase CLI
//!
//! The `kbase` binary is the operator interface to the knowledge-base
//! engine: database initialization, document ingestion, retrieval,
//! consistency checks and repair, and the HTTP server.
//!
//! ## Usage
//!
//! ```bash
//! kbase --config ./kbase.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `kbase init` | Create the SQLite catalog and run schema migrations |
//! | `kbase ingest <file>` | Extract, chunk, embed, and index a document |
//! | `kbase list` | List cataloged documents |
//! | `kbase query "<question>"` | Hybrid retrieval over the knowledge base |
//! | `kbase delete <id>` | Delete a document |
//! | `kbase check` | Print the consistency report |
//! | `kbase rebuild` | Rebuild the index from stored files |
//! | `kbase clear` | Wipe the knowledge base |
//! | `kbase serve` | Start the HTTP server |

mod cache;
mod catalog;
mod chunker;
mod config;
mod db;
mod embedding;
mod engine;
mod error;
mod extract;
mod index;
mod lifecycle;
mod mapping;
mod migrate;
mod models;
mod server;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use crate::engine::{Engine, UploadRequest};

/// kbase, a retrieval and index-consistency engine for document
/// knowledge bases.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/kbase.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "kbase",
    about = "A retrieval and index-consistency engine for document knowledge bases",
    version,
    long_about = "kbase ingests documents (plain text, Markdown, PDF, DOCX), chunks and embeds \
    them into an append-only vector index with a slot mapping store, and answers questions via \
    hybrid retrieval. The catalog, index, and mappings are verified on startup and repairable \
    when artifacts are damaged."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./kbase.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the catalog database.
    ///
    /// Creates the SQLite database file and the documents table. Idempotent,
    /// running it multiple times is safe.
    Init,

    /// Ingest a document from the local filesystem.
    ///
    /// Extracts text, chunks it, embeds the chunks, and appends them to the
    /// vector index. Requires an embedding provider to be configured.
    Ingest {
        /// Path to the document (`.txt`, `.md`, `.pdf`, `.docx`).
        file: PathBuf,

        /// Owner user id recorded on the catalog row.
        #[arg(long, default_value_t = 0)]
        user: i64,

        /// Display name shown instead of the file name.
        #[arg(long)]
        name: Option<String>,
    },

    /// List cataloged documents.
    List {
        /// Only list documents owned by this user id.
        #[arg(long)]
        user: Option<i64>,
    },

    /// Ask a question over the knowledge base.
    Query {
        /// The question text.
        question: String,

        /// Maximum number of chunks to return.
        #[arg(long)]
        top_k: Option<usize>,
    },

    /// Delete a document by id.
    Delete {
        /// Document id (UUID).
        id: String,
    },

    /// Print the consistency report.
    ///
    /// Read-only: compares the catalog, mapping store, and index and lists
    /// any disagreements.
    Check,

    /// Rebuild the index from stored files.
    ///
    /// Re-extracts, re-chunks, and re-embeds every processed document,
    /// compacting holes left by deletions. Rows whose stored file is gone
    /// are marked failed.
    Rebuild,

    /// Wipe the knowledge base: catalog rows, index, mappings, stored files.
    Clear {
        /// Skip the confirmation prompt.
        #[arg(long)]
        yes: bool,
    },

    /// Start the HTTP server.
    ///
    /// Binds to the address configured in `[server].bind`.
    Serve,
}

async fn open_engine(cfg: &config::Config) -> anyhow::Result<Arc<Engine>> {
    migrate::run_migrations(cfg).await?;
    let pool = db::connect(cfg).await?;
    let embedder = embedding::create_embedder(&cfg.embedding)?;
    let engine = Engine::open(cfg.clone(), pool, embedder).await?;
    Ok(Arc::new(engine))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Ingest { file, user, name } => {
            let bytes = std::fs::read(&file)?;
            let filename = file
                .file_name()
                .and_then(|n| n.to_str())
                .ok_or_else(|| anyhow::anyhow!("invalid file name: {}", file.display()))?
                .to_string();

            let engine = open_engine(&cfg).await?;
            let receipt = engine
                .ingest(UploadRequest {
                    user_id: user,
                    filename,
                    bytes,
                    display_name: name,
                })
                .await?;
            println!(
                "Ingested {} ({} chunks) as document {}",
                file.display(),
                receipt.chunk_count,
                receipt.document_id
            );
        }
        Commands::List { user } => {
            let engine = open_engine(&cfg).await?;
            let records = match user {
                Some(user_id) => engine.list_documents(user_id, false).await?,
                None => engine.list_documents(0, true).await?,
            };
            if records.is_empty() {
                println!("No documents.");
            }
            for r in records {
                println!(
                    "{}  {:<10}  {:>5} chunks  user {}  {}",
                    r.id,
                    r.status.as_str(),
                    r.chunk_count,
                    r.user_id,
                    r.shown_name()
                );
            }
        }
        Commands::Query { question, top_k } => {
            let engine = open_engine(&cfg).await?;
            let outcome = engine.query(&question, top_k).await?;
            if outcome.relevant_chunks.is_empty() {
                println!("No chunks above the relevance threshold.");
            }
            for (i, chunk) in outcome.relevant_chunks.iter().enumerate() {
                println!("--- [{}] score {:.3} ---", i + 1, chunk.score);
                println!("{}", chunk.text);
            }
            if outcome.cached {
                println!("(cached)");
            }
        }
        Commands::Delete { id } => {
            let engine = open_engine(&cfg).await?;
            engine.delete_document(&id, 0, true).await?;
            println!("Deleted document {}", id);
        }
        Commands::Check => {
            let engine = open_engine(&cfg).await?;
            let report = engine.consistency_report().await?;
            println!(
                "Index: {} slots ({} mapped, {} orphaned), {} chunk texts",
                report.index_len, report.mapped_slots, report.orphaned_slots, report.chunk_entries
            );
            println!(
                "Catalog: {} rows ({} processed, {} processing, {} failed)",
                report.document_rows, report.processed, report.processing, report.failed
            );
            println!("Valid documents: {}", report.valid_documents.len());
            for doc in &report.invalid_documents {
                println!("  INVALID {}: {}", doc.document_id, doc.reason);
            }
            for anomaly in &report.anomalies {
                println!("  ANOMALY: {}", anomaly);
            }
            if report.consistent {
                println!("Consistent.");
            } else {
                println!("INCONSISTENT. Run `kbase rebuild` to repair.");
                std::process::exit(1);
            }
        }
        Commands::Rebuild => {
            let engine = open_engine(&cfg).await?;
            let summary = engine.rebuild_from_catalog().await?;
            println!("Rebuilt {} documents.", summary.rebuilt.len());
            for doc in &summary.failed {
                println!("  FAILED {}: {}", doc.document_id, doc.reason);
            }
        }
        Commands::Clear { yes } => {
            if !yes {
                println!("This deletes every document, the index, and all stored files.");
                println!("Re-run with --yes to confirm.");
                return Ok(());
            }
            let engine = open_engine(&cfg).await?;
            let removed = engine.clear_all().await?;
            println!("Cleared {} documents.", removed);
        }
        Commands::Serve => {
            let engine = open_engine(&cfg).await?;
            server::run_server(engine).await?;
        }
    }

    Ok(())
}
