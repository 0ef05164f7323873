//! # docchat CLI
//!
//! The `docchat` binary runs the HTTP API and exposes the same operations
//! for scripting and local use.
//!
//! ## Usage
//!
//! ```bash
//! docchat --config ./config/docchat.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `docchat init` | Create the SQLite database and data directories |
//! | `docchat serve` | Start the HTTP API |
//! | `docchat convert` | Convert every file in the data directory to text |
//! | `docchat ingest <dir>` | Index a directory into a collection |
//! | `docchat query "<text>"` | Answer one question and print the response |
//! | `docchat files` | List files in the data directory |
//! | `docchat folders` | List folders in the data directory |

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use docchat::config;
use docchat::convert;
use docchat::db;
use docchat::embedding::EmbedderRegistry;
use docchat::files;
use docchat::index::{SqliteVectorIndex, VectorIndex};
use docchat::ingest;
use docchat::llm::OpenAIChat;
use docchat::logging;
use docchat::migrate;
use docchat::pipeline::{QueryPipeline, QueryRequest};
use docchat::server;
use docchat::session::SqliteSessionStore;

/// docchat: chat with a folder of documents.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/docchat.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "docchat",
    about = "docchat: a retrieval-augmented chat backend over a folder of documents",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/docchat.toml")]
    config: PathBuf,

    /// Increase log verbosity (-v debug, -vv trace). `DOCCHAT_LOG` overrides.
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema and data directories.
    ///
    /// Idempotent; running it again leaves existing data untouched.
    Init,

    /// Start the HTTP API on `[server].bind`.
    Serve,

    /// Convert DOCX, XLSX, CSV, and EPUB files in the data directory to text.
    Convert,

    /// Index every document under a directory into a collection.
    Ingest {
        /// Directory to load.
        dir: PathBuf,

        /// Collection to index into. Defaults to `[retrieval].default_collection`.
        #[arg(long)]
        collection: Option<String>,

        /// Embeddings name: `openai`, `ollama`, or `local`.
        #[arg(long)]
        embeddings: Option<String>,
    },

    /// Answer a question and print the response as JSON.
    Query {
        /// The question.
        text: String,

        /// Continue an existing chat session.
        #[arg(long)]
        session: Option<String>,

        /// Chat model to use instead of `[llm].default_model`.
        #[arg(long)]
        llm: Option<String>,

        /// Collection to retrieve from.
        #[arg(long)]
        collection: Option<String>,
    },

    /// List files in the data directory, grouped by folder, as JSON.
    Files,

    /// List top-level folders in the data directory.
    Folders,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    let query_log = match cli.command {
        Commands::Serve | Commands::Query { .. } => Some(cfg.logging.query_log.clone()),
        _ => None,
    };
    if let Some(parent) = query_log.as_ref().and_then(|p| p.parent()) {
        std::fs::create_dir_all(parent)?;
    }
    let _guard = logging::init_tracing(cli.verbose, query_log.as_deref());

    match cli.command {
        Commands::Init => {
            let pool = db::connect(&cfg).await?;
            migrate::run_migrations(&pool).await?;
            std::fs::create_dir_all(&cfg.storage.data_dir)?;
            std::fs::create_dir_all(&cfg.storage.converted_dir)?;
            println!("Database initialized successfully.");
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
        Commands::Convert => {
            let summary =
                convert::convert_existing_files(&cfg.storage.data_dir, &cfg.storage.converted_dir)?;
            println!(
                "Converted {} file(s), skipped {}, failed {}.",
                summary.converted, summary.skipped, summary.failed
            );
        }
        Commands::Ingest {
            dir,
            collection,
            embeddings,
        } => {
            let pool = db::connect(&cfg).await?;
            migrate::run_migrations(&pool).await?;
            let index = vector_index(&cfg, pool);
            let collection = collection.unwrap_or_else(|| cfg.retrieval.default_collection.clone());
            let embeddings =
                embeddings.unwrap_or_else(|| cfg.retrieval.default_embeddings.clone());
            let written =
                ingest::add_documents(index.as_ref(), &cfg, &dir, &collection, &embeddings).await?;
            println!("Indexed {} chunk(s) into '{}'.", written, collection);
        }
        Commands::Query {
            text,
            session,
            llm,
            collection,
        } => {
            let pool = db::connect(&cfg).await?;
            migrate::run_migrations(&pool).await?;
            let index = vector_index(&cfg, pool.clone());
            let pipeline = QueryPipeline::new(
                Arc::new(SqliteSessionStore::new(pool)),
                index,
                Arc::new(OpenAIChat::new(&cfg.llm)?),
                cfg.clone(),
            );
            let response = pipeline
                .answer(QueryRequest {
                    text,
                    session_id: session,
                    llm_name: llm,
                    collection_name: collection,
                })
                .await?;
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
        Commands::Files => {
            match files::list_files(&cfg.storage.data_dir, &cfg.storage.public_base_url)? {
                None => anyhow::bail!("Directory not found: {}", cfg.storage.data_dir.display()),
                Some(grouped) if grouped.is_empty() => println!("No files found"),
                Some(grouped) => println!("{}", serde_json::to_string_pretty(&grouped)?),
            }
        }
        Commands::Folders => {
            for folder in files::list_folders(&cfg.storage.data_dir)? {
                println!("{}", folder);
            }
        }
    }

    Ok(())
}

fn vector_index(cfg: &config::Config, pool: sqlx::SqlitePool) -> Arc<dyn VectorIndex> {
    let embedders = Arc::new(EmbedderRegistry::from_config(cfg.clone()));
    Arc::new(SqliteVectorIndex::new(
        pool,
        embedders,
        cfg.embedding.batch_size,
    ))
}
