//! # coderank CLI (`crk`)
//!
//! ## Usage
//!
//! ```bash
//! crk --config ./config/crk.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `crk init` | Create the SQLite database and run schema migrations |
//! | `crk ingest <dir>` | Load text files as documents, then reindex |
//! | `crk reindex` | Build, validate and promote a new index generation |
//! | `crk rollback` | Re-activate the previous index generation |
//! | `crk search "<query>"` | Search with exact-match + Stage 1 fusion |
//! | `crk check` | Compare the active generation with the document store |
//! | `crk metrics` | Print the operational metrics snapshot |
//! | `crk serve` | Start the HTTP server |
//!
//! Logs go to stderr and are filtered with `RUST_LOG` (default `info`).

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use coderank::{commands, config, migrate};

#[derive(Parser)]
#[command(
    name = "crk",
    about = "coderank: exact-match code retrieval fused with a best-effort retriever",
    version,
    long_about = "coderank finds documents by structured identifiers (model and part numbers) \
    with boundary-safe exact matching, fuses them with a keyword or external retriever via \
    Reciprocal Rank Fusion, caches results without stampedes, and rebuilds its index \
    without interrupting reads."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/crk.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Idempotent.
    Init,

    /// Ingest text files from a directory and reindex.
    Ingest {
        /// Directory to walk.
        dir: PathBuf,

        /// Only load documents; do not run a reindex afterwards.
        #[arg(long)]
        no_reindex: bool,
    },

    /// Rebuild the exact-match index into a new generation and promote it.
    Reindex,

    /// Re-activate the previous index generation.
    Rollback,

    /// Search documents.
    Search {
        /// The search query string.
        query: String,

        /// Search mode: `fused` (default), `exact` (Stage 0 only) or `stage1`.
        #[arg(long, default_value = "fused")]
        mode: String,

        /// Maximum number of results. Defaults to `retrieval.final_limit`.
        #[arg(long)]
        limit: Option<usize>,

        /// Print results as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Check the active generation against the document store.
    Check,

    /// Print metrics as JSON.
    Metrics,

    /// Start the HTTP server.
    Serve,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Ingest { dir, no_reindex } => {
            commands::run_ingest(&cfg, &dir, !no_reindex).await?;
        }
        Commands::Reindex => {
            commands::run_reindex(&cfg).await?;
        }
        Commands::Rollback => {
            commands::run_rollback(&cfg).await?;
        }
        Commands::Search {
            query,
            mode,
            limit,
            json,
        } => {
            commands::run_search(&cfg, &query, &mode, limit, json).await?;
        }
        Commands::Check => {
            commands::run_check(&cfg).await?;
        }
        Commands::Metrics => {
            commands::run_metrics(&cfg).await?;
        }
        Commands::Serve => {
            commands::run_serve(&cfg).await?;
        }
    }

    Ok(())
}
