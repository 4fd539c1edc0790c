//! # Docket CLI (`docket`)
//!
//! ## Usage
//!
//! ```bash
//! docket --config ./config/docket.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `docket init` | Create the SQLite database and run schema migrations |
//! | `docket upload <file>` | Store a new document (version 1.0) |
//! | `docket revise <id> <file>` | Store a new revision of a document |
//! | `docket process <id>` | Segment, embed, and index a document |
//! | `docket reprocess <id>` | Clear and rebuild a document's chunks and index entries |
//! | `docket reindex` | Reprocess every document |
//! | `docket set-model [model]` | Switch embedding model and reindex |
//! | `docket search "<query>"` | Hybrid search |
//! | `docket history <id>` | Every revision in a document's lineage |
//! | `docket delete <id>` | Delete a document and everything derived from it |
//! | `docket weight <id> <j> <r> <m>` | Set a document's search weight |
//! | `docket worker [ids...]` | Run the processing queue over the given ids |

mod commands;

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Docket: ingestion and hybrid retrieval for legal documents.
#[derive(Parser)]
#[command(name = "docket", version, about)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/docket.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Idempotent.
    Init,

    /// Store a file as a new document.
    Upload {
        file: PathBuf,
        #[arg(long)]
        title: String,
        #[arg(long)]
        jurisdiction: String,
        /// Uploader recorded as the document's creator.
        #[arg(long = "by")]
        created_by: String,
        /// Process immediately instead of leaving it for a worker.
        #[arg(long)]
        process: bool,
    },

    /// Store a file as the next revision of an existing document.
    Revise {
        parent_id: String,
        file: PathBuf,
        #[arg(long = "by")]
        editor: String,
        #[arg(long)]
        process: bool,
    },

    /// Segment, embed, and index one document.
    Process { id: String },

    /// Remove a document's chunks and index entries, then process it again.
    Reprocess { id: String },

    /// Reprocess every document, reporting successes and failures.
    Reindex,

    /// Switch the embedding model (if given) and reindex everything.
    SetModel { model: Option<String> },

    /// Search indexed documents.
    Search {
        query: String,

        #[arg(long, value_enum, default_value_t = Mode::Hybrid)]
        mode: Mode,

        /// Overrides `retrieval.semantic_weight`.
        #[arg(long)]
        semantic_weight: Option<f64>,

        /// Overrides `retrieval.keyword_weight`.
        #[arg(long)]
        keyword_weight: Option<f64>,

        /// Restrict to these jurisdictions (repeatable).
        #[arg(long = "jurisdiction")]
        jurisdictions: Vec<String>,

        /// Only documents created on or after this date (YYYY-MM-DD).
        #[arg(long)]
        since: Option<String>,

        /// Only documents created on or before this date (YYYY-MM-DD).
        #[arg(long)]
        until: Option<String>,

        /// Maximum number of results. Defaults to `retrieval.top_k`.
        #[arg(long)]
        limit: Option<usize>,

        /// Show the score breakdown of every hit.
        #[arg(long)]
        explain: bool,

        /// Print results as JSON.
        #[arg(long)]
        json: bool,
    },

    /// List every revision in a document's version tree, newest first.
    History { id: String },

    /// Delete a document with its chunks, index entries, and file.
    Delete { id: String },

    /// Set a document's search weight. Each score is in [0, 10].
    Weight {
        id: String,
        jurisdiction_score: f64,
        recency_score: f64,
        manual_boost: f64,
    },

    /// Run the processing queue. Stops on Ctrl-C after the current document.
    Worker {
        /// Document ids to enqueue.
        ids: Vec<String>,
        /// Enqueue every stored document.
        #[arg(long)]
        all: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    Hybrid,
    Semantic,
    Keyword,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let cfg = docket::config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => commands::init(&cfg).await?,
        Commands::Upload {
            file,
            title,
            jurisdiction,
            created_by,
            process,
        } => commands::upload(&cfg, &file, title, jurisdiction, created_by, process).await?,
        Commands::Revise {
            parent_id,
            file,
            editor,
            process,
        } => commands::revise(&cfg, &parent_id, &file, &editor, process).await?,
        Commands::Process { id } => commands::process(&cfg, &id, false).await?,
        Commands::Reprocess { id } => commands::process(&cfg, &id, true).await?,
        Commands::Reindex => commands::reindex(&cfg, None).await?,
        Commands::SetModel { model } => commands::reindex(&cfg, Some(model)).await?,
        Commands::Search {
            query,
            mode,
            semantic_weight,
            keyword_weight,
            jurisdictions,
            since,
            until,
            limit,
            explain,
            json,
        } => {
            let opts = commands::SearchOptions {
                use_semantic: mode != Mode::Keyword,
                use_keyword: mode != Mode::Semantic,
                semantic_weight,
                keyword_weight,
                jurisdictions,
                since,
                until,
                limit,
                explain,
                json,
            };
            commands::search(&cfg, &query, opts).await?
        }
        Commands::History { id } => commands::history(&cfg, &id).await?,
        Commands::Delete { id } => commands::delete(&cfg, &id).await?,
        Commands::Weight {
            id,
            jurisdiction_score,
            recency_score,
            manual_boost,
        } => {
            commands::weight(&cfg, &id, jurisdiction_score, recency_score, manual_boost).await?
        }
        Commands::Worker { ids, all } => commands::worker(&cfg, ids, all).await?,
    }

    Ok(())
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}
