//! Command implementations for the `docket` binary. Results go to stdout;
//! diagnostics go through `tracing` to stderr.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use tracing::{info, warn};

use docket::backends::Backends;
use docket::config::Config;
use docket::ingest::{NewDocument, Orchestrator};
use docket::models::{DateRange, SearchFilters, SearchWeight};
use docket::queue::{self, CancellationToken};
use docket::ranking::SearchRequest;
use docket::versions::VersionTreeResolver;
use docket::{db, migrate};

pub struct SearchOptions {
    pub use_semantic: bool,
    pub use_keyword: bool,
    pub semantic_weight: Option<f64>,
    pub keyword_weight: Option<f64>,
    pub jurisdictions: Vec<String>,
    pub since: Option<String>,
    pub until: Option<String>,
    pub limit: Option<usize>,
    pub explain: bool,
    pub json: bool,
}

async fn orchestrator(cfg: &Config) -> Result<Orchestrator> {
    let backends = Backends::open(cfg).await?;
    Ok(Orchestrator::new(backends, cfg.chunking, &cfg.embedding)?)
}

fn read_file(path: &Path) -> Result<(String, Vec<u8>)> {
    let bytes =
        std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("content.txt")
        .to_string();
    Ok((name, bytes))
}

pub async fn init(cfg: &Config) -> Result<()> {
    let pool = db::connect(cfg).await?;
    migrate::run_migrations(&pool).await?;
    pool.close().await;
    println!("Database initialized successfully.");
    Ok(())
}

pub async fn upload(
    cfg: &Config,
    file: &Path,
    title: String,
    jurisdiction: String,
    created_by: String,
    process: bool,
) -> Result<()> {
    let orchestrator = orchestrator(cfg).await?;
    let (file_name, bytes) = read_file(file)?;
    let doc = orchestrator
        .upload(NewDocument {
            title,
            jurisdiction,
            created_by,
            file_name,
            bytes,
        })
        .await?;
    println!("uploaded {} (version {})", doc.id, doc.version);

    if process {
        let summary = orchestrator.process_document(&doc.id).await?;
        println!("  pages: {}", summary.pages);
        println!("  chunks: {}", summary.chunks);
    }
    Ok(())
}

pub async fn revise(
    cfg: &Config,
    parent_id: &str,
    file: &Path,
    editor: &str,
    process: bool,
) -> Result<()> {
    let orchestrator = orchestrator(cfg).await?;
    let (file_name, bytes) = read_file(file)?;
    let doc = orchestrator
        .revise(parent_id, editor, &file_name, bytes)
        .await?;
    println!("revised {} -> {} (version {})", parent_id, doc.id, doc.version);

    if process {
        let summary = orchestrator.process_document(&doc.id).await?;
        println!("  pages: {}", summary.pages);
        println!("  chunks: {}", summary.chunks);
    }
    Ok(())
}

pub async fn process(cfg: &Config, id: &str, clear_first: bool) -> Result<()> {
    let orchestrator = orchestrator(cfg).await?;
    let summary = if clear_first {
        orchestrator.reprocess_document(id).await?
    } else {
        orchestrator.process_document(id).await?
    };
    println!("processed {}", id);
    println!("  pages: {}", summary.pages);
    println!("  chunks: {}", summary.chunks);
    Ok(())
}

/// `model` is `None` for a plain reindex and `Some(..)` for `set-model`.
pub async fn reindex(cfg: &Config, model: Option<Option<String>>) -> Result<()> {
    let orchestrator = orchestrator(cfg).await?;
    let summary = match &model {
        None => orchestrator.reindex_all().await?,
        Some(name) => orchestrator.update_embedding_model(name.as_deref()).await?,
    };
    println!("reindex");
    println!("  documents: {}", summary.total);
    println!("  succeeded: {}", summary.succeeded);
    println!("  failed: {}", summary.failed);
    Ok(())
}

fn parse_day(value: &str, end_of_day: bool) -> Result<DateTime<Utc>> {
    let date = NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .with_context(|| format!("Invalid date '{}', expected YYYY-MM-DD", value))?;
    let time = if end_of_day {
        date.and_hms_opt(23, 59, 59)
    } else {
        date.and_hms_opt(0, 0, 0)
    };
    time.map(|t| t.and_utc())
        .with_context(|| format!("Invalid date '{}'", value))
}

pub async fn search(cfg: &Config, query: &str, opts: SearchOptions) -> Result<()> {
    let backends = Backends::open(cfg).await?;
    let ranker = backends
        .ranker()
        .with_timeout(Duration::from_millis(cfg.retrieval.query_timeout_ms));

    let date_range = if opts.since.is_some() || opts.until.is_some() {
        Some(DateRange {
            from: opts.since.as_deref().map(|s| parse_day(s, false)).transpose()?,
            to: opts.until.as_deref().map(|s| parse_day(s, true)).transpose()?,
        })
    } else {
        None
    };

    let request = SearchRequest {
        query: query.to_string(),
        use_semantic: opts.use_semantic,
        use_keyword: opts.use_keyword,
        semantic_weight: opts.semantic_weight.unwrap_or(cfg.retrieval.semantic_weight),
        keyword_weight: opts.keyword_weight.unwrap_or(cfg.retrieval.keyword_weight),
        top_k: opts.limit.unwrap_or(cfg.retrieval.top_k),
        filters: SearchFilters {
            jurisdictions: opts.jurisdictions,
            date_range,
        },
        explain: opts.explain,
        timeout: None,
    };
    if request.use_semantic && !cfg.embedding.is_enabled() {
        warn!("embedding provider is disabled; semantic results will be empty");
    }

    let hits = ranker.search(&request).await?;

    if opts.json {
        println!("{}", serde_json::to_string_pretty(&hits)?);
        return Ok(());
    }
    if hits.is_empty() {
        println!("No results.");
        return Ok(());
    }

    for (i, hit) in hits.iter().enumerate() {
        println!(
            "{}. [{:.3}] {} ({}) p.{}",
            i + 1,
            hit.score,
            hit.title,
            hit.jurisdiction,
            hit.page
        );
        println!("    document: {}", hit.document_id);
        println!("    file: {}", hit.content_url);
        println!(
            "    excerpt: \"{}\"",
            hit.snippet.replace('\n', " ").trim()
        );
        if let Some(explain) = &hit.explain {
            println!(
                "    explain: semantic={:.3} keyword={:.3} fused={:.3} boost=x{:.3}",
                explain.semantic, explain.keyword, explain.fused, explain.boost
            );
        }
        println!();
    }
    Ok(())
}

pub async fn history(cfg: &Config, id: &str) -> Result<()> {
    let backends = Backends::open(cfg).await?;
    let resolver = VersionTreeResolver::new(Arc::clone(&backends.store));
    let revisions = resolver.history(id).await?;

    for doc in revisions {
        let marker = if doc.id == id { "*" } else { " " };
        println!(
            "{} {}  v{}  {}  by {}",
            marker,
            doc.id,
            doc.version,
            doc.created_at.format("%Y-%m-%d %H:%M"),
            doc.created_by
        );
    }
    Ok(())
}

pub async fn delete(cfg: &Config, id: &str) -> Result<()> {
    let orchestrator = orchestrator(cfg).await?;
    orchestrator.delete_document(id).await?;
    println!("deleted {}", id);
    Ok(())
}

pub async fn weight(
    cfg: &Config,
    id: &str,
    jurisdiction_score: f64,
    recency_score: f64,
    manual_boost: f64,
) -> Result<()> {
    let backends = Backends::open(cfg).await?;
    let weight = SearchWeight::new(jurisdiction_score, recency_score, manual_boost)?;
    backends.store.set_search_weight(id, weight).await?;
    println!(
        "weight {}: jurisdiction={} recency={} manual={}",
        id, jurisdiction_score, recency_score, manual_boost
    );
    Ok(())
}

pub async fn worker(cfg: &Config, ids: Vec<String>, all: bool) -> Result<()> {
    let orchestrator = orchestrator(cfg).await?;
    let (handle, consumer) = queue::channel();

    let mut ids = ids;
    if all {
        ids.extend(orchestrator.backends().store.list_document_ids().await?);
    }
    for id in &ids {
        handle.enqueue(id.clone())?;
    }
    info!(queued = ids.len(), "worker starting");
    drop(handle);

    let token = CancellationToken::new();
    let on_signal = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; finishing current document");
            on_signal.cancel();
        }
    });

    let report = consumer.run(&orchestrator, token).await;
    println!("worker");
    println!("  processed: {}", report.processed);
    println!("  failed: {}", report.failed);
    Ok(())
}
