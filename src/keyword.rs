//! Keyword retrieval adapter.
//!
//! [`KeywordIndex`] mirrors the vector adapter's shape with lexical
//! matching and highlighted snippets. Query terms are sanitized to
//! alphanumeric tokens and matched as prefixes, so `"lien prior"` finds
//! "liens" and "priority". Body text is weighted twice as heavily as the
//! title. When the backend produces no highlighted fragment the snippet
//! falls back to the chunk text.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use regex::Regex;
use sqlx::{Row, SqlitePool};
use tracing::debug;

use crate::error::{Error, Result, Service, ServiceResultExt};
use crate::models::{KeywordRecord, SearchFilters};

pub const HIGHLIGHT_OPEN: &str = "<mark>";
pub const HIGHLIGHT_CLOSE: &str = "</mark>";

// Keep in step with the bm25() column weights in the FTS5 query.
const BODY_WEIGHT: f64 = 2.0;
const TITLE_WEIGHT: f64 = 1.0;

#[derive(Debug, Clone, PartialEq)]
pub struct KeywordHit {
    pub chunk_id: String,
    pub document_id: String,
    /// Higher is better.
    pub score: f64,
    pub snippet: String,
}

#[async_trait]
pub trait KeywordIndex: Send + Sync {
    /// Create the index if missing. Idempotent.
    async fn ensure_index(&self) -> Result<()>;

    /// Insert or replace the given records, keyed by chunk id.
    async fn index_batch(&self, records: &[KeywordRecord]) -> Result<()>;

    async fn search(
        &self,
        query: &str,
        filters: &SearchFilters,
        top_k: usize,
    ) -> Result<Vec<KeywordHit>>;

    async fn delete_by_document(&self, document_id: &str) -> Result<()>;
}

/// Split a free-text query into lower-cased alphanumeric terms.
pub fn query_terms(query: &str) -> Vec<String> {
    query
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// FTS5 MATCH expression: each term as a quoted prefix, OR'd together.
fn fts_match_expression(terms: &[String]) -> String {
    terms
        .iter()
        .map(|t| format!("\"{}\"*", t))
        .collect::<Vec<_>>()
        .join(" OR ")
}

fn sort_hits(hits: &mut [KeywordHit]) {
    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.chunk_id.cmp(&b.chunk_id))
    });
}

// ============ SQLite FTS5 ============

pub(crate) async fn create_fts_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE VIRTUAL TABLE IF NOT EXISTS keyword_fts USING fts5(
            chunk_id UNINDEXED,
            document_id UNINDEXED,
            title,
            text,
            jurisdiction UNINDEXED,
            page UNINDEXED,
            created_at UNINDEXED
        )
        "#,
    )
    .execute(pool)
    .await
    .service_err(Service::KeywordIndex)?;
    Ok(())
}

pub struct SqliteKeywordIndex {
    pool: SqlitePool,
}

impl SqliteKeywordIndex {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl KeywordIndex for SqliteKeywordIndex {
    async fn ensure_index(&self) -> Result<()> {
        create_fts_table(&self.pool).await
    }

    async fn index_batch(&self, records: &[KeywordRecord]) -> Result<()> {
        self.ensure_index().await?;
        let mut tx = self.pool.begin().await.service_err(Service::KeywordIndex)?;
        for record in records {
            sqlx::query("DELETE FROM keyword_fts WHERE chunk_id = ?")
                .bind(&record.chunk_id)
                .execute(&mut *tx)
                .await
                .service_err(Service::KeywordIndex)?;
            sqlx::query(
                r#"
                INSERT INTO keyword_fts
                    (chunk_id, document_id, title, text, jurisdiction, page, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&record.chunk_id)
            .bind(&record.document_id)
            .bind(&record.title)
            .bind(&record.text)
            .bind(&record.jurisdiction)
            .bind(record.page as i64)
            .bind(record.created_at.timestamp_millis())
            .execute(&mut *tx)
            .await
            .service_err(Service::KeywordIndex)?;
        }
        tx.commit().await.service_err(Service::KeywordIndex)?;
        debug!(records = records.len(), "indexed keyword batch");
        Ok(())
    }

    async fn search(
        &self,
        query: &str,
        filters: &SearchFilters,
        top_k: usize,
    ) -> Result<Vec<KeywordHit>> {
        let terms = query_terms(query);
        if terms.is_empty() || top_k == 0 {
            return Ok(Vec::new());
        }
        self.ensure_index().await?;

        let jurisdictions =
            serde_json::to_string(&filters.jurisdictions).service_err(Service::KeywordIndex)?;
        let range = filters.date_range.unwrap_or_default();
        let rows = sqlx::query(
            r#"
            SELECT chunk_id, document_id, text,
                   bm25(keyword_fts, 0.0, 0.0, 1.0, 2.0, 0.0, 0.0, 0.0) AS bm25_rank,
                   snippet(keyword_fts, 3, '<mark>', '</mark>', '...', 32) AS snippet
            FROM keyword_fts
            WHERE keyword_fts MATCH ?
              AND (? = 0 OR jurisdiction IN (SELECT value FROM json_each(?)))
              AND (? IS NULL OR CAST(created_at AS INTEGER) >= ?)
              AND (? IS NULL OR CAST(created_at AS INTEGER) <= ?)
            ORDER BY bm25_rank, chunk_id
            LIMIT ?
            "#,
        )
        .bind(fts_match_expression(&terms))
        .bind(filters.jurisdictions.len() as i64)
        .bind(jurisdictions)
        .bind(range.from.map(|t| t.timestamp_millis()))
        .bind(range.from.map(|t| t.timestamp_millis()))
        .bind(range.to.map(|t| t.timestamp_millis()))
        .bind(range.to.map(|t| t.timestamp_millis()))
        .bind(top_k as i64)
        .fetch_all(&self.pool)
        .await
        .service_err(Service::KeywordIndex)?;

        let mut hits: Vec<KeywordHit> = rows
            .iter()
            .map(|row| {
                let rank: f64 = row.get("bm25_rank");
                let text: String = row.get("text");
                let snippet: Option<String> = row.get("snippet");
                KeywordHit {
                    chunk_id: row.get("chunk_id"),
                    document_id: row.get("document_id"),
                    score: -rank,
                    snippet: with_fallback(snippet, text),
                }
            })
            .collect();
        sort_hits(&mut hits);
        Ok(hits)
    }

    async fn delete_by_document(&self, document_id: &str) -> Result<()> {
        self.ensure_index().await?;
        sqlx::query("DELETE FROM keyword_fts WHERE document_id = ?")
            .bind(document_id)
            .execute(&self.pool)
            .await
            .service_err(Service::KeywordIndex)?;
        Ok(())
    }
}

fn with_fallback(snippet: Option<String>, text: String) -> String {
    match snippet {
        Some(s) if s.contains(HIGHLIGHT_OPEN) => s,
        _ => text,
    }
}

// ============ In-memory ============

/// Term-frequency scoring over a `HashMap`, with the same prefix and
/// weighting rules as the FTS5 index.
#[derive(Default)]
pub struct InMemoryKeywordIndex {
    records: RwLock<HashMap<String, KeywordRecord>>,
}

impl InMemoryKeywordIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.read().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn poisoned<E: std::fmt::Display>(err: E) -> Error {
    Error::external(Service::KeywordIndex, format!("lock poisoned: {}", err))
}

/// Case-insensitive regex matching any word that starts with a term.
fn prefix_regex(terms: &[String]) -> Result<Regex> {
    let alternation = terms
        .iter()
        .map(|t| regex::escape(t))
        .collect::<Vec<_>>()
        .join("|");
    Regex::new(&format!(r"(?i)\b(?:{})\w*", alternation)).service_err(Service::KeywordIndex)
}

#[async_trait]
impl KeywordIndex for InMemoryKeywordIndex {
    async fn ensure_index(&self) -> Result<()> {
        Ok(())
    }

    async fn index_batch(&self, records: &[KeywordRecord]) -> Result<()> {
        let mut stored = self.records.write().map_err(poisoned)?;
        for record in records {
            stored.insert(record.chunk_id.clone(), record.clone());
        }
        Ok(())
    }

    async fn search(
        &self,
        query: &str,
        filters: &SearchFilters,
        top_k: usize,
    ) -> Result<Vec<KeywordHit>> {
        let terms = query_terms(query);
        if terms.is_empty() {
            return Ok(Vec::new());
        }
        let matcher = prefix_regex(&terms)?;

        let stored = self.records.read().map_err(poisoned)?;
        let mut hits: Vec<KeywordHit> = stored
            .values()
            .filter(|r| filters.matches(&r.jurisdiction, r.created_at))
            .filter_map(|r| {
                let body = matcher.find_iter(&r.text).count() as f64;
                let title = matcher.find_iter(&r.title).count() as f64;
                let score = body * BODY_WEIGHT + title * TITLE_WEIGHT;
                if score <= 0.0 {
                    return None;
                }
                let highlighted = (body > 0.0).then(|| {
                    matcher
                        .replace_all(&r.text, format!("{}$0{}", HIGHLIGHT_OPEN, HIGHLIGHT_CLOSE))
                        .into_owned()
                });
                Some(KeywordHit {
                    chunk_id: r.chunk_id.clone(),
                    document_id: r.document_id.clone(),
                    score,
                    snippet: with_fallback(highlighted, r.text.clone()),
                })
            })
            .collect();
        sort_hits(&mut hits);
        hits.truncate(top_k);
        Ok(hits)
    }

    async fn delete_by_document(&self, document_id: &str) -> Result<()> {
        let mut stored = self.records.write().map_err(poisoned)?;
        stored.retain(|_, r| r.document_id != document_id);
        Ok(())
    }
}
