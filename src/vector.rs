//! Vector retrieval adapter.
//!
//! The [`VectorIndex`] trait is the seam to whichever similarity backend
//! stores chunk embeddings. Two implementations ship with the crate:
//!
//! - [`SqliteVectorIndex`]: vectors stored as little-endian BLOBs in the
//!   `chunk_vectors` table, scored by brute-force cosine similarity.
//! - [`InMemoryVectorIndex`]: a `HashMap` behind a lock, for tests.
//!
//! # Filtering
//!
//! The SQLite index filters on jurisdiction in SQL. The date range is not
//! pushed down: it is applied to the top-`top_k` candidates after scoring,
//! so a restrictive date filter can return fewer than `top_k` hits even
//! when more matching vectors exist.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use tracing::debug;

use crate::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use crate::error::{Result, Service, ServiceResultExt};
use crate::models::{SearchFilters, VectorRecord};

/// Records written per transaction by [`SqliteVectorIndex::upsert`].
pub const UPSERT_BATCH: usize = 256;

pub(crate) const CREATE_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS chunk_vectors (
        chunk_id TEXT PRIMARY KEY,
        document_id TEXT NOT NULL,
        embedding BLOB NOT NULL,
        metadata_json TEXT NOT NULL DEFAULT '{}'
    )
"#;

pub(crate) const CREATE_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_chunk_vectors_document_id ON chunk_vectors(document_id)";

/// One similarity match. Higher scores are better; the range depends on
/// the backend.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorHit {
    pub chunk_id: String,
    pub score: f64,
    pub metadata: BTreeMap<String, String>,
}

#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Create the backing collection if it does not exist. Idempotent.
    async fn ensure_collection(&self) -> Result<()>;

    /// Insert or replace records keyed by chunk id.
    async fn upsert(&self, records: &[VectorRecord]) -> Result<()>;

    async fn query(
        &self,
        vector: &[f32],
        filters: &SearchFilters,
        top_k: usize,
    ) -> Result<Vec<VectorHit>>;

    /// Remove every record whose `document_id` metadata equals `document_id`.
    async fn delete_by_document(&self, document_id: &str) -> Result<()>;
}

fn sort_hits(hits: &mut [VectorHit]) {
    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.chunk_id.cmp(&b.chunk_id))
    });
}

// ============ SQLite ============

pub struct SqliteVectorIndex {
    pool: SqlitePool,
}

impl SqliteVectorIndex {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl VectorIndex for SqliteVectorIndex {
    async fn ensure_collection(&self) -> Result<()> {
        sqlx::query(CREATE_TABLE)
            .execute(&self.pool)
            .await
            .service_err(Service::VectorIndex)?;
        sqlx::query(CREATE_INDEX)
            .execute(&self.pool)
            .await
            .service_err(Service::VectorIndex)?;
        Ok(())
    }

    async fn upsert(&self, records: &[VectorRecord]) -> Result<()> {
        self.ensure_collection().await?;

        for batch in records.chunks(UPSERT_BATCH) {
            let mut tx = self.pool.begin().await.service_err(Service::VectorIndex)?;
            for record in batch {
                let metadata =
                    serde_json::to_string(&record.metadata).service_err(Service::VectorIndex)?;
                sqlx::query(
                    r#"
                    INSERT INTO chunk_vectors (chunk_id, document_id, embedding, metadata_json)
                    VALUES (?, ?, ?, ?)
                    ON CONFLICT(chunk_id) DO UPDATE SET
                        document_id = excluded.document_id,
                        embedding = excluded.embedding,
                        metadata_json = excluded.metadata_json
                    "#,
                )
                .bind(&record.chunk_id)
                .bind(record.document_id().unwrap_or_default())
                .bind(vec_to_blob(&record.vector))
                .bind(metadata)
                .execute(&mut *tx)
                .await
                .service_err(Service::VectorIndex)?;
            }
            tx.commit().await.service_err(Service::VectorIndex)?;
            debug!(records = batch.len(), "upserted vector batch");
        }
        Ok(())
    }

    async fn query(
        &self,
        vector: &[f32],
        filters: &SearchFilters,
        top_k: usize,
    ) -> Result<Vec<VectorHit>> {
        self.ensure_collection().await?;

        let jurisdictions =
            serde_json::to_string(&filters.jurisdictions).service_err(Service::VectorIndex)?;
        let rows = sqlx::query(
            r#"
            SELECT chunk_id, embedding, metadata_json
            FROM chunk_vectors
            WHERE ? = 0
               OR json_extract(metadata_json, '$.jurisdiction') IN (SELECT value FROM json_each(?))
            "#,
        )
        .bind(filters.jurisdictions.len() as i64)
        .bind(jurisdictions)
        .fetch_all(&self.pool)
        .await
        .service_err(Service::VectorIndex)?;

        let mut hits = Vec::with_capacity(rows.len());
        for row in &rows {
            let blob: Vec<u8> = row.get("embedding");
            let metadata_json: String = row.get("metadata_json");
            let metadata: BTreeMap<String, String> =
                serde_json::from_str(&metadata_json).service_err(Service::VectorIndex)?;
            hits.push(VectorHit {
                chunk_id: row.get("chunk_id"),
                score: cosine_similarity(vector, &blob_to_vec(&blob)) as f64,
                metadata,
            });
        }

        sort_hits(&mut hits);
        hits.truncate(top_k);

        if let Some(range) = filters.date_range {
            let date_only = SearchFilters {
                jurisdictions: Vec::new(),
                date_range: Some(range),
            };
            hits.retain(|hit| date_only.matches_metadata(&hit.metadata));
        }
        Ok(hits)
    }

    async fn delete_by_document(&self, document_id: &str) -> Result<()> {
        self.ensure_collection().await?;
        let result = sqlx::query("DELETE FROM chunk_vectors WHERE document_id = ?")
            .bind(document_id)
            .execute(&self.pool)
            .await
            .service_err(Service::VectorIndex)?;
        debug!(document_id, removed = result.rows_affected(), "deleted vectors");
        Ok(())
    }
}

// ============ In-memory ============

/// Brute-force index over a `HashMap`. All filters are applied before
/// truncation.
#[derive(Default)]
pub struct InMemoryVectorIndex {
    records: RwLock<HashMap<String, VectorRecord>>,
}

impl InMemoryVectorIndex {
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

fn poisoned<E: std::fmt::Display>(err: E) -> crate::error::Error {
    crate::error::Error::external(Service::VectorIndex, format!("lock poisoned: {}", err))
}

#[async_trait]
impl VectorIndex for InMemoryVectorIndex {
    async fn ensure_collection(&self) -> Result<()> {
        Ok(())
    }

    async fn upsert(&self, records: &[VectorRecord]) -> Result<()> {
        let mut stored = self.records.write().map_err(poisoned)?;
        for record in records {
            stored.insert(record.chunk_id.clone(), record.clone());
        }
        Ok(())
    }

    async fn query(
        &self,
        vector: &[f32],
        filters: &SearchFilters,
        top_k: usize,
    ) -> Result<Vec<VectorHit>> {
        let stored = self.records.read().map_err(poisoned)?;
        let mut hits: Vec<VectorHit> = stored
            .values()
            .filter(|r| filters.matches_metadata(&r.metadata))
            .map(|r| VectorHit {
                chunk_id: r.chunk_id.clone(),
                score: cosine_similarity(vector, &r.vector) as f64,
                metadata: r.metadata.clone(),
            })
            .collect();
        sort_hits(&mut hits);
        hits.truncate(top_k);
        Ok(hits)
    }

    async fn delete_by_document(&self, document_id: &str) -> Result<()> {
        let mut stored = self.records.write().map_err(poisoned)?;
        stored.retain(|_, r| r.document_id() != Some(document_id));
        Ok(())
    }
}
