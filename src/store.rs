//! Document and chunk persistence.
//!
//! The [`DocumentStore`] trait defines every storage operation the
//! orchestrator, ranker, and version resolver need, so the pipeline can run
//! against SQLite in production and plain maps in tests.
//!
//! Chunk rows carry text, offsets, and hash. Embeddings live only in the
//! vector index; chunks read back from a store have an empty `embedding`.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::error::{Error, Result, Service, ServiceResultExt};
use crate::models::{Chunk, Document, SearchWeight};

/// Abstract storage backend for documents, search weights, and chunks.
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`insert_document`](DocumentStore::insert_document) | Persist a new revision |
/// | [`get_document`](DocumentStore::get_document) | Fetch a revision with its search weight |
/// | [`children_of`](DocumentStore::children_of) | Revisions whose parent is the given id |
/// | [`set_search_weight`](DocumentStore::set_search_weight) | Admin ranking metadata |
/// | [`replace_chunks`](DocumentStore::replace_chunks) | Swap a document's chunk set atomically |
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn insert_document(&self, doc: &Document) -> Result<()>;

    async fn get_document(&self, id: &str) -> Result<Option<Document>>;

    /// Remove the document row and its search weight. Chunks are removed
    /// separately via [`delete_chunks_for_document`](DocumentStore::delete_chunks_for_document).
    async fn delete_document(&self, id: &str) -> Result<()>;

    async fn list_document_ids(&self) -> Result<Vec<String>>;

    async fn list_by_jurisdiction(&self, jurisdiction: &str) -> Result<Vec<Document>>;

    async fn children_of(&self, parent_id: &str) -> Result<Vec<Document>>;

    /// Fails with `NotFound` if the document does not exist and with
    /// `Validation` if a component is outside `[0, 10]`.
    async fn set_search_weight(&self, document_id: &str, weight: SearchWeight) -> Result<()>;

    async fn replace_chunks(&self, document_id: &str, chunks: &[Chunk]) -> Result<()>;

    async fn delete_chunks_for_document(&self, document_id: &str) -> Result<u64>;

    /// Chunks of a document in `chunk_index` order.
    async fn list_chunks(&self, document_id: &str) -> Result<Vec<Chunk>>;

    async fn get_chunk(&self, chunk_id: &str) -> Result<Option<Chunk>>;
}

// ============ SQLite ============

pub struct SqliteDocumentStore {
    pool: SqlitePool,
}

impl SqliteDocumentStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

const DOCUMENT_COLUMNS: &str = r#"
    d.id, d.title, d.jurisdiction, d.content_ref, d.version, d.parent_id,
    d.created_by, d.created_at, d.modified_at, d.modified_by,
    w.jurisdiction_score, w.recency_score, w.manual_boost
"#;

fn millis_to_datetime(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .ok_or_else(|| Error::DataIntegrity(format!("timestamp out of range: {}", ms)))
}

fn row_to_document(row: &SqliteRow) -> Result<Document> {
    let created_at: i64 = row.get("created_at");
    let modified_at: Option<i64> = row.get("modified_at");
    let jurisdiction_score: Option<f64> = row.get("jurisdiction_score");
    let recency_score: Option<f64> = row.get("recency_score");
    let manual_boost: Option<f64> = row.get("manual_boost");

    let search_weight = match (jurisdiction_score, recency_score, manual_boost) {
        (Some(j), Some(r), Some(m)) => Some(SearchWeight {
            jurisdiction_score: j,
            recency_score: r,
            manual_boost: m,
        }),
        _ => None,
    };

    Ok(Document {
        id: row.get("id"),
        title: row.get("title"),
        jurisdiction: row.get("jurisdiction"),
        content_ref: row.get("content_ref"),
        version: row.get("version"),
        parent_id: row.get("parent_id"),
        created_by: row.get("created_by"),
        created_at: millis_to_datetime(created_at)?,
        modified_at: modified_at.map(millis_to_datetime).transpose()?,
        modified_by: row.get("modified_by"),
        search_weight,
    })
}

fn row_to_chunk(row: &SqliteRow) -> Chunk {
    let page: i64 = row.get("page");
    let start: i64 = row.get("start_offset");
    let end: i64 = row.get("end_offset");
    Chunk {
        id: row.get("id"),
        document_id: row.get("document_id"),
        chunk_index: row.get("chunk_index"),
        page: page as u32,
        text: row.get("text"),
        hash: row.get("hash"),
        embedding: Vec::new(),
        start_offset: start as usize,
        end_offset: end as usize,
    }
}

#[async_trait]
impl DocumentStore for SqliteDocumentStore {
    async fn insert_document(&self, doc: &Document) -> Result<()> {
        let mut tx = self.pool.begin().await.service_err(Service::Storage)?;
        sqlx::query(
            r#"
            INSERT INTO documents (id, title, jurisdiction, content_ref, version, parent_id,
                                   created_by, created_at, modified_at, modified_by)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&doc.id)
        .bind(&doc.title)
        .bind(&doc.jurisdiction)
        .bind(&doc.content_ref)
        .bind(&doc.version)
        .bind(&doc.parent_id)
        .bind(&doc.created_by)
        .bind(doc.created_at.timestamp_millis())
        .bind(doc.modified_at.map(|t| t.timestamp_millis()))
        .bind(&doc.modified_by)
        .execute(&mut *tx)
        .await
        .service_err(Service::Storage)?;

        if let Some(weight) = doc.search_weight {
            weight.validate()?;
            upsert_weight(&mut tx, &doc.id, weight).await?;
        }
        tx.commit().await.service_err(Service::Storage)?;
        Ok(())
    }

    async fn get_document(&self, id: &str) -> Result<Option<Document>> {
        let sql = format!(
            "SELECT {} FROM documents d LEFT JOIN search_weights w ON w.document_id = d.id WHERE d.id = ?",
            DOCUMENT_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .service_err(Service::Storage)?;
        row.as_ref().map(row_to_document).transpose()
    }

    async fn delete_document(&self, id: &str) -> Result<()> {
        let mut tx = self.pool.begin().await.service_err(Service::Storage)?;
        sqlx::query("DELETE FROM search_weights WHERE document_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await
            .service_err(Service::Storage)?;
        sqlx::query("DELETE FROM documents WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await
            .service_err(Service::Storage)?;
        tx.commit().await.service_err(Service::Storage)?;
        Ok(())
    }

    async fn list_document_ids(&self) -> Result<Vec<String>> {
        sqlx::query_scalar("SELECT id FROM documents ORDER BY created_at, id")
            .fetch_all(&self.pool)
            .await
            .service_err(Service::Storage)
    }

    async fn list_by_jurisdiction(&self, jurisdiction: &str) -> Result<Vec<Document>> {
        let sql = format!(
            "SELECT {} FROM documents d LEFT JOIN search_weights w ON w.document_id = d.id \
             WHERE d.jurisdiction = ? ORDER BY d.created_at DESC, d.id",
            DOCUMENT_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(jurisdiction)
            .fetch_all(&self.pool)
            .await
            .service_err(Service::Storage)?;
        rows.iter().map(row_to_document).collect()
    }

    async fn children_of(&self, parent_id: &str) -> Result<Vec<Document>> {
        let sql = format!(
            "SELECT {} FROM documents d LEFT JOIN search_weights w ON w.document_id = d.id \
             WHERE d.parent_id = ? ORDER BY d.created_at, d.id",
            DOCUMENT_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(parent_id)
            .fetch_all(&self.pool)
            .await
            .service_err(Service::Storage)?;
        rows.iter().map(row_to_document).collect()
    }

    async fn set_search_weight(&self, document_id: &str, weight: SearchWeight) -> Result<()> {
        weight.validate()?;
        let mut tx = self.pool.begin().await.service_err(Service::Storage)?;
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents WHERE id = ?")
            .bind(document_id)
            .fetch_one(&mut *tx)
            .await
            .service_err(Service::Storage)?;
        if count == 0 {
            return Err(Error::not_found("document", document_id));
        }
        upsert_weight(&mut tx, document_id, weight).await?;
        tx.commit().await.service_err(Service::Storage)?;
        Ok(())
    }

    async fn replace_chunks(&self, document_id: &str, chunks: &[Chunk]) -> Result<()> {
        let mut tx = self.pool.begin().await.service_err(Service::Storage)?;

        sqlx::query("DELETE FROM chunks WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await
            .service_err(Service::Storage)?;

        for chunk in chunks {
            sqlx::query(
                r#"
                INSERT INTO chunks (id, document_id, chunk_index, page, text, hash,
                                    start_offset, end_offset)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&chunk.id)
            .bind(document_id)
            .bind(chunk.chunk_index)
            .bind(chunk.page as i64)
            .bind(&chunk.text)
            .bind(&chunk.hash)
            .bind(chunk.start_offset as i64)
            .bind(chunk.end_offset as i64)
            .execute(&mut *tx)
            .await
            .service_err(Service::Storage)?;
        }

        tx.commit().await.service_err(Service::Storage)?;
        Ok(())
    }

    async fn delete_chunks_for_document(&self, document_id: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM chunks WHERE document_id = ?")
            .bind(document_id)
            .execute(&self.pool)
            .await
            .service_err(Service::Storage)?;
        Ok(result.rows_affected())
    }

    async fn list_chunks(&self, document_id: &str) -> Result<Vec<Chunk>> {
        let rows = sqlx::query("SELECT * FROM chunks WHERE document_id = ? ORDER BY chunk_index")
            .bind(document_id)
            .fetch_all(&self.pool)
            .await
            .service_err(Service::Storage)?;
        Ok(rows.iter().map(row_to_chunk).collect())
    }

    async fn get_chunk(&self, chunk_id: &str) -> Result<Option<Chunk>> {
        let row = sqlx::query("SELECT * FROM chunks WHERE id = ?")
            .bind(chunk_id)
            .fetch_optional(&self.pool)
            .await
            .service_err(Service::Storage)?;
        Ok(row.as_ref().map(row_to_chunk))
    }
}

async fn upsert_weight(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    document_id: &str,
    weight: SearchWeight,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO search_weights (document_id, jurisdiction_score, recency_score, manual_boost)
        VALUES (?, ?, ?, ?)
        ON CONFLICT(document_id) DO UPDATE SET
            jurisdiction_score = excluded.jurisdiction_score,
            recency_score = excluded.recency_score,
            manual_boost = excluded.manual_boost
        "#,
    )
    .bind(document_id)
    .bind(weight.jurisdiction_score)
    .bind(weight.recency_score)
    .bind(weight.manual_boost)
    .execute(&mut **tx)
    .await
    .service_err(Service::Storage)?;
    Ok(())
}

// ============ In-memory ============

/// Map-backed store for tests.
#[derive(Default)]
pub struct InMemoryDocumentStore {
    docs: RwLock<HashMap<String, Document>>,
    chunks: RwLock<HashMap<String, Vec<Chunk>>>,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned<E: std::fmt::Display>(err: E) -> Error {
    Error::external(Service::Storage, format!("lock poisoned: {}", err))
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn insert_document(&self, doc: &Document) -> Result<()> {
        if let Some(weight) = &doc.search_weight {
            weight.validate()?;
        }
        let mut docs = self.docs.write().map_err(poisoned)?;
        if docs.contains_key(&doc.id) {
            return Err(Error::external(
                Service::Storage,
                format!("document {} already exists", doc.id),
            ));
        }
        docs.insert(doc.id.clone(), doc.clone());
        Ok(())
    }

    async fn get_document(&self, id: &str) -> Result<Option<Document>> {
        Ok(self.docs.read().map_err(poisoned)?.get(id).cloned())
    }

    async fn delete_document(&self, id: &str) -> Result<()> {
        self.docs.write().map_err(poisoned)?.remove(id);
        Ok(())
    }

    async fn list_document_ids(&self) -> Result<Vec<String>> {
        let docs = self.docs.read().map_err(poisoned)?;
        let mut all: Vec<&Document> = docs.values().collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(all.into_iter().map(|d| d.id.clone()).collect())
    }

    async fn list_by_jurisdiction(&self, jurisdiction: &str) -> Result<Vec<Document>> {
        let docs = self.docs.read().map_err(poisoned)?;
        let mut matching: Vec<Document> = docs
            .values()
            .filter(|d| d.jurisdiction == jurisdiction)
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(matching)
    }

    async fn children_of(&self, parent_id: &str) -> Result<Vec<Document>> {
        let docs = self.docs.read().map_err(poisoned)?;
        let mut children: Vec<Document> = docs
            .values()
            .filter(|d| d.parent_id.as_deref() == Some(parent_id))
            .cloned()
            .collect();
        children.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(children)
    }

    async fn set_search_weight(&self, document_id: &str, weight: SearchWeight) -> Result<()> {
        weight.validate()?;
        let mut docs = self.docs.write().map_err(poisoned)?;
        let doc = docs
            .get_mut(document_id)
            .ok_or_else(|| Error::not_found("document", document_id))?;
        doc.search_weight = Some(weight);
        Ok(())
    }

    async fn replace_chunks(&self, document_id: &str, chunks: &[Chunk]) -> Result<()> {
        let stored: Vec<Chunk> = chunks
            .iter()
            .map(|c| Chunk {
                embedding: Vec::new(),
                ..c.clone()
            })
            .collect();
        self.chunks
            .write()
            .map_err(poisoned)?
            .insert(document_id.to_string(), stored);
        Ok(())
    }

    async fn delete_chunks_for_document(&self, document_id: &str) -> Result<u64> {
        let removed = self.chunks.write().map_err(poisoned)?.remove(document_id);
        Ok(removed.map_or(0, |c| c.len() as u64))
    }

    async fn list_chunks(&self, document_id: &str) -> Result<Vec<Chunk>> {
        let chunks = self.chunks.read().map_err(poisoned)?;
        let mut list = chunks.get(document_id).cloned().unwrap_or_default();
        list.sort_by_key(|c| c.chunk_index);
        Ok(list)
    }

    async fn get_chunk(&self, chunk_id: &str) -> Result<Option<Chunk>> {
        let chunks = self.chunks.read().map_err(poisoned)?;
        Ok(chunks
            .values()
            .flat_map(|list| list.iter())
            .find(|c| c.id == chunk_id)
            .cloned())
    }
}
