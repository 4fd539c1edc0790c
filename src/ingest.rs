//! Ingestion orchestration.
//!
//! Turns a stored document into indexed chunks:
//!
//! ```text
//! DocumentStore ─► BlobStore::fetch ─► PageExtractor ─► Segmenter (per page)
//!     ─► EmbeddingBatcher ─► DocumentStore::replace_chunks
//!     ─► { VectorIndex::upsert ∥ KeywordIndex::index_batch }
//! ```
//!
//! Processing is all-or-nothing: an error anywhere aborts the run and is
//! returned, and if it happens after chunks were written the partial state
//! is cleaned up so no chunk stays embedded but unindexed. Cleanup deletions
//! are best-effort; their failures are logged, never returned.
//!
//! Work on one document id is serialized: process, reprocess, and delete
//! of the same id never overlap.
//!
//! This module also owns document intake (upload and revision), which
//! writes the blob and the document row but does not process it.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio::sync::OwnedMutexGuard;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::backends::Backends;
use crate::config::{ChunkingConfig, EmbeddingConfig};
use crate::embedding::batcher::EmbeddingBatcher;
use crate::error::{Error, Result};
use crate::extract::content_type_for;
use crate::models::{next_version, Chunk, Document, KeywordRecord, VectorRecord, INITIAL_VERSION};
use crate::segment::Segmenter;

/// Counts from one successful processing run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessSummary {
    pub pages: usize,
    pub chunks: usize,
}

/// Tally of a bulk reprocessing pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReindexSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
}

/// A file to store as a new document.
#[derive(Debug, Clone)]
pub struct NewDocument {
    pub title: String,
    pub jurisdiction: String,
    pub created_by: String,
    /// Original file name; its extension selects the page extractor.
    pub file_name: String,
    pub bytes: Vec<u8>,
}

/// Per-id async locks. Entries nobody holds are pruned on the next acquire.
#[derive(Default)]
struct DocumentLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl DocumentLocks {
    async fn acquire(&self, id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = match self.locks.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            locks.retain(|_, l| Arc::strong_count(l) > 1);
            Arc::clone(locks.entry(id.to_string()).or_default())
        };
        lock.lock_owned().await
    }
}

pub struct Orchestrator {
    backends: Backends,
    segmenter: Segmenter,
    batcher: EmbeddingBatcher,
    locks: DocumentLocks,
}

impl Orchestrator {
    pub fn new(
        backends: Backends,
        chunking: ChunkingConfig,
        embedding: &EmbeddingConfig,
    ) -> Result<Self> {
        let batcher = EmbeddingBatcher::new(
            Arc::clone(&backends.embedder),
            embedding.batch_size,
            embedding.max_concurrent_batches,
        );
        Ok(Self {
            segmenter: Segmenter::new(chunking)?,
            batcher,
            backends,
            locks: DocumentLocks::default(),
        })
    }

    pub fn backends(&self) -> &Backends {
        &self.backends
    }

    // ============ Intake ============

    /// Store the file and create version `1.0` of a new document.
    pub async fn upload(&self, new: NewDocument) -> Result<Document> {
        validate_intake(&new)?;
        let doc = Document {
            id: Uuid::new_v4().to_string(),
            title: new.title.trim().to_string(),
            jurisdiction: new.jurisdiction.trim().to_string(),
            content_ref: String::new(),
            version: INITIAL_VERSION.to_string(),
            parent_id: None,
            created_by: new.created_by,
            created_at: Utc::now(),
            modified_at: None,
            modified_by: None,
            search_weight: None,
        };
        self.store_new(doc, &new.file_name, &new.bytes).await
    }

    /// Store a new revision of `parent_id`. The revision is its own
    /// document with the next minor version and inherits title and
    /// jurisdiction from its parent.
    pub async fn revise(
        &self,
        parent_id: &str,
        editor: &str,
        file_name: &str,
        bytes: Vec<u8>,
    ) -> Result<Document> {
        let parent = self
            .backends
            .store
            .get_document(parent_id)
            .await?
            .ok_or_else(|| Error::Validation(format!("unknown parent document: {}", parent_id)))?;
        if editor.trim().is_empty() {
            return Err(Error::Validation("editor must not be empty".into()));
        }

        let now = Utc::now();
        let doc = Document {
            id: Uuid::new_v4().to_string(),
            title: parent.title.clone(),
            jurisdiction: parent.jurisdiction.clone(),
            content_ref: String::new(),
            version: next_version(&parent.version)?,
            parent_id: Some(parent.id.clone()),
            created_by: editor.to_string(),
            created_at: now,
            modified_at: Some(now),
            modified_by: Some(editor.to_string()),
            search_weight: None,
        };
        self.store_new(doc, file_name, &bytes).await
    }

    async fn store_new(&self, mut doc: Document, file_name: &str, bytes: &[u8]) -> Result<Document> {
        doc.content_ref = format!("{}/{}", doc.id, blob_file_name(file_name));
        self.backends.blobs.put(&doc.content_ref, bytes).await?;
        if let Err(e) = self.backends.store.insert_document(&doc).await {
            if let Err(cleanup) = self.backends.blobs.delete(&doc.content_ref).await {
                warn!(key = %doc.content_ref, error = %cleanup, "failed to remove orphaned blob");
            }
            return Err(e);
        }
        info!(document_id = %doc.id, version = %doc.version, bytes = bytes.len(), "stored document");
        Ok(doc)
    }

    // ============ Processing ============

    /// Segment, embed, persist, and index one document.
    pub async fn process_document(&self, id: &str) -> Result<ProcessSummary> {
        let _guard = self.locks.acquire(id).await;
        self.process_locked(id).await
    }

    /// Best-effort removal of the document's chunks and index entries,
    /// then a fresh [`process_document`](Self::process_document).
    pub async fn reprocess_document(&self, id: &str) -> Result<ProcessSummary> {
        let _guard = self.locks.acquire(id).await;
        self.clear_derived(id).await;
        self.process_locked(id).await
    }

    /// Reprocess every stored document. Failures are counted, not returned.
    pub async fn reindex_all(&self) -> Result<ReindexSummary> {
        let ids = self.backends.store.list_document_ids().await?;
        let mut summary = ReindexSummary {
            total: ids.len(),
            ..ReindexSummary::default()
        };

        for (i, id) in ids.iter().enumerate() {
            match self.reprocess_document(id).await {
                Ok(done) => {
                    summary.succeeded += 1;
                    info!(document_id = %id, chunks = done.chunks, progress = %format!("{}/{}", i + 1, ids.len()), "reindexed");
                }
                Err(e) => {
                    summary.failed += 1;
                    error!(document_id = %id, error = %e, "reindex failed");
                }
            }
        }

        info!(
            total = summary.total,
            succeeded = summary.succeeded,
            failed = summary.failed,
            "reindex complete"
        );
        Ok(summary)
    }

    /// Optionally switch the embedding model, then reindex everything.
    pub async fn update_embedding_model(&self, model: Option<&str>) -> Result<ReindexSummary> {
        if let Some(model) = model {
            let previous = self.batcher.model_name();
            self.batcher.set_model(model);
            info!(from = %previous, to = %model, "embedding model switched");
        }
        self.reindex_all().await
    }

    /// Remove a document with its chunks, index entries, and blob.
    ///
    /// Only the final removal of the document row can fail the call; every
    /// other deletion is best-effort.
    pub async fn delete_document(&self, id: &str) -> Result<()> {
        let _guard = self.locks.acquire(id).await;
        let doc = self
            .backends
            .store
            .get_document(id)
            .await?
            .ok_or_else(|| Error::not_found("document", id))?;

        self.clear_derived(id).await;
        if let Err(e) = self.backends.blobs.delete(&doc.content_ref).await {
            warn!(document_id = %id, key = %doc.content_ref, error = %e, "blob delete failed");
        }
        self.backends.store.delete_document(id).await?;
        info!(document_id = %id, "deleted document");
        Ok(())
    }

    async fn process_locked(&self, id: &str) -> Result<ProcessSummary> {
        let doc = self
            .backends
            .store
            .get_document(id)
            .await?
            .ok_or_else(|| Error::not_found("document", id))?;

        let bytes = self.backends.blobs.fetch(&doc.content_ref).await?;
        let pages = self
            .backends
            .extractor
            .extract_pages(&bytes, content_type_for(&doc.content_ref))
            .await?;

        let mut chunks = self.segment_pages(&doc.id, &pages);
        self.batcher.embed_chunks(&mut chunks).await?;

        self.backends.store.replace_chunks(&doc.id, &chunks).await?;
        // Index entries from an earlier run are keyed by the old chunk ids.
        self.clear_indexes(&doc.id).await;
        if let Err(e) = self.index_chunks(&doc, &chunks).await {
            warn!(document_id = %doc.id, error = %e, "indexing failed; rolling back chunks");
            self.clear_derived(&doc.id).await;
            return Err(e);
        }

        let summary = ProcessSummary {
            pages: pages.len(),
            chunks: chunks.len(),
        };
        info!(
            document_id = %doc.id,
            pages = summary.pages,
            chunks = summary.chunks,
            model = %self.batcher.model_name(),
            "processed document"
        );
        Ok(summary)
    }

    /// Segment each page (numbered from 1) and number chunks across the
    /// whole document.
    fn segment_pages(&self, document_id: &str, pages: &[String]) -> Vec<Chunk> {
        let mut chunks: Vec<Chunk> = pages
            .iter()
            .enumerate()
            .flat_map(|(i, text)| self.segmenter.segment_page(document_id, i as u32 + 1, text))
            .collect();
        for (index, chunk) in chunks.iter_mut().enumerate() {
            chunk.chunk_index = index as i64;
        }
        chunks
    }

    async fn index_chunks(&self, doc: &Document, chunks: &[Chunk]) -> Result<()> {
        let vector_records: Vec<VectorRecord> =
            chunks.iter().map(|c| VectorRecord::from_chunk(c, doc)).collect();
        let keyword_records: Vec<KeywordRecord> =
            chunks.iter().map(|c| KeywordRecord::from_chunk(c, doc)).collect();

        tokio::try_join!(
            self.backends.vectors.upsert(&vector_records),
            self.backends.keywords.index_batch(&keyword_records),
        )?;
        Ok(())
    }

    async fn clear_derived(&self, id: &str) {
        let (chunks, ()) = tokio::join!(
            self.backends.store.delete_chunks_for_document(id),
            self.clear_indexes(id),
        );
        if let Err(e) = chunks {
            warn!(document_id = %id, error = %e, "chunk delete failed");
        }
    }

    async fn clear_indexes(&self, id: &str) {
        let (vectors, keywords) = tokio::join!(
            self.backends.vectors.delete_by_document(id),
            self.backends.keywords.delete_by_document(id),
        );
        if let Err(e) = vectors {
            warn!(document_id = %id, error = %e, "vector delete failed");
        }
        if let Err(e) = keywords {
            warn!(document_id = %id, error = %e, "keyword delete failed");
        }
    }
}

fn validate_intake(new: &NewDocument) -> Result<()> {
    for (field, value) in [
        ("title", &new.title),
        ("jurisdiction", &new.jurisdiction),
        ("created_by", &new.created_by),
    ] {
        if value.trim().is_empty() {
            return Err(Error::Validation(format!("{} must not be empty", field)));
        }
    }
    Ok(())
}

/// Last path component of an uploaded file name, or `content.txt`.
fn blob_file_name(file_name: &str) -> String {
    Path::new(file_name)
        .file_name()
        .and_then(|n| n.to_str())
        .filter(|n| !n.trim().is_empty())
        .unwrap_or("content.txt")
        .to_string()
}
