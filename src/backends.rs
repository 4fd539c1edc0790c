//! The set of collaborators the orchestrator and ranker share.

use std::sync::Arc;

use tracing::info;

use crate::blob::{BlobStore, FsBlobStore, InMemoryBlobStore};
use crate::config::Config;
use crate::embedding::{create_service, EmbeddingService};
use crate::error::Result;
use crate::extract::{DefaultPageExtractor, PageExtractor};
use crate::keyword::{InMemoryKeywordIndex, KeywordIndex, SqliteKeywordIndex};
use crate::ranking::HybridRanker;
use crate::store::{DocumentStore, InMemoryDocumentStore, SqliteDocumentStore};
use crate::vector::{InMemoryVectorIndex, SqliteVectorIndex, VectorIndex};
use crate::{db, migrate};

#[derive(Clone)]
pub struct Backends {
    pub store: Arc<dyn DocumentStore>,
    pub blobs: Arc<dyn BlobStore>,
    pub extractor: Arc<dyn PageExtractor>,
    pub embedder: Arc<dyn EmbeddingService>,
    pub vectors: Arc<dyn VectorIndex>,
    pub keywords: Arc<dyn KeywordIndex>,
}

impl Backends {
    /// SQLite for documents and both indexes, the filesystem for blobs, and
    /// the configured embedding provider. Runs migrations.
    pub async fn open(config: &Config) -> Result<Self> {
        let pool = db::connect(config).await?;
        migrate::run_migrations(&pool).await?;
        let embedder = create_service(&config.embedding)?;
        info!(
            db = %config.db.path.display(),
            blobs = %config.blob.root.display(),
            model = %embedder.model_name(),
            "backends ready"
        );

        Ok(Self {
            store: Arc::new(SqliteDocumentStore::new(pool.clone())),
            blobs: Arc::new(FsBlobStore::new(config.blob.root.clone())),
            extractor: Arc::new(DefaultPageExtractor),
            embedder,
            vectors: Arc::new(SqliteVectorIndex::new(pool.clone())),
            keywords: Arc::new(SqliteKeywordIndex::new(pool)),
        })
    }

    /// Everything in memory except the embedder.
    pub fn in_memory(embedder: Arc<dyn EmbeddingService>) -> Self {
        Self {
            store: Arc::new(InMemoryDocumentStore::new()),
            blobs: Arc::new(InMemoryBlobStore::new()),
            extractor: Arc::new(DefaultPageExtractor),
            embedder,
            vectors: Arc::new(InMemoryVectorIndex::new()),
            keywords: Arc::new(InMemoryKeywordIndex::new()),
        }
    }

    pub fn ranker(&self) -> HybridRanker {
        HybridRanker::new(
            Arc::clone(&self.embedder),
            Arc::clone(&self.vectors),
            Arc::clone(&self.keywords),
            Arc::clone(&self.store),
        )
    }
}
