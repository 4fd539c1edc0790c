//! Batched embedding assignment.
//!
//! A document's chunks are cut into consecutive batches of `batch_size`.
//! Each batch's texts go to the embedding service in one call and the
//! returned vectors are written back to the chunks by position. Batches
//! run concurrently (bounded by `max_concurrent`), but the assignment is
//! all-or-nothing: if any batch fails or comes back short, no chunk is
//! left half-embedded and the error is returned.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::debug;

use crate::embedding::EmbeddingService;
use crate::error::{Error, Result, Service};
use crate::models::Chunk;

pub struct EmbeddingBatcher {
    service: Arc<dyn EmbeddingService>,
    batch_size: usize,
    max_concurrent: usize,
}

impl EmbeddingBatcher {
    pub fn new(service: Arc<dyn EmbeddingService>, batch_size: usize, max_concurrent: usize) -> Self {
        Self {
            service,
            batch_size: batch_size.max(1),
            max_concurrent: max_concurrent.max(1),
        }
    }

    pub fn service(&self) -> &Arc<dyn EmbeddingService> {
        &self.service
    }

    pub fn model_name(&self) -> String {
        self.service.model_name()
    }

    /// Switch the embedding model. Batches already submitted keep the
    /// model they were sent with.
    pub fn set_model(&self, model: &str) {
        self.service.set_model(model);
    }

    /// Fill `embedding` on every chunk.
    pub async fn embed_chunks(&self, chunks: &mut [Chunk]) -> Result<()> {
        if chunks.is_empty() {
            return Ok(());
        }

        let batch_count = chunks.len().div_ceil(self.batch_size);
        let semaphore = Arc::new(Semaphore::new(self.max_concurrent));
        let mut tasks = JoinSet::new();

        for (batch_no, batch) in chunks.chunks(self.batch_size).enumerate() {
            let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
            let service = Arc::clone(&self.service);
            let permit = Arc::clone(&semaphore)
                .acquire_owned()
                .await
                .map_err(|e| Error::external(Service::Embedding, e))?;
            tasks.spawn(async move {
                let _permit = permit;
                let result = service.embed_batch(&texts).await;
                (batch_no, texts.len(), result)
            });
        }

        let mut results: Vec<Option<Vec<Vec<f32>>>> = vec![None; batch_count];
        while let Some(joined) = tasks.join_next().await {
            let (batch_no, submitted, result) =
                joined.map_err(|e| Error::external(Service::Embedding, e))?;
            let vectors = result?;
            if vectors.len() < submitted {
                return Err(Error::external(
                    Service::Embedding,
                    format!(
                        "batch {} returned {} vectors for {} texts",
                        batch_no,
                        vectors.len(),
                        submitted
                    ),
                ));
            }
            debug!(batch = batch_no, vectors = submitted, "embedded batch");
            results[batch_no] = Some(vectors);
        }

        for (batch_no, (batch, vectors)) in chunks
            .chunks_mut(self.batch_size)
            .zip(results)
            .enumerate()
        {
            let vectors = vectors.ok_or_else(|| {
                Error::external(
                    Service::Embedding,
                    format!("batch {} produced no result", batch_no),
                )
            })?;
            for (chunk, vector) in batch.iter_mut().zip(vectors) {
                chunk.embedding = vector;
            }
        }

        Ok(())
    }
}
