//! Offline feature-hashing embedder.
//!
//! Maps each lower-cased alphanumeric token to one of `dims` buckets with
//! FNV-1a and L2-normalizes the counts. Texts sharing vocabulary land close
//! together under cosine similarity, which is enough for local runs and
//! tests without a model server. The model name only changes the hash seed.

use std::sync::RwLock;

use async_trait::async_trait;

use crate::embedding::EmbeddingService;
use crate::error::Result;

pub struct HashingEmbeddingService {
    dims: usize,
    model: RwLock<String>,
}

impl HashingEmbeddingService {
    pub fn new(dims: usize) -> Self {
        Self {
            dims: dims.max(1),
            model: RwLock::new("hashing-v1".to_string()),
        }
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    fn embed_with(&self, model: &str, text: &str) -> Vec<f32> {
        let seed = fnv1a(model.as_bytes(), FNV_OFFSET);
        let mut v = vec![0.0f32; self.dims];
        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let bucket = fnv1a(token.to_lowercase().as_bytes(), seed) as usize % self.dims;
            v[bucket] += 1.0;
        }
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > f32::EPSILON {
            for x in &mut v {
                *x /= norm;
            }
        }
        v
    }
}

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

fn fnv1a(bytes: &[u8], seed: u64) -> u64 {
    bytes
        .iter()
        .fold(seed, |h, b| (h ^ u64::from(*b)).wrapping_mul(FNV_PRIME))
}

#[async_trait]
impl EmbeddingService for HashingEmbeddingService {
    fn model_name(&self) -> String {
        match self.model.read() {
            Ok(model) => model.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn set_model(&self, model: &str) {
        let mut guard = match self.model.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = model.to_string();
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let model = self.model_name();
        Ok(texts.iter().map(|t| self.embed_with(&model, t)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::cosine_similarity;

    #[tokio::test]
    async fn test_shared_vocabulary_is_closer() {
        let service = HashingEmbeddingService::new(256);
        let q = service.embed("lien priority").await.unwrap();
        let near = service
            .embed("The priority of a mechanic's lien is fixed at filing.")
            .await
            .unwrap();
        let far = service
            .embed("Custody arrangements for minor children.")
            .await
            .unwrap();
        assert!(cosine_similarity(&q, &near) > cosine_similarity(&q, &far));
    }

    #[tokio::test]
    async fn test_deterministic_and_normalized() {
        let service = HashingEmbeddingService::new(64);
        let a = service.embed("Same words").await.unwrap();
        let b = service.embed("same WORDS").await.unwrap();
        assert_eq!(a, b);
        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn test_empty_text_is_zero_vector() {
        let service = HashingEmbeddingService::new(8);
        let v = service.embed("   ").await.unwrap();
        assert_eq!(v, vec![0.0; 8]);
    }
}
