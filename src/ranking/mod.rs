//! Hybrid retrieval: concurrent vector + keyword lookup, weighted fusion,
//! then per-document boosting.
//!
//! # Pipeline
//!
//! ```text
//! query ──┬─► embed ─► VectorIndex::query ──┐
//!         │                                 ├─► fuse ─► resolve ─► boost ─► top_k
//!         └─► KeywordIndex::search ─────────┘
//! ```
//!
//! Each enabled channel fetches `2 × top_k` candidates. A channel that
//! fails (including a failed query embedding) is logged and dropped; the
//! surviving channel's weighted scores are ranked alone. If every enabled
//! channel fails the result is empty. Candidates whose chunk or document no
//! longer exists in the [`DocumentStore`] are skipped.
//!
//! Each channel runs under an optional timeout, taken from the request or
//! else from the ranker. An expired channel is dropped like a failed one
//! and ranking proceeds on whatever completed. [`Error::Timeout`] is
//! returned only when a channel expired and none produced hits.

pub mod boost;
pub mod fusion;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::embedding::EmbeddingService;
use crate::error::{Error, Result};
use crate::keyword::{KeywordHit, KeywordIndex};
use crate::models::{Document, RankedHit, ScoreExplanation, SearchFilters};
use crate::store::DocumentStore;
use crate::vector::{VectorHit, VectorIndex};

use boost::{apply_boosts, BoostInput};
use fusion::{fuse, FusionWeights};

/// Snippet length, in characters, when no highlighted fragment exists.
const PLAIN_SNIPPET_CHARS: usize = 240;

#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub query: String,
    pub use_semantic: bool,
    pub use_keyword: bool,
    pub semantic_weight: f64,
    pub keyword_weight: f64,
    pub top_k: usize,
    pub filters: SearchFilters,
    /// Attach a [`ScoreExplanation`] to every hit.
    pub explain: bool,
    /// Per-channel deadline; overrides the ranker's default.
    pub timeout: Option<Duration>,
}

impl SearchRequest {
    /// Both channels enabled, weights 0.7 / 0.3, ten results.
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            use_semantic: true,
            use_keyword: true,
            semantic_weight: 0.7,
            keyword_weight: 0.3,
            top_k: 10,
            filters: SearchFilters::default(),
            explain: false,
            timeout: None,
        }
    }

    fn weights(&self) -> Result<FusionWeights> {
        if self.query.trim().is_empty() {
            return Err(Error::Validation("query must not be empty".into()));
        }
        if self.top_k == 0 {
            return Err(Error::Validation("top_k must be >= 1".into()));
        }
        if !self.use_semantic && !self.use_keyword {
            return Err(Error::Validation(
                "at least one of semantic or keyword search must be enabled".into(),
            ));
        }
        let semantic = if self.use_semantic { self.semantic_weight } else { 0.0 };
        let keyword = if self.use_keyword { self.keyword_weight } else { 0.0 };
        FusionWeights::normalize(semantic, keyword)
    }
}

pub struct HybridRanker {
    embedder: Arc<dyn EmbeddingService>,
    vectors: Arc<dyn VectorIndex>,
    keywords: Arc<dyn KeywordIndex>,
    store: Arc<dyn DocumentStore>,
    timeout: Option<Duration>,
}

/// Result of one retrieval channel.
enum Channel<T> {
    Skipped,
    Hits(Vec<T>),
    Failed,
    TimedOut,
}

impl<T> Channel<T> {
    fn from_result(name: &str, result: Result<Vec<T>>) -> Self {
        match result {
            Ok(hits) => {
                debug!(channel = name, hits = hits.len(), "channel returned");
                Channel::Hits(hits)
            }
            Err(e) => {
                warn!(channel = name, error = %e, "retrieval channel failed; ranking without it");
                Channel::Failed
            }
        }
    }

    fn into_hits(self) -> Vec<T> {
        match self {
            Channel::Hits(hits) => hits,
            Channel::Skipped | Channel::Failed | Channel::TimedOut => Vec::new(),
        }
    }
}

impl HybridRanker {
    pub fn new(
        embedder: Arc<dyn EmbeddingService>,
        vectors: Arc<dyn VectorIndex>,
        keywords: Arc<dyn KeywordIndex>,
        store: Arc<dyn DocumentStore>,
    ) -> Self {
        Self {
            embedder,
            vectors,
            keywords,
            store,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    async fn bounded<T, F>(name: &str, limit: Option<Duration>, lookup: F) -> Channel<T>
    where
        F: std::future::Future<Output = Result<Vec<T>>>,
    {
        let Some(limit) = limit else {
            return Channel::from_result(name, lookup.await);
        };
        match tokio::time::timeout(limit, lookup).await {
            Ok(result) => Channel::from_result(name, result),
            Err(_) => {
                warn!(
                    channel = name,
                    timeout_ms = limit.as_millis() as u64,
                    "retrieval channel timed out; ranking without it"
                );
                Channel::TimedOut
            }
        }
    }

    pub async fn search(&self, request: &SearchRequest) -> Result<Vec<RankedHit>> {
        self.search_at(request, Utc::now()).await
    }

    /// Like [`search`](Self::search) with an explicit clock for the
    /// recency boost.
    pub async fn search_at(
        &self,
        request: &SearchRequest,
        now: DateTime<Utc>,
    ) -> Result<Vec<RankedHit>> {
        let weights = request.weights()?;
        let candidate_k = request.top_k.saturating_mul(2);

        let limit = request.timeout.or(self.timeout);
        let (semantic, keyword) = self.retrieve(request, weights, candidate_k, limit).await;

        let any_ok = matches!(semantic, Channel::Hits(_)) || matches!(keyword, Channel::Hits(_));
        let timed_out =
            matches!(semantic, Channel::TimedOut) || matches!(keyword, Channel::TimedOut);
        if !any_ok {
            if let (true, Some(limit)) = (timed_out, limit) {
                return Err(Error::Timeout(limit));
            }
            warn!(query = %request.query, "every retrieval channel failed; returning no results");
            return Ok(Vec::new());
        }

        let vector_hits = semantic.into_hits();
        let keyword_hits = keyword.into_hits();
        let fused = fuse(&vector_hits, &keyword_hits, weights);

        let mut documents: HashMap<String, Option<Document>> = HashMap::new();
        let mut inputs = Vec::with_capacity(fused.len());
        for candidate in fused {
            let Some(chunk) = self.store.get_chunk(&candidate.chunk_id).await? else {
                debug!(chunk_id = %candidate.chunk_id, "dropping stale chunk");
                continue;
            };
            if !documents.contains_key(&chunk.document_id) {
                let doc = self.store.get_document(&chunk.document_id).await?;
                documents.insert(chunk.document_id.clone(), doc);
            }
            let Some(Some(doc)) = documents.get(&chunk.document_id) else {
                debug!(document_id = %chunk.document_id, "dropping chunk of deleted document");
                continue;
            };

            let snippet = candidate
                .snippet
                .clone()
                .unwrap_or_else(|| chunk.text.chars().take(PLAIN_SNIPPET_CHARS).collect());
            let explain = request.explain.then_some(ScoreExplanation {
                semantic: candidate.semantic,
                keyword: candidate.keyword,
                fused: candidate.fused,
                boost: 1.0,
            });
            inputs.push(BoostInput {
                hit: RankedHit {
                    chunk_id: candidate.chunk_id,
                    document_id: doc.id.clone(),
                    title: doc.title.clone(),
                    jurisdiction: doc.jurisdiction.clone(),
                    content_url: doc.content_ref.clone(),
                    page: chunk.page,
                    snippet,
                    score: candidate.fused,
                    explain,
                },
                weight: doc.search_weight,
                created_at: doc.created_at,
            });
        }

        Ok(apply_boosts(inputs, now, request.top_k))
    }

    /// Query both channels concurrently.
    async fn retrieve(
        &self,
        request: &SearchRequest,
        weights: FusionWeights,
        candidate_k: usize,
        limit: Option<Duration>,
    ) -> (Channel<VectorHit>, Channel<KeywordHit>) {
        let semantic = async {
            if weights.semantic <= 0.0 {
                return Channel::Skipped;
            }
            let lookup = async {
                let query_vector = self.embedder.embed(&request.query).await?;
                self.vectors
                    .query(&query_vector, &request.filters, candidate_k)
                    .await
            };
            Self::bounded("semantic", limit, lookup).await
        };

        let keyword = async {
            if weights.keyword <= 0.0 {
                return Channel::Skipped;
            }
            let lookup = self
                .keywords
                .search(&request.query, &request.filters, candidate_k);
            Self::bounded("keyword", limit, lookup).await
        };

        tokio::join!(semantic, keyword)
    }
}
