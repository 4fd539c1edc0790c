//! End-to-end tests over the in-memory backends.
//!
//! Fixed-score and failing index implementations stand in for real
//! backends where a test needs exact scores or a broken dependency.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::Notify;

use docket::backends::Backends;
use docket::blob::BlobStore;
use docket::config::{ChunkingConfig, EmbeddingConfig};
use docket::embedding::hashing::HashingEmbeddingService;
use docket::embedding::EmbeddingService;
use docket::error::{Error, Result, Service};
use docket::ingest::{NewDocument, Orchestrator, ReindexSummary};
use docket::keyword::{InMemoryKeywordIndex, KeywordHit, KeywordIndex};
use docket::models::{Chunk, Document, KeywordRecord, SearchFilters, VectorRecord};
use docket::queue::{self, CancellationToken, DocumentProcessor, QueueReport};
use docket::ranking::{HybridRanker, SearchRequest};
use docket::store::{DocumentStore, InMemoryDocumentStore};
use docket::vector::{InMemoryVectorIndex, VectorHit, VectorIndex};
use docket::versions::VersionTreeResolver;

// ─── Stand-in backends ──────────────────────────────────────────────

/// Returns the same hits for every query.
struct FixedVectors(Vec<VectorHit>);

#[async_trait]
impl VectorIndex for FixedVectors {
    async fn ensure_collection(&self) -> Result<()> {
        Ok(())
    }
    async fn upsert(&self, _records: &[VectorRecord]) -> Result<()> {
        Ok(())
    }
    async fn query(&self, _v: &[f32], _f: &SearchFilters, top_k: usize) -> Result<Vec<VectorHit>> {
        Ok(self.0.iter().take(top_k).cloned().collect())
    }
    async fn delete_by_document(&self, _id: &str) -> Result<()> {
        Ok(())
    }
}

struct FixedKeywords(Vec<KeywordHit>);

#[async_trait]
impl KeywordIndex for FixedKeywords {
    async fn ensure_index(&self) -> Result<()> {
        Ok(())
    }
    async fn index_batch(&self, _records: &[KeywordRecord]) -> Result<()> {
        Ok(())
    }
    async fn search(&self, _q: &str, _f: &SearchFilters, top_k: usize) -> Result<Vec<KeywordHit>> {
        Ok(self.0.iter().take(top_k).cloned().collect())
    }
    async fn delete_by_document(&self, _id: &str) -> Result<()> {
        Ok(())
    }
}

/// Every call fails.
struct DownVectors;

#[async_trait]
impl VectorIndex for DownVectors {
    async fn ensure_collection(&self) -> Result<()> {
        Err(Error::external(Service::VectorIndex, "connection refused"))
    }
    async fn upsert(&self, _records: &[VectorRecord]) -> Result<()> {
        Err(Error::external(Service::VectorIndex, "connection refused"))
    }
    async fn query(&self, _v: &[f32], _f: &SearchFilters, _k: usize) -> Result<Vec<VectorHit>> {
        Err(Error::external(Service::VectorIndex, "connection refused"))
    }
    async fn delete_by_document(&self, _id: &str) -> Result<()> {
        Err(Error::external(Service::VectorIndex, "connection refused"))
    }
}

struct DownKeywords;

#[async_trait]
impl KeywordIndex for DownKeywords {
    async fn ensure_index(&self) -> Result<()> {
        Err(Error::external(Service::KeywordIndex, "connection refused"))
    }
    async fn index_batch(&self, _records: &[KeywordRecord]) -> Result<()> {
        Err(Error::external(Service::KeywordIndex, "connection refused"))
    }
    async fn search(&self, _q: &str, _f: &SearchFilters, _k: usize) -> Result<Vec<KeywordHit>> {
        Err(Error::external(Service::KeywordIndex, "connection refused"))
    }
    async fn delete_by_document(&self, _id: &str) -> Result<()> {
        Err(Error::external(Service::KeywordIndex, "connection refused"))
    }
}

/// Remembers how many candidates each query asked for.
#[derive(Default)]
struct RecordingVectors(Mutex<Vec<usize>>);

#[async_trait]
impl VectorIndex for RecordingVectors {
    async fn ensure_collection(&self) -> Result<()> {
        Ok(())
    }
    async fn upsert(&self, _records: &[VectorRecord]) -> Result<()> {
        Ok(())
    }
    async fn query(&self, _v: &[f32], _f: &SearchFilters, top_k: usize) -> Result<Vec<VectorHit>> {
        self.0.lock().unwrap().push(top_k);
        Ok(Vec::new())
    }
    async fn delete_by_document(&self, _id: &str) -> Result<()> {
        Ok(())
    }
}

#[derive(Default)]
struct RecordingKeywords(Mutex<Vec<usize>>);

#[async_trait]
impl KeywordIndex for RecordingKeywords {
    async fn ensure_index(&self) -> Result<()> {
        Ok(())
    }
    async fn index_batch(&self, _records: &[KeywordRecord]) -> Result<()> {
        Ok(())
    }
    async fn search(&self, _q: &str, _f: &SearchFilters, top_k: usize) -> Result<Vec<KeywordHit>> {
        self.0.lock().unwrap().push(top_k);
        Ok(Vec::new())
    }
    async fn delete_by_document(&self, _id: &str) -> Result<()> {
        Ok(())
    }
}

/// Answers queries after a long delay.
struct SlowVectors;

#[async_trait]
impl VectorIndex for SlowVectors {
    async fn ensure_collection(&self) -> Result<()> {
        Ok(())
    }
    async fn upsert(&self, _records: &[VectorRecord]) -> Result<()> {
        Ok(())
    }
    async fn query(&self, _v: &[f32], _f: &SearchFilters, _k: usize) -> Result<Vec<VectorHit>> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(Vec::new())
    }
    async fn delete_by_document(&self, _id: &str) -> Result<()> {
        Ok(())
    }
}

// ─── Fixtures ───────────────────────────────────────────────────────

fn embedder() -> Arc<dyn EmbeddingService> {
    Arc::new(HashingEmbeddingService::new(64))
}

fn orchestrator(backends: Backends) -> Orchestrator {
    Orchestrator::new(backends, ChunkingConfig::default(), &EmbeddingConfig::default()).unwrap()
}

fn upload(title: &str, jurisdiction: &str, body: &str) -> NewDocument {
    NewDocument {
        title: title.to_string(),
        jurisdiction: jurisdiction.to_string(),
        created_by: "clerk".to_string(),
        file_name: format!("{}.txt", title.to_lowercase().replace(' ', "-")),
        bytes: body.as_bytes().to_vec(),
    }
}

fn created() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2022, 3, 1, 0, 0, 0).unwrap()
}

/// Far enough after [`created`] that the recency bonus is zero.
fn much_later() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap()
}

fn document(id: &str) -> Document {
    Document {
        id: id.to_string(),
        title: format!("Title {}", id),
        jurisdiction: "CA".to_string(),
        content_ref: format!("{}/content.txt", id),
        version: "1.0".to_string(),
        parent_id: None,
        created_by: "clerk".to_string(),
        created_at: created(),
        modified_at: None,
        modified_by: None,
        search_weight: None,
    }
}

fn chunk(id: &str, document_id: &str, text: &str) -> Chunk {
    Chunk {
        id: id.to_string(),
        document_id: document_id.to_string(),
        chunk_index: 0,
        page: 1,
        text: text.to_string(),
        hash: String::new(),
        embedding: Vec::new(),
        start_offset: 0,
        end_offset: text.chars().count(),
    }
}

fn vector_hit(chunk_id: &str, score: f64) -> VectorHit {
    VectorHit {
        chunk_id: chunk_id.to_string(),
        score,
        metadata: BTreeMap::new(),
    }
}

fn keyword_hit(chunk_id: &str, score: f64) -> KeywordHit {
    KeywordHit {
        chunk_id: chunk_id.to_string(),
        document_id: format!("doc-{}", chunk_id),
        score,
        snippet: format!("... <mark>lien</mark> {} ...", chunk_id),
    }
}

/// One document per chunk id, each with a single chunk.
async fn seeded_store(chunk_ids: &[&str]) -> Arc<InMemoryDocumentStore> {
    let store = Arc::new(InMemoryDocumentStore::new());
    for id in chunk_ids {
        let doc_id = format!("doc-{}", id);
        store.insert_document(&document(&doc_id)).await.unwrap();
        store
            .replace_chunks(&doc_id, &[chunk(id, &doc_id, "Mechanics liens have priority.")])
            .await
            .unwrap();
    }
    store
}

// ─── Ranking ────────────────────────────────────────────────────────

#[tokio::test]
async fn test_lien_priority_fused_score_lands_in_top_five() {
    let store = seeded_store(&["lien", "s1", "s2", "s3", "k1", "k2", "k3"]).await;
    let vectors = FixedVectors(vec![
        vector_hit("s1", 0.95),
        vector_hit("lien", 0.9),
        vector_hit("s2", 0.6),
        vector_hit("s3", 0.4),
    ]);
    let keywords = FixedKeywords(vec![
        keyword_hit("k1", 0.99),
        keyword_hit("lien", 0.8),
        keyword_hit("k2", 0.5),
        keyword_hit("k3", 0.2),
    ]);
    let ranker = HybridRanker::new(embedder(), Arc::new(vectors), Arc::new(keywords), store);

    let mut request = SearchRequest::new("lien priority");
    request.top_k = 5;
    request.explain = true;
    let hits = ranker.search_at(&request, much_later()).await.unwrap();

    assert_eq!(hits.len(), 5);
    let lien = hits
        .iter()
        .find(|h| h.chunk_id == "lien")
        .expect("lien chunk should rank in the top five");
    assert!((lien.score - 0.87).abs() < 1e-9, "score {}", lien.score);
    let explain = lien.explain.unwrap();
    assert!((explain.semantic - 0.63).abs() < 1e-9);
    assert!((explain.keyword - 0.24).abs() < 1e-9);
    assert_eq!(explain.boost, 1.0);
    assert!(lien.snippet.contains("<mark>lien</mark>"));
    assert_eq!(hits[0].chunk_id, "lien");
}

#[tokio::test]
async fn test_failed_vector_channel_degrades_to_keyword() {
    let store = seeded_store(&["a", "b"]).await;
    let keywords = FixedKeywords(vec![keyword_hit("a", 0.9), keyword_hit("b", 0.4)]);
    let ranker = HybridRanker::new(embedder(), Arc::new(DownVectors), Arc::new(keywords), store);

    let mut request = SearchRequest::new("lien");
    request.explain = true;
    let hits = ranker.search_at(&request, much_later()).await.unwrap();

    let ids: Vec<&str> = hits.iter().map(|h| h.chunk_id.as_str()).collect();
    assert_eq!(ids, vec!["a", "b"]);
    // The keyword weight is not renormalized when the other channel fails.
    assert!((hits[0].score - 0.27).abs() < 1e-9);
    assert_eq!(hits[0].explain.unwrap().semantic, 0.0);
}

#[tokio::test]
async fn test_every_channel_failing_returns_no_results() {
    let store = seeded_store(&["a"]).await;
    let ranker = HybridRanker::new(embedder(), Arc::new(DownVectors), Arc::new(DownKeywords), store);
    let hits = ranker.search(&SearchRequest::new("lien")).await.unwrap();
    assert!(hits.is_empty());
}

#[tokio::test]
async fn test_slow_vector_channel_keeps_keyword_hits() {
    let store = seeded_store(&["a"]).await;
    let keywords = FixedKeywords(vec![keyword_hit("a", 0.9)]);
    let ranker = HybridRanker::new(embedder(), Arc::new(SlowVectors), Arc::new(keywords), store)
        .with_timeout(Duration::from_millis(50));

    let hits = tokio::time::timeout(
        Duration::from_secs(5),
        ranker.search_at(&SearchRequest::new("lien"), much_later()),
    )
    .await
    .expect("search should not wait for the slow channel")
    .unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].chunk_id, "a");
    assert!((hits[0].score - 0.27).abs() < 1e-9);
}

#[tokio::test]
async fn test_only_channel_timing_out_is_an_error() {
    let store = seeded_store(&["a"]).await;
    let ranker = HybridRanker::new(
        embedder(),
        Arc::new(SlowVectors),
        Arc::new(FixedKeywords(Vec::new())),
        store,
    )
    .with_timeout(Duration::from_millis(50));

    let mut request = SearchRequest::new("lien");
    request.use_keyword = false;
    let err = ranker.search(&request).await.unwrap_err();
    assert!(matches!(err, Error::Timeout(_)), "{:?}", err);
}

#[tokio::test]
async fn test_request_timeout_overrides_ranker_default() {
    let store = seeded_store(&["a"]).await;
    let ranker = HybridRanker::new(
        embedder(),
        Arc::new(SlowVectors),
        Arc::new(FixedKeywords(Vec::new())),
        store,
    );

    let mut request = SearchRequest::new("lien");
    request.use_keyword = false;
    request.timeout = Some(Duration::from_millis(50));
    let err = tokio::time::timeout(Duration::from_secs(5), ranker.search(&request))
        .await
        .expect("request deadline should apply")
        .unwrap_err();
    assert!(matches!(err, Error::Timeout(d) if d == Duration::from_millis(50)), "{:?}", err);
}

#[tokio::test]
async fn test_each_channel_fetches_twice_top_k() {
    let store = seeded_store(&["a"]).await;
    let vectors = Arc::new(RecordingVectors::default());
    let keywords = Arc::new(RecordingKeywords::default());
    let ranker = HybridRanker::new(embedder(), vectors.clone(), keywords.clone(), store);

    let mut request = SearchRequest::new("lien");
    request.top_k = 7;
    ranker.search(&request).await.unwrap();

    assert_eq!(*vectors.0.lock().unwrap(), vec![14]);
    assert_eq!(*keywords.0.lock().unwrap(), vec![14]);
}

#[tokio::test]
async fn test_hits_for_deleted_chunks_are_skipped() {
    let store = seeded_store(&["kept"]).await;
    let keywords = FixedKeywords(vec![keyword_hit("gone", 0.95), keyword_hit("kept", 0.5)]);
    let ranker = HybridRanker::new(embedder(), Arc::new(DownVectors), Arc::new(keywords), store);

    let hits = ranker.search(&SearchRequest::new("lien")).await.unwrap();
    let ids: Vec<&str> = hits.iter().map(|h| h.chunk_id.as_str()).collect();
    assert_eq!(ids, vec!["kept"]);
}

#[tokio::test]
async fn test_search_weight_reorders_results() {
    let store = seeded_store(&["plain", "boosted"]).await;
    store
        .set_search_weight(
            "doc-boosted",
            docket::models::SearchWeight::new(0.0, 0.0, 5.0).unwrap(),
        )
        .await
        .unwrap();
    let keywords = FixedKeywords(vec![keyword_hit("plain", 0.9), keyword_hit("boosted", 0.7)]);
    let ranker = HybridRanker::new(embedder(), Arc::new(DownVectors), Arc::new(keywords), store);

    let hits = ranker
        .search_at(&SearchRequest::new("lien"), much_later())
        .await
        .unwrap();
    assert_eq!(hits[0].chunk_id, "boosted");
    assert!((hits[0].score - 0.7 * 0.3 * 1.5).abs() < 1e-9);
}

// ─── Ingestion and retrieval ────────────────────────────────────────

const CIVIL_CODE: &str = "Section 1 Definitions.\n\
Section 2 Mechanics liens attach to the improved property.\x0c\
Section 3 Lien priority is determined by the date of recording.";

const NY_LAW: &str = "Section 1 Landlord duties.\nSection 2 Security deposits.";

#[tokio::test]
async fn test_upload_process_and_search() {
    let o = orchestrator(Backends::in_memory(embedder()));
    let civil = o.upload(upload("Civil Code", "CA", CIVIL_CODE)).await.unwrap();
    let ny = o.upload(upload("Real Property Law", "NY", NY_LAW)).await.unwrap();
    o.process_document(&civil.id).await.unwrap();
    o.process_document(&ny.id).await.unwrap();

    let ranker = o.backends().ranker();
    let hits = ranker
        .search(&SearchRequest::new("lien priority"))
        .await
        .unwrap();
    assert!(!hits.is_empty());
    assert_eq!(hits[0].document_id, civil.id);
    assert_eq!(hits[0].page, 2);
    assert!(hits[0].snippet.contains("<mark>"), "{}", hits[0].snippet);
    assert_eq!(hits[0].content_url, civil.content_ref);

    let mut ny_only = SearchRequest::new("section");
    ny_only.filters.jurisdictions = vec!["NY".to_string()];
    let hits = ranker.search(&ny_only).await.unwrap();
    assert!(!hits.is_empty());
    assert!(hits.iter().all(|h| h.jurisdiction == "NY"));
}

#[tokio::test]
async fn test_index_failure_rolls_back_chunks() {
    let mut backends = Backends::in_memory(embedder());
    backends.vectors = Arc::new(DownVectors);
    let o = orchestrator(backends);
    let doc = o.upload(upload("Civil Code", "CA", CIVIL_CODE)).await.unwrap();

    let err = o.process_document(&doc.id).await.unwrap_err();
    assert!(matches!(
        err,
        Error::ExternalService {
            service: Service::VectorIndex,
            ..
        }
    ));
    assert!(o.backends().store.list_chunks(&doc.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_delete_survives_failing_vector_backend() {
    let keywords = Arc::new(InMemoryKeywordIndex::new());
    let mut backends = Backends::in_memory(embedder());
    backends.keywords = keywords.clone();
    let o = orchestrator(backends.clone());
    let doc = o.upload(upload("Civil Code", "CA", CIVIL_CODE)).await.unwrap();
    o.process_document(&doc.id).await.unwrap();
    assert!(!keywords.is_empty());

    let mut broken = backends;
    broken.vectors = Arc::new(DownVectors);
    let o = orchestrator(broken);
    o.delete_document(&doc.id).await.unwrap();

    let store = &o.backends().store;
    assert!(store.get_document(&doc.id).await.unwrap().is_none());
    assert!(store.list_chunks(&doc.id).await.unwrap().is_empty());
    assert!(keywords.is_empty());
    assert!(o.backends().blobs.fetch(&doc.content_ref).await.is_err());
}

#[tokio::test]
async fn test_concurrent_reprocess_leaves_one_set_of_chunks() {
    let vectors = Arc::new(InMemoryVectorIndex::new());
    let mut backends = Backends::in_memory(embedder());
    backends.vectors = vectors.clone();
    let o = orchestrator(backends);
    let doc = o.upload(upload("Civil Code", "CA", CIVIL_CODE)).await.unwrap();

    let (a, b) = tokio::join!(o.reprocess_document(&doc.id), o.reprocess_document(&doc.id));
    assert_eq!(a.unwrap(), b.unwrap());

    let chunks = o.backends().store.list_chunks(&doc.id).await.unwrap();
    assert_eq!(vectors.len(), chunks.len());
}

#[tokio::test]
async fn test_processing_twice_leaves_no_orphan_index_entries() {
    let vectors = Arc::new(InMemoryVectorIndex::new());
    let keywords = Arc::new(InMemoryKeywordIndex::new());
    let mut backends = Backends::in_memory(embedder());
    backends.vectors = vectors.clone();
    backends.keywords = keywords.clone();
    let o = orchestrator(backends);
    let doc = o.upload(upload("Civil Code", "CA", CIVIL_CODE)).await.unwrap();

    o.process_document(&doc.id).await.unwrap();
    let second = o.process_document(&doc.id).await.unwrap();

    let chunks = o.backends().store.list_chunks(&doc.id).await.unwrap();
    assert_eq!(chunks.len(), second.chunks);
    assert_eq!(vectors.len(), chunks.len());
    assert_eq!(keywords.len(), chunks.len());
}

#[tokio::test]
async fn test_reindex_counts_failures() {
    let o = orchestrator(Backends::in_memory(embedder()));
    o.upload(upload("Civil Code", "CA", CIVIL_CODE)).await.unwrap();
    o.upload(upload("Real Property Law", "NY", NY_LAW)).await.unwrap();
    // Stored without a blob, so processing it fails.
    o.backends()
        .store
        .insert_document(&document("orphan"))
        .await
        .unwrap();

    let summary = o.update_embedding_model(Some("hashing-v2")).await.unwrap();
    assert_eq!(
        summary,
        ReindexSummary {
            total: 3,
            succeeded: 2,
            failed: 1
        }
    );
    assert_eq!(o.backends().embedder.model_name(), "hashing-v2");
}

// ─── Versions ───────────────────────────────────────────────────────

#[tokio::test]
async fn test_revision_chain_history() {
    let o = orchestrator(Backends::in_memory(embedder()));
    let v1 = o.upload(upload("Lease", "NY", NY_LAW)).await.unwrap();
    let v2 = o
        .revise(&v1.id, "editor", "lease-v2.txt", b"Section 1 Amended.".to_vec())
        .await
        .unwrap();
    let v3 = o
        .revise(&v2.id, "editor", "lease-v3.txt", b"Section 1 Amended again.".to_vec())
        .await
        .unwrap();
    let branch = o
        .revise(&v1.id, "counsel", "lease-alt.txt", b"Section 1 Alternative.".to_vec())
        .await
        .unwrap();
    assert_eq!(v2.version, "1.1");
    assert_eq!(v3.version, "1.2");
    assert_eq!(branch.version, "1.1");

    let resolver = VersionTreeResolver::new(Arc::clone(&o.backends().store));
    assert_eq!(resolver.root_of(&v3.id).await.unwrap().id, v1.id);

    let from_leaf = resolver.history(&v3.id).await.unwrap();
    let from_root = resolver.history(&v1.id).await.unwrap();
    assert_eq!(from_leaf, from_root);

    let mut ids: Vec<String> = from_leaf.into_iter().map(|d| d.id).collect();
    ids.sort();
    let mut expected = vec![v1.id, v2.id, v3.id, branch.id];
    expected.sort();
    assert_eq!(ids, expected);
}

// ─── Queue ──────────────────────────────────────────────────────────

#[tokio::test]
async fn test_queue_feeds_orchestrator() {
    let o = orchestrator(Backends::in_memory(embedder()));
    let civil = o.upload(upload("Civil Code", "CA", CIVIL_CODE)).await.unwrap();
    let ny = o.upload(upload("Real Property Law", "NY", NY_LAW)).await.unwrap();

    let (handle, consumer) = queue::channel();
    handle.enqueue(civil.id.clone()).unwrap();
    handle.enqueue("missing").unwrap();
    handle.enqueue(ny.id.clone()).unwrap();
    drop(handle);

    let report = consumer.run(&o, CancellationToken::new()).await;
    assert_eq!(report, QueueReport { processed: 2, failed: 1 });
    assert!(!o.backends().store.list_chunks(&ny.id).await.unwrap().is_empty());
}

/// Takes a while per document and records what it started and finished.
#[derive(Default)]
struct SlowProcessor {
    started: AtomicUsize,
    first_started: Notify,
    finished: Mutex<Vec<String>>,
}

#[async_trait]
impl DocumentProcessor for SlowProcessor {
    async fn process(&self, document_id: &str) -> Result<()> {
        self.started.fetch_add(1, Ordering::SeqCst);
        self.first_started.notify_one();
        tokio::time::sleep(Duration::from_millis(200)).await;
        self.finished.lock().unwrap().push(document_id.to_string());
        Ok(())
    }
}

#[tokio::test]
async fn test_cancel_lets_in_flight_document_finish() {
    let (handle, consumer) = queue::channel();
    for id in ["a", "b", "c"] {
        handle.enqueue(id).unwrap();
    }

    let processor = Arc::new(SlowProcessor::default());
    let token = CancellationToken::new();
    let worker = {
        let processor = Arc::clone(&processor);
        let token = token.clone();
        tokio::spawn(async move { consumer.run(processor.as_ref(), token).await })
    };

    processor.first_started.notified().await;
    token.cancel();
    let report = tokio::time::timeout(Duration::from_secs(5), worker)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(report, QueueReport { processed: 1, failed: 0 });
    assert_eq!(processor.started.load(Ordering::SeqCst), 1);
    assert_eq!(*processor.finished.lock().unwrap(), vec!["a"]);
}
