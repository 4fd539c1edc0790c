//! # Docket
//!
//! Ingestion and hybrid retrieval for long-form legal documents.
//!
//! Docket stores uploaded statutes, contracts, and filings as versioned
//! documents, splits each page along its legal structure (sections,
//! subsections, lettered clauses, paragraphs, sentences), embeds the
//! chunks, and indexes them twice: by vector and by keyword. Queries hit
//! both indexes concurrently, fuse the scores by weight, and re-rank with
//! per-document boosts.
//!
//! ## Architecture
//!
//! ```text
//! upload ─► QueueHandle ─► ProcessingQueue ─► Orchestrator
//!                                               │
//!        ┌──────────────────────────────────────┘
//!        ▼
//!   BlobStore ─► PageExtractor ─► Segmenter ─► EmbeddingBatcher
//!                                                  │
//!                          ┌───────────────────────┴──────┐
//!                          ▼                              ▼
//!                     VectorIndex                    KeywordIndex
//!                          │                              │
//!                          └──────────► HybridRanker ◄────┘
//!                                           │
//!                                      boost ─► top_k
//! ```
//!
//! Every collaborator is a trait object, with a SQLite or filesystem
//! implementation for real use and an in-memory one for tests.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`error`] | Error taxonomy |
//! | [`models`] | Documents, chunks, index records, ranked hits |
//! | [`segment`] | Structural page segmentation with sliding windows |
//! | [`embedding`] | Embedding services and the batcher |
//! | [`vector`] | Vector retrieval adapter |
//! | [`keyword`] | Keyword retrieval adapter |
//! | [`store`] | Document and chunk persistence |
//! | [`blob`] | Raw file storage |
//! | [`extract`] | Page text extraction |
//! | [`ranking`] | Hybrid fusion and boosting |
//! | [`versions`] | Version tree resolution |
//! | [`ingest`] | Intake and ingestion orchestration |
//! | [`queue`] | Processing queue |
//! | [`backends`] | Wiring of the collaborators |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod backends;
pub mod blob;
pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod extract;
pub mod ingest;
pub mod keyword;
pub mod migrate;
pub mod models;
pub mod queue;
pub mod ranking;
pub mod segment;
pub mod store;
pub mod vector;
pub mod versions;
