//! Core data models used throughout Docket.
//!
//! These types represent the documents, chunks, index records, and ranked
//! hits that flow through the ingestion and retrieval pipeline.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{Error, Result};

/// Version label assigned to a freshly uploaded document.
pub const INITIAL_VERSION: &str = "1.0";

/// Upper bound for every [`SearchWeight`] component.
pub const MAX_WEIGHT_SCORE: f64 = 10.0;

/// A stored document revision.
///
/// Each revision is its own row; `parent_id` links it to the revision it
/// replaced. The parent relation forms a forest.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: String,
    pub title: String,
    pub jurisdiction: String,
    /// Blob key (or URL) of the raw content.
    pub content_ref: String,
    pub version: String,
    pub parent_id: Option<String>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub modified_at: Option<DateTime<Utc>>,
    pub modified_by: Option<String>,
    pub search_weight: Option<SearchWeight>,
}

/// A bounded, offset-tracked slice of one page of a document.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    /// Position of the chunk within the whole document, starting at 0.
    pub chunk_index: i64,
    /// 1-based page number.
    pub page: u32,
    pub text: String,
    /// SHA-256 of `text`.
    pub hash: String,
    pub embedding: Vec<f32>,
    /// Character offset (inclusive) of `text` within the page.
    pub start_offset: usize,
    /// Character offset (exclusive) of `text` within the page.
    pub end_offset: usize,
}

/// Ranking metadata set by an administrator, independent of ingestion.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SearchWeight {
    pub jurisdiction_score: f64,
    pub recency_score: f64,
    pub manual_boost: f64,
}

impl SearchWeight {
    pub fn new(jurisdiction_score: f64, recency_score: f64, manual_boost: f64) -> Result<Self> {
        let weight = Self {
            jurisdiction_score,
            recency_score,
            manual_boost,
        };
        weight.validate()?;
        Ok(weight)
    }

    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("jurisdiction_score", self.jurisdiction_score),
            ("recency_score", self.recency_score),
            ("manual_boost", self.manual_boost),
        ] {
            if !(0.0..=MAX_WEIGHT_SCORE).contains(&value) {
                return Err(Error::Validation(format!(
                    "{} must be within [0, {}], got {}",
                    name, MAX_WEIGHT_SCORE, value
                )));
            }
        }
        Ok(())
    }
}

/// Metadata keys stored alongside every vector record.
pub mod meta {
    pub const DOCUMENT_ID: &str = "document_id";
    pub const JURISDICTION: &str = "jurisdiction";
    pub const PAGE: &str = "page";
    pub const CREATED_AT: &str = "created_at";
}

/// A chunk embedding plus the denormalized metadata used for filtering.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorRecord {
    pub chunk_id: String,
    pub vector: Vec<f32>,
    pub metadata: BTreeMap<String, String>,
}

impl VectorRecord {
    pub fn from_chunk(chunk: &Chunk, doc: &Document) -> Self {
        let mut metadata = BTreeMap::new();
        metadata.insert(meta::DOCUMENT_ID.to_string(), doc.id.clone());
        metadata.insert(meta::JURISDICTION.to_string(), doc.jurisdiction.clone());
        metadata.insert(meta::PAGE.to_string(), chunk.page.to_string());
        metadata.insert(meta::CREATED_AT.to_string(), doc.created_at.to_rfc3339());
        Self {
            chunk_id: chunk.id.clone(),
            vector: chunk.embedding.clone(),
            metadata,
        }
    }

    pub fn document_id(&self) -> Option<&str> {
        self.metadata.get(meta::DOCUMENT_ID).map(String::as_str)
    }
}

/// A chunk as submitted to the keyword index.
#[derive(Debug, Clone, PartialEq)]
pub struct KeywordRecord {
    pub chunk_id: String,
    pub document_id: String,
    pub title: String,
    pub text: String,
    pub jurisdiction: String,
    pub page: u32,
    pub created_at: DateTime<Utc>,
}

impl KeywordRecord {
    pub fn from_chunk(chunk: &Chunk, doc: &Document) -> Self {
        Self {
            chunk_id: chunk.id.clone(),
            document_id: doc.id.clone(),
            title: doc.title.clone(),
            text: chunk.text.clone(),
            jurisdiction: doc.jurisdiction.clone(),
            page: chunk.page,
            created_at: doc.created_at,
        }
    }
}

/// Inclusive creation-time window.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DateRange {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

impl DateRange {
    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        self.from.map_or(true, |from| ts >= from) && self.to.map_or(true, |to| ts <= to)
    }
}

/// Metadata filters accepted by both retrieval adapters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchFilters {
    /// Empty means "any jurisdiction".
    pub jurisdictions: Vec<String>,
    pub date_range: Option<DateRange>,
}

impl SearchFilters {
    pub fn is_empty(&self) -> bool {
        self.jurisdictions.is_empty() && self.date_range.is_none()
    }

    pub fn matches(&self, jurisdiction: &str, created_at: DateTime<Utc>) -> bool {
        let jurisdiction_ok =
            self.jurisdictions.is_empty() || self.jurisdictions.iter().any(|j| j == jurisdiction);
        let date_ok = self
            .date_range
            .as_ref()
            .map_or(true, |range| range.contains(created_at));
        jurisdiction_ok && date_ok
    }

    /// Apply the filters to flat vector-record metadata. Records missing
    /// a field that a filter needs are rejected.
    pub fn matches_metadata(&self, metadata: &BTreeMap<String, String>) -> bool {
        if self.is_empty() {
            return true;
        }
        let Some(jurisdiction) = metadata.get(meta::JURISDICTION) else {
            return false;
        };
        match metadata
            .get(meta::CREATED_AT)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        {
            Some(ts) => self.matches(jurisdiction, ts.with_timezone(&Utc)),
            None => {
                self.date_range.is_none()
                    && (self.jurisdictions.is_empty()
                        || self.jurisdictions.iter().any(|j| j == jurisdiction))
            }
        }
    }
}

/// A final, display-ready search result.
#[derive(Debug, Clone, Serialize)]
pub struct RankedHit {
    pub chunk_id: String,
    pub document_id: String,
    pub title: String,
    pub jurisdiction: String,
    pub content_url: String,
    pub page: u32,
    pub snippet: String,
    pub score: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub explain: Option<ScoreExplanation>,
}

/// Scoring breakdown for a [`RankedHit`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ScoreExplanation {
    /// Weighted semantic contribution (0.0 if absent from vector results).
    pub semantic: f64,
    /// Weighted keyword contribution (0.0 if absent from keyword results).
    pub keyword: f64,
    /// `semantic + keyword`, before boosting.
    pub fused: f64,
    /// Multiplier applied by the boost stage.
    pub boost: f64,
}

/// Compute the label for the revision that follows `version`.
///
/// `"1.0"` becomes `"1.1"`, `"2.9"` becomes `"2.10"`.
pub fn next_version(version: &str) -> Result<String> {
    let (major, minor) = version
        .trim()
        .split_once('.')
        .ok_or_else(|| Error::Validation(format!("malformed version label: {:?}", version)))?;
    let major: u32 = major
        .parse()
        .map_err(|_| Error::Validation(format!("malformed version label: {:?}", version)))?;
    let minor: u32 = minor
        .parse()
        .map_err(|_| Error::Validation(format!("malformed version label: {:?}", version)))?;
    let minor = minor
        .checked_add(1)
        .ok_or_else(|| Error::Validation(format!("version label exhausted: {:?}", version)))?;
    Ok(format!("{}.{}", major, minor))
}
