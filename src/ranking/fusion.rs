//! Weighted-sum fusion of vector and keyword candidates.

use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::keyword::KeywordHit;
use crate::vector::VectorHit;

/// Channel weights scaled to sum to 1.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FusionWeights {
    pub semantic: f64,
    pub keyword: f64,
}

impl FusionWeights {
    /// `ws' = ws / (ws + wk)`, `wk' = wk / (ws + wk)`.
    ///
    /// Negative or non-finite weights, and a zero sum, are rejected.
    pub fn normalize(semantic: f64, keyword: f64) -> Result<Self> {
        for (name, w) in [("semantic_weight", semantic), ("keyword_weight", keyword)] {
            if !w.is_finite() || w < 0.0 {
                return Err(Error::Validation(format!(
                    "{} must be a non-negative number, got {}",
                    name, w
                )));
            }
        }
        let total = semantic + keyword;
        if total <= 0.0 {
            return Err(Error::Validation(
                "semantic_weight + keyword_weight must be > 0".into(),
            ));
        }
        Ok(Self {
            semantic: semantic / total,
            keyword: keyword / total,
        })
    }
}

/// One chunk after merging both channels.
#[derive(Debug, Clone, PartialEq)]
pub struct FusedCandidate {
    pub chunk_id: String,
    /// Weighted vector score; 0.0 when the chunk was not a vector hit.
    pub semantic: f64,
    /// Weighted keyword score; 0.0 when the chunk was not a keyword hit.
    pub keyword: f64,
    pub fused: f64,
    /// Highlighted fragment from the keyword channel, if any.
    pub snippet: Option<String>,
}

/// Merge both result sets by chunk id.
///
/// Each backend score is multiplied by its channel weight; a chunk found by
/// both channels gets the sum. Output is sorted by fused score, descending,
/// ties broken by chunk id.
pub fn fuse(
    vector_hits: &[VectorHit],
    keyword_hits: &[KeywordHit],
    weights: FusionWeights,
) -> Vec<FusedCandidate> {
    let mut merged: HashMap<&str, FusedCandidate> = HashMap::new();

    for hit in vector_hits {
        let entry = merged
            .entry(hit.chunk_id.as_str())
            .or_insert_with(|| empty_candidate(&hit.chunk_id));
        // Backends may return a chunk twice; keep the best score.
        entry.semantic = entry.semantic.max(hit.score * weights.semantic);
    }

    for hit in keyword_hits {
        let entry = merged
            .entry(hit.chunk_id.as_str())
            .or_insert_with(|| empty_candidate(&hit.chunk_id));
        let weighted = hit.score * weights.keyword;
        if entry.snippet.is_none() || weighted > entry.keyword {
            entry.keyword = weighted;
            entry.snippet = Some(hit.snippet.clone());
        }
    }

    let mut fused: Vec<FusedCandidate> = merged
        .into_values()
        .map(|mut c| {
            c.fused = c.semantic + c.keyword;
            c
        })
        .collect();
    fused.sort_by(|a, b| {
        b.fused
            .partial_cmp(&a.fused)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.chunk_id.cmp(&b.chunk_id))
    });
    fused
}

fn empty_candidate(chunk_id: &str) -> FusedCandidate {
    FusedCandidate {
        chunk_id: chunk_id.to_string(),
        semantic: 0.0,
        keyword: 0.0,
        fused: 0.0,
        snippet: None,
    }
}
