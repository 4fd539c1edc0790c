//! Per-document multiplicative boosts.
//!
//! A document with a [`SearchWeight`] is boosted by
//! `(1 + j·0.1) × (1 + r·0.1) × (1 + m·0.1)`. A document without one gets a
//! recency bonus of up to 5% that decays linearly to nothing over a year.
//! Exactly one of the two applies to any document.

use chrono::{DateTime, Utc};

use crate::models::{RankedHit, SearchWeight};

/// Multiplier per weight point.
pub const WEIGHT_STEP: f64 = 0.1;
/// Largest recency bonus, for a document created now.
pub const RECENCY_BONUS: f64 = 0.05;
/// Age at which the recency bonus reaches zero.
pub const RECENCY_HORIZON_DAYS: f64 = 365.0;

/// The factor a hit's fused score is multiplied by.
///
/// Documents dated in the future are treated as age zero.
pub fn boost_factor(
    weight: Option<&SearchWeight>,
    created_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> f64 {
    match weight {
        Some(w) => {
            (1.0 + w.jurisdiction_score * WEIGHT_STEP)
                * (1.0 + w.recency_score * WEIGHT_STEP)
                * (1.0 + w.manual_boost * WEIGHT_STEP)
        }
        None => {
            let age_days = ((now - created_at).num_seconds() as f64 / 86_400.0).max(0.0);
            let recency = (1.0 - age_days / RECENCY_HORIZON_DAYS).max(0.0);
            1.0 + recency * RECENCY_BONUS
        }
    }
}

/// A fused hit plus the document fields the boost needs.
#[derive(Debug, Clone)]
pub struct BoostInput {
    pub hit: RankedHit,
    pub weight: Option<SearchWeight>,
    pub created_at: DateTime<Utc>,
}

/// Multiply each hit's score by its factor, sort descending (ties by chunk
/// id), and keep the best `limit`.
pub fn apply_boosts(inputs: Vec<BoostInput>, now: DateTime<Utc>, limit: usize) -> Vec<RankedHit> {
    let mut hits: Vec<RankedHit> = inputs
        .into_iter()
        .map(|input| {
            let factor = boost_factor(input.weight.as_ref(), input.created_at, now);
            let mut hit = input.hit;
            hit.score *= factor;
            if let Some(explain) = hit.explain.as_mut() {
                explain.boost = factor;
            }
            hit
        })
        .collect();

    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.chunk_id.cmp(&b.chunk_id))
    });
    hits.truncate(limit);
    hits
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap()
    }

    fn hit(id: &str, score: f64) -> RankedHit {
        RankedHit {
            chunk_id: id.into(),
            document_id: format!("doc-{}", id),
            title: String::new(),
            jurisdiction: String::new(),
            content_url: String::new(),
            page: 1,
            snippet: String::new(),
            score,
            explain: None,
        }
    }

    #[test]
    fn test_search_weight_factor() {
        let w = SearchWeight::new(5.0, 0.0, 0.0).unwrap();
        assert!((boost_factor(Some(&w), now(), now()) - 1.5).abs() < 1e-12);

        let w = SearchWeight::new(10.0, 10.0, 10.0).unwrap();
        assert!((boost_factor(Some(&w), now(), now()) - 8.0).abs() < 1e-12);
    }

    #[test]
    fn test_weight_ignores_recency() {
        let w = SearchWeight::new(0.0, 0.0, 0.0).unwrap();
        let fresh = boost_factor(Some(&w), now(), now());
        assert_eq!(fresh, 1.0);
    }

    #[test]
    fn test_recency_fallback() {
        assert!((boost_factor(None, now(), now()) - 1.05).abs() < 1e-12);

        let half_year = now() - Duration::days(365) / 2;
        let f = boost_factor(None, half_year, now());
        assert!(f > 1.0 && f < 1.05);

        assert_eq!(boost_factor(None, now() - Duration::days(365), now()), 1.0);
        assert_eq!(boost_factor(None, now() - Duration::days(2000), now()), 1.0);
    }

    #[test]
    fn test_future_date_clamps_to_zero_age() {
        let future = now() + Duration::days(30);
        assert!((boost_factor(None, future, now()) - 1.05).abs() < 1e-12);
    }

    #[test]
    fn test_apply_reorders_and_truncates() {
        let inputs = vec![
            BoostInput {
                hit: hit("a", 1.0),
                weight: None,
                created_at: now() - Duration::days(400),
            },
            BoostInput {
                hit: hit("b", 0.8),
                weight: Some(SearchWeight::new(5.0, 0.0, 0.0).unwrap()),
                created_at: now() - Duration::days(400),
            },
            BoostInput {
                hit: hit("c", 0.1),
                weight: None,
                created_at: now(),
            },
        ];
        let ranked = apply_boosts(inputs, now(), 2);
        let ids: Vec<&str> = ranked.iter().map(|h| h.chunk_id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a"]);
        assert!((ranked[0].score - 1.2).abs() < 1e-9);
    }
}
