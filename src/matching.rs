//! Candidate selection for a fetched work item.
//!
//! [`MatchingEngine`] is the seam between the crawl engine and whatever decides
//! which archive entry a local record corresponds to. The crate ships
//! [`BestScoreMatcher`], which trusts the archive's own relevance score.

use serde::{Deserialize, Serialize};

use crate::engine::QueryMode;
use crate::records::GameRecord;
use crate::ymgal::RawResponse;

/// The archive entry chosen for a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchedGame {
    pub ym_id: String,
    pub name: String,
    pub chinese_name: String,
    pub score: f64,
    pub org_id: String,
    pub org_name: String,
    pub org_website: String,
    pub org_description: String,
    /// Label of the keyword whose search produced this match.
    pub source: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MatchDecision {
    Matched(MatchedGame),
    NoMatch,
}

/// Scores a fetch result against the local record. Runs inside the fetch unit,
/// so it must be cheap and must not block.
pub trait MatchingEngine: Send + Sync + 'static {
    fn score(&self, raw: &RawResponse, record: &GameRecord) -> MatchDecision;
}

/// Takes the top candidate of each keyword's search and keeps the best one.
/// Earlier keywords win ties.
#[derive(Debug, Clone)]
pub struct BestScoreMatcher {
    min_score: f64,
    mode: QueryMode,
}

impl BestScoreMatcher {
    pub fn new(min_score: f64, mode: QueryMode) -> Self {
        Self { min_score, mode }
    }
}

impl MatchingEngine for BestScoreMatcher {
    fn score(&self, raw: &RawResponse, record: &GameRecord) -> MatchDecision {
        let mut best: Option<(&crate::ymgal::SearchHit, &crate::ymgal::Candidate)> = None;
        for hit in &raw.hits {
            let Some(top) = hit.candidates.first() else {
                continue;
            };
            let better = match best {
                Some((_, current)) => top.score > current.score,
                None => true,
            };
            if better {
                best = Some((hit, top));
            }
        }

        let Some((hit, candidate)) = best else {
            return MatchDecision::NoMatch;
        };
        if candidate.score < self.min_score {
            return MatchDecision::NoMatch;
        }
        // Alias searches only replace an existing match when they beat it.
        if self.mode == QueryMode::Aliases {
            if let Some(baseline) = record.baseline_score {
                if candidate.score <= baseline {
                    return MatchDecision::NoMatch;
                }
            }
        }

        let org = candidate.org.clone().unwrap_or_default();
        MatchDecision::Matched(MatchedGame {
            ym_id: candidate.ym_id.clone(),
            name: candidate.name.clone(),
            chinese_name: candidate.chinese_name.clone(),
            score: candidate.score,
            org_id: org.id,
            org_name: org.name,
            org_website: org.website,
            org_description: org.description,
            source: hit.keyword.label.clone(),
        })
    }
}
