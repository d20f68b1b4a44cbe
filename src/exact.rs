//! Stage 0: exact-match retrieval of structured identifiers.
//!
//! Precision over recall. A query with no code-shaped tokens costs one
//! regex scan and nothing else. Otherwise every detected code is expanded
//! to its spelling variants, normalized, and looked up in one batched
//! membership query against the index. Only when that finds nothing does
//! the retriever fall back to a boundary-safe substring query over padded
//! filenames, which scores a tier lower.
//!
//! Stage 0 is advisory. [`ExactMatchRetriever::search`] never fails: a
//! storage error or timeout is logged and yields an empty list, and the
//! fusion layer defers to Stage 1.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use tracing::{debug, warn};

use coderank_core::index::{CodeHit, CodeIndex};
use coderank_core::models::{MatchType, RetrievalResult};
use coderank_core::normalize::{extract_codes, generate_variants, normalize_code, pad_boundaries};

use crate::config::RetrievalConfig;
use crate::error::{RetrievalError, Stage};

/// Fixed confidence score of an `exact_code` hit.
pub const EXACT_CODE_SCORE: f64 = 1.0;
/// Fixed confidence score of a `filename_match` hit.
pub const FILENAME_MATCH_SCORE: f64 = 0.7;

/// Upper bound on distinct codes taken from one query.
const MAX_QUERY_CODES: usize = 8;

/// Index rows requested per wanted document; a document can match on
/// several origins and variants.
const ROWS_PER_RESULT: usize = 8;

fn tier_score(match_type: MatchType) -> f64 {
    match match_type {
        MatchType::ExactCode => EXACT_CODE_SCORE,
        MatchType::FilenameMatch => FILENAME_MATCH_SCORE,
        MatchType::Fused => 0.0,
    }
}

/// Normalized lookup keys for every code in `query`, sorted and unique.
pub fn query_norms(query: &str) -> Vec<String> {
    let mut norms = BTreeSet::new();
    for code in extract_codes(query).into_iter().take(MAX_QUERY_CODES) {
        for variant in generate_variants(&code.raw) {
            let norm = normalize_code(&variant);
            if !norm.is_empty() {
                norms.insert(norm);
            }
        }
    }
    norms.into_iter().collect()
}

/// Turn raw hits into ranked results.
///
/// One result per document, keeping the strongest tier. Ordered by tier,
/// then `doc_id`; documents in the same tier share a rank.
pub fn rank_hits(hits: &[(CodeHit, MatchType)], max_results: usize) -> Vec<RetrievalResult> {
    let mut best: HashMap<&str, MatchType> = HashMap::new();
    for (hit, match_type) in hits {
        best.entry(hit.doc_id.as_str())
            .and_modify(|m| {
                if match_type.tier() > m.tier() {
                    *m = *match_type;
                }
            })
            .or_insert(*match_type);
    }

    let mut docs: Vec<(&str, MatchType)> = best.into_iter().collect();
    docs.sort_by(|a, b| b.1.tier().cmp(&a.1.tier()).then_with(|| a.0.cmp(b.0)));
    docs.truncate(max_results);

    let mut out = Vec::with_capacity(docs.len());
    let mut rank = 0;
    let mut prev_tier = None;
    for (i, (doc_id, match_type)) in docs.into_iter().enumerate() {
        if prev_tier != Some(match_type.tier()) {
            rank = i + 1;
            prev_tier = Some(match_type.tier());
        }
        // doc_id is non-empty and the tier score is finite, so this cannot fail.
        if let Ok(r) = RetrievalResult::new(doc_id, tier_score(match_type), rank, match_type) {
            out.push(r);
        }
    }
    out
}

/// Stage 0 retriever over one [`CodeIndex`] generation.
#[derive(Debug, Clone)]
pub struct ExactMatchRetriever {
    max_results: usize,
    timeout: Duration,
}

impl ExactMatchRetriever {
    pub fn new(config: &RetrievalConfig) -> Self {
        Self {
            max_results: config.exact_max_results,
            timeout: config.stage0_timeout(),
        }
    }

    /// Ranked exact-match candidates for `query`. Never fails.
    pub async fn search(&self, index: &dyn CodeIndex, query: &str) -> Vec<RetrievalResult> {
        match self.try_search(index, query).await {
            Ok(results) => results,
            Err(err) => {
                warn!(error = %err, "stage0 degraded to empty result");
                Vec::new()
            }
        }
    }

    /// Like [`search`](Self::search) but reports storage failures and
    /// timeouts, so the fusion layer can tell "no codes" from "unavailable".
    pub async fn try_search(
        &self,
        index: &dyn CodeIndex,
        query: &str,
    ) -> Result<Vec<RetrievalResult>, RetrievalError> {
        let norms = query_norms(query);
        if norms.is_empty() {
            debug!("stage0: no codes in query");
            return Ok(Vec::new());
        }

        let lookup = self.lookup(index, &norms);
        match tokio::time::timeout(self.timeout, lookup).await {
            Ok(Ok(hits)) => {
                let results = rank_hits(&hits, self.max_results);
                debug!(norms = ?norms, hits = results.len(), "stage0 complete");
                Ok(results)
            }
            Ok(Err(err)) => Err(RetrievalError::from(err)),
            Err(_) => Err(RetrievalError::Timeout {
                stage: Stage::ExactMatch,
                millis: self.timeout.as_millis() as u64,
            }),
        }
    }

    async fn lookup(
        &self,
        index: &dyn CodeIndex,
        norms: &[String],
    ) -> anyhow::Result<Vec<(CodeHit, MatchType)>> {
        let row_limit = self.max_results.saturating_mul(ROWS_PER_RESULT);

        let exact = index.lookup_norms(norms, row_limit).await?;
        if !exact.is_empty() {
            return Ok(exact.into_iter().map(|h| (h, MatchType::ExactCode)).collect());
        }

        let padded: Vec<String> = norms
            .iter()
            .map(|n| pad_boundaries(n))
            .filter(|p| !p.is_empty())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let by_name = index.search_filenames(&padded, row_limit).await?;
        Ok(by_name
            .into_iter()
            .map(|h| (h, MatchType::FilenameMatch))
            .collect())
    }
}
