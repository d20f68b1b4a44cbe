//! Reciprocal Rank Fusion.
//!
//! `score(d) = Σ 1 / (k + rank_i(d))` over every list containing `d`, with
//! 1-indexed ranks. Raw scores are ignored, which is what lets fixed Stage 0
//! confidence tiers and opaque Stage 1 scores be merged without calibration.
//!
//! Ordering of the fused list: fused score descending, then documents that
//! appeared in Stage 0 first, then `doc_id` ascending.

use std::collections::{HashMap, HashSet};

use crate::models::{MatchType, RetrievalResult};
use crate::stage1::Stage1Hit;

/// Conventional RRF constant (Cormack, Clarke & Buettcher, SIGIR 2009).
pub const DEFAULT_RRF_K: f64 = 60.0;

/// Contribution of a single 1-indexed rank.
pub fn rrf_contribution(k: f64, rank: usize) -> f64 {
    1.0 / (k + rank as f64)
}

struct Fused<'a> {
    doc_id: &'a str,
    score: f64,
    stage0: Option<MatchType>,
}

/// Fuse a Stage 0 list and a Stage 1 list into at most `top_k` results.
///
/// Stage 0 ranks are taken as given (tied tiers may share a rank). Stage 1
/// hits are ordered by their reported rank and re-numbered 1..n, keeping
/// the first occurrence of a duplicated document. Documents contributed by
/// Stage 0 keep its `match_type`; Stage-1-only documents are `Fused`.
pub fn reciprocal_rank_fusion(
    stage0: &[RetrievalResult],
    stage1: &[Stage1Hit],
    k: f64,
    top_k: usize,
) -> Vec<RetrievalResult> {
    let mut fused: HashMap<&str, Fused<'_>> = HashMap::new();

    for r in stage0 {
        let entry = fused.entry(r.doc_id()).or_insert(Fused {
            doc_id: r.doc_id(),
            score: 0.0,
            stage0: None,
        });
        if entry.stage0.is_none() {
            entry.score += rrf_contribution(k, r.rank());
            entry.stage0 = Some(r.match_type());
        }
    }

    let mut ordered: Vec<&Stage1Hit> = stage1.iter().filter(|h| !h.doc_id.is_empty()).collect();
    ordered.sort_by_key(|h| h.rank);
    let mut seen_stage1: HashSet<&str> = HashSet::new();
    let mut position = 0usize;
    for hit in ordered {
        if !seen_stage1.insert(hit.doc_id.as_str()) {
            continue;
        }
        position += 1;
        fused
            .entry(hit.doc_id.as_str())
            .or_insert(Fused {
                doc_id: hit.doc_id.as_str(),
                score: 0.0,
                stage0: None,
            })
            .score += rrf_contribution(k, position);
    }

    let mut list: Vec<Fused<'_>> = fused.into_values().collect();
    list.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(b.stage0.is_some().cmp(&a.stage0.is_some()))
            .then(a.doc_id.cmp(b.doc_id))
    });
    list.truncate(top_k);

    list.into_iter()
        .enumerate()
        .filter_map(|(i, f)| {
            RetrievalResult::new(
                f.doc_id,
                f.score,
                i + 1,
                f.stage0.unwrap_or(MatchType::Fused),
            )
            .ok()
        })
        .collect()
}
