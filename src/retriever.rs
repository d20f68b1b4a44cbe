//! Two-stage retrieval with Reciprocal Rank Fusion.
//!
//! The [`FusionRetriever`] captures the active index generation once per
//! call, runs Stage 0 (exact match) and Stage 1 concurrently against it,
//! and merges the two ranked lists by rank alone.
//!
//! Degradation rules:
//!
//! | Stage 0 | Stage 1 | Result |
//! |---------|---------|--------|
//! | ok | ok | fused |
//! | ok | failed / timed out | Stage 0 results unmodified |
//! | failed / timed out | ok | Stage 1 through fusion |
//! | failed | failed | [`RetrievalError::Unavailable`] |
//!
//! A query without codes skips Stage 0 entirely, so it is answered by
//! Stage 1 alone and fails with `Unavailable` when Stage 1 does. A partial
//! answer is flagged [`Retrieved::degraded`] so the cache can expire it
//! early.

use std::str::FromStr;
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use coderank_core::fusion::reciprocal_rank_fusion;
use coderank_core::models::{DocumentMetadata, RetrievalResult};
use coderank_core::stage1::{Stage1Hit, Stage1Retriever};
use coderank_core::store::DocumentStore;

use crate::config::RetrievalConfig;
use crate::error::{RetrievalError, Stage};
use crate::exact::{query_norms, ExactMatchRetriever};
use crate::index_backend::Generation;
use crate::metrics::RetrievalMetrics;

/// Which stages contribute to a search.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchMode {
    /// Stage 0 and Stage 1, fused.
    #[default]
    Fused,
    /// Stage 0 only.
    Exact,
    /// Stage 1 only.
    Stage1,
}

impl SearchMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SearchMode::Fused => "fused",
            SearchMode::Exact => "exact",
            SearchMode::Stage1 => "stage1",
        }
    }
}

impl FromStr for SearchMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "fused" => Ok(SearchMode::Fused),
            "exact" => Ok(SearchMode::Exact),
            "stage1" => Ok(SearchMode::Stage1),
            other => anyhow::bail!("Unknown search mode: {other} (expected fused, exact or stage1)"),
        }
    }
}

impl std::fmt::Display for SearchMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A result with presentation metadata attached.
#[derive(Debug, Clone, Serialize)]
pub struct EnrichedResult {
    #[serde(flatten)]
    pub result: RetrievalResult,
    pub metadata: Option<DocumentMetadata>,
}

/// Results of one retrieval and whether a requested stage was missing
/// from them.
#[derive(Debug, Clone, PartialEq)]
pub struct Retrieved {
    pub results: Vec<RetrievalResult>,
    pub degraded: bool,
}

impl From<Vec<RetrievalResult>> for Retrieved {
    fn from(results: Vec<RetrievalResult>) -> Self {
        Self {
            results,
            degraded: false,
        }
    }
}

pub struct FusionRetriever {
    config: RetrievalConfig,
    exact: ExactMatchRetriever,
    stage1: Arc<dyn Stage1Retriever>,
    store: Arc<dyn DocumentStore>,
    active: Arc<ArcSwap<Generation>>,
    metrics: Arc<RetrievalMetrics>,
}

impl FusionRetriever {
    pub fn new(
        config: RetrievalConfig,
        stage1: Arc<dyn Stage1Retriever>,
        store: Arc<dyn DocumentStore>,
        active: Arc<ArcSwap<Generation>>,
        metrics: Arc<RetrievalMetrics>,
    ) -> Self {
        Self {
            exact: ExactMatchRetriever::new(&config),
            config,
            stage1,
            store,
            active,
            metrics,
        }
    }

    pub fn config(&self) -> &RetrievalConfig {
        &self.config
    }

    /// Fused search against the currently active generation.
    pub async fn search(
        &self,
        query: &str,
        top_k: usize,
    ) -> Result<Vec<RetrievalResult>, RetrievalError> {
        let generation = self.active.load_full();
        self.search_in(&generation, query, SearchMode::Fused, top_k)
            .await
    }

    /// Search against a generation the caller has already captured.
    pub async fn search_in(
        &self,
        generation: &Generation,
        query: &str,
        mode: SearchMode,
        top_k: usize,
    ) -> Result<Vec<RetrievalResult>, RetrievalError> {
        Ok(self.retrieve(generation, query, mode, top_k).await?.results)
    }

    /// Like [`search_in`](Self::search_in), also reporting degradation.
    pub async fn retrieve(
        &self,
        generation: &Generation,
        query: &str,
        mode: SearchMode,
        top_k: usize,
    ) -> Result<Retrieved, RetrievalError> {
        let run_stage0 = self.config.exact_match_enabled
            && mode != SearchMode::Stage1
            && !query_norms(query).is_empty();
        let run_stage1 = mode != SearchMode::Exact;

        let stage0 = async {
            if run_stage0 {
                Some(self.exact.try_search(generation.index.as_ref(), query).await)
            } else {
                None
            }
        };
        let stage1 = async {
            if run_stage1 {
                Some(self.run_stage1(query, top_k).await)
            } else {
                None
            }
        };
        let (stage0, stage1) = tokio::join!(stage0, stage1);

        let stage0 = match stage0 {
            Some(Ok(results)) => {
                self.metrics.record_stage0(!results.is_empty());
                Some(Ok(results))
            }
            Some(Err(err)) => {
                self.metrics.record_stage0_failure();
                warn!(error = %err, "stage0 failed; deferring to stage1");
                Some(Err(err))
            }
            None => None,
        };
        if let Some(Err(err)) = &stage1 {
            self.metrics.record_stage1_failure();
            warn!(retriever = self.stage1.name(), error = %err, "stage1 failed");
        }

        let degraded = matches!(stage0, Some(Err(_))) || matches!(stage1, Some(Err(_)));
        let results = match (stage0, stage1) {
            (Some(Ok(s0)), Some(Ok(s1))) => {
                reciprocal_rank_fusion(&s0, &s1, self.config.rrf_k, top_k)
            }
            (Some(Ok(mut s0)), Some(Err(_)) | None) => {
                s0.truncate(top_k);
                s0
            }
            (Some(Err(_)) | None, Some(Ok(s1))) => {
                reciprocal_rank_fusion(&[], &s1, self.config.rrf_k, top_k)
            }
            // Stage 1 not requested and Stage 0 had nothing to look up.
            (None, None) => Vec::new(),
            (s0, s1) => {
                self.metrics.record_unavailable();
                let reason = [
                    s0.and_then(Result::err).map(|e| e.to_string()),
                    s1.and_then(Result::err).map(|e| e.to_string()),
                ]
                .into_iter()
                .flatten()
                .collect::<Vec<_>>()
                .join("; ");
                return Err(RetrievalError::Unavailable { reason });
            }
        };

        debug!(
            generation = generation.id,
            mode = mode.as_str(),
            results = results.len(),
            degraded,
            "search complete"
        );
        Ok(Retrieved { results, degraded })
    }

    async fn run_stage1(&self, query: &str, top_k: usize) -> Result<Vec<Stage1Hit>, RetrievalError> {
        let candidates = self.config.stage1_candidate_k.max(top_k);
        let timeout = self.config.stage1_timeout();
        match tokio::time::timeout(timeout, self.stage1.search(query, candidates)).await {
            Ok(Ok(hits)) => Ok(hits),
            Ok(Err(err)) => Err(RetrievalError::from(err)),
            Err(_) => Err(RetrievalError::Timeout {
                stage: Stage::Stage1,
                millis: timeout.as_millis() as u64,
            }),
        }
    }

    /// Attach document metadata for presentation. A missing document or a
    /// store error leaves `metadata` empty and keeps the result.
    pub async fn enrich(&self, results: Vec<RetrievalResult>) -> Vec<EnrichedResult> {
        let mut out = Vec::with_capacity(results.len());
        for result in results {
            let metadata = match self.store.get_document_metadata(result.doc_id()).await {
                Ok(m) => m,
                Err(err) => {
                    warn!(doc_id = result.doc_id(), error = %err, "metadata lookup failed");
                    None
                }
            };
            out.push(EnrichedResult { result, metadata });
        }
        out
    }

    /// [`search`](Self::search) followed by [`enrich`](Self::enrich).
    pub async fn search_enriched(
        &self,
        query: &str,
        top_k: usize,
    ) -> Result<Vec<EnrichedResult>, RetrievalError> {
        let results = self.search(query, top_k).await?;
        Ok(self.enrich(results).await)
    }
}
