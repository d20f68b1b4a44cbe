//! The pluggable Stage 1 retriever seam.
//!
//! Stage 1 is any best-effort retriever (keyword, semantic, hybrid) that
//! returns documents in descending relevance. Only its rank order is used
//! downstream; scores are carried for diagnostics and never compared with
//! Stage 0 scores.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// One ranked document from a Stage 1 retriever.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stage1Hit {
    pub doc_id: String,
    pub score: f64,
    /// 1-indexed position in the retriever's own ordering.
    pub rank: usize,
}

/// A best-effort retriever consulted alongside exact matching.
///
/// Implementations must return within their own bounded time or fail with
/// an error; callers additionally wrap every call in a timeout.
#[async_trait]
pub trait Stage1Retriever: Send + Sync {
    /// Short identifier used in logs and metrics (e.g. `"fts"`, `"http"`).
    fn name(&self) -> &str;

    async fn search(&self, query: &str, top_k: usize) -> Result<Vec<Stage1Hit>>;
}
