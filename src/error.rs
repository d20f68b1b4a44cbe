//! Retrieval error taxonomy.
//!
//! Stage-local failures are recovered where they happen and only show up
//! here when they cannot be: [`RetrievalError::Unavailable`] is the one
//! request-time failure a caller ever sees. An empty Stage 0 contribution
//! (no codes in the query) is not an error at all.

use thiserror::Error;

/// The retrieval stage that produced a soft failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    ExactMatch,
    Stage1,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::ExactMatch => f.write_str("stage0"),
            Stage::Stage1 => f.write_str("stage1"),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum RetrievalError {
    /// One stage exceeded its budget; recovered by degrading to the other.
    #[error("{stage} timed out after {millis}ms")]
    Timeout { stage: Stage, millis: u64 },

    /// No requested stage could answer.
    #[error("retrieval temporarily unavailable: {reason}")]
    Unavailable { reason: String },

    /// Staged index disagrees with the document store beyond tolerance.
    #[error("index inconsistency: {found} mismatched documents (tolerance {tolerance})")]
    IndexInconsistency { found: usize, tolerance: usize },

    /// A cache follower waited past its bound; recovered by computing.
    #[error("timed out waiting for in-flight computation")]
    CacheTimeout,

    /// Another reindex holds the singleton lock.
    #[error("a reindex is already in progress")]
    ReindexInProgress,

    /// Nothing to roll back to.
    #[error("no previous generation is retained")]
    NoPreviousGeneration,

    #[error("internal error: {0}")]
    Internal(String),
}

impl RetrievalError {
    /// Stable machine-readable code used in HTTP error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            RetrievalError::Timeout { .. } => "timeout",
            RetrievalError::Unavailable { .. } => "temporarily_unavailable",
            RetrievalError::IndexInconsistency { .. } => "index_inconsistency",
            RetrievalError::CacheTimeout => "cache_timeout",
            RetrievalError::ReindexInProgress => "reindex_in_progress",
            RetrievalError::NoPreviousGeneration => "no_previous_generation",
            RetrievalError::Internal(_) => "internal",
        }
    }
}

impl From<anyhow::Error> for RetrievalError {
    fn from(err: anyhow::Error) -> Self {
        RetrievalError::Internal(format!("{err:#}"))
    }
}
