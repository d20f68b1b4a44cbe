//! Core data models shared by the index, the retrievers and the cache.
//!
//! These types are the stable shapes that flow from the exact-match index
//! through fusion into the answer-generation layer.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::normalize::{normalize_code, pad_boundaries};

/// Where in a document a code was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CodeOrigin {
    Filename,
    Content,
    Metadata,
}

impl CodeOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            CodeOrigin::Filename => "filename",
            CodeOrigin::Content => "content",
            CodeOrigin::Metadata => "metadata",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "filename" => Some(CodeOrigin::Filename),
            "content" => Some(CodeOrigin::Content),
            "metadata" => Some(CodeOrigin::Metadata),
            _ => None,
        }
    }
}

impl fmt::Display for CodeOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A structured identifier such as a model or part number.
///
/// `norm` and `padded_norm` are derived from `raw` and nothing else, so two
/// codes with the same `raw` always compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Code {
    pub raw: String,
    pub norm: String,
    pub padded_norm: String,
}

impl Code {
    pub fn new(raw: &str) -> Self {
        let norm = normalize_code(raw);
        let padded_norm = pad_boundaries(&norm);
        Self {
            raw: raw.to_string(),
            norm,
            padded_norm,
        }
    }
}

/// One row of the exact-match index.
///
/// Unique on `(doc_id, norm, origin)`; `position` is the byte offset of the
/// first occurrence in the normalized source text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CodeIndexEntry {
    pub doc_id: String,
    pub code: String,
    pub norm: String,
    pub padded_norm: String,
    pub origin: CodeOrigin,
    pub position: usize,
}

/// How a result entered the final list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchType {
    /// Batched membership hit on a normalized code.
    ExactCode,
    /// Boundary-safe substring hit on a filename.
    FilenameMatch,
    /// Contributed only by the Stage 1 retriever.
    Fused,
}

impl MatchType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchType::ExactCode => "exact_code",
            MatchType::FilenameMatch => "filename_match",
            MatchType::Fused => "fused",
        }
    }

    /// Confidence tier for Stage 0 ordering. Higher is stronger.
    pub fn tier(&self) -> u8 {
        match self {
            MatchType::ExactCode => 2,
            MatchType::FilenameMatch => 1,
            MatchType::Fused => 0,
        }
    }
}

impl fmt::Display for MatchType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum ModelError {
    #[error("retrieval result has an empty doc_id")]
    EmptyDocId,
    #[error("retrieval result for {doc_id} has a non-finite or negative score: {score}")]
    InvalidScore { doc_id: String, score: f64 },
    #[error("retrieval result for {doc_id} has rank 0 (ranks are 1-indexed)")]
    ZeroRank { doc_id: String },
}

/// A ranked document returned by any retriever in this crate.
///
/// Fields are private so every instance goes through [`RetrievalResult::new`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrievalResult {
    doc_id: String,
    score: f64,
    rank: usize,
    match_type: MatchType,
}

impl RetrievalResult {
    pub fn new(
        doc_id: impl Into<String>,
        score: f64,
        rank: usize,
        match_type: MatchType,
    ) -> Result<Self, ModelError> {
        let doc_id = doc_id.into();
        if doc_id.is_empty() {
            return Err(ModelError::EmptyDocId);
        }
        if !score.is_finite() || score < 0.0 {
            return Err(ModelError::InvalidScore { doc_id, score });
        }
        if rank == 0 {
            return Err(ModelError::ZeroRank { doc_id });
        }
        Ok(Self {
            doc_id,
            score,
            rank,
            match_type,
        })
    }

    pub fn doc_id(&self) -> &str {
        &self.doc_id
    }

    pub fn score(&self) -> f64 {
        self.score
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn match_type(&self) -> MatchType {
        self.match_type
    }
}

/// Lightweight document metadata used to enrich results for presentation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DocumentMetadata {
    pub id: String,
    pub filename: Option<String>,
    pub title: Option<String>,
    pub source: String,
    pub updated_at: i64,
}

/// The parts of a document the index builder reads during staging.
#[derive(Debug, Clone)]
pub struct DocumentContent {
    pub id: String,
    pub filename: Option<String>,
    pub body: String,
    pub metadata_json: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_derives_norm_from_raw() {
        let a = Code::new("hrd – 442");
        let b = Code::new("hrd – 442");
        assert_eq!(a, b);
        assert_eq!(a.norm, "HRD-442");
        assert_eq!(a.padded_norm, " HRD-442 ");
    }

    #[test]
    fn test_result_validation() {
        assert!(RetrievalResult::new("d1", 1.0, 1, MatchType::ExactCode).is_ok());
        assert_eq!(
            RetrievalResult::new("", 1.0, 1, MatchType::ExactCode),
            Err(ModelError::EmptyDocId)
        );
        assert!(matches!(
            RetrievalResult::new("d1", f64::NAN, 1, MatchType::Fused),
            Err(ModelError::InvalidScore { .. })
        ));
        assert!(matches!(
            RetrievalResult::new("d1", 0.5, 0, MatchType::Fused),
            Err(ModelError::ZeroRank { .. })
        ));
    }

    #[test]
    fn test_match_type_serializes_snake_case() {
        let r = RetrievalResult::new("d1", 1.0, 1, MatchType::FilenameMatch).unwrap();
        let json = serde_json::to_value(&r).unwrap();
        assert_eq!(json["match_type"], "filename_match");
        assert_eq!(json["rank"], 1);
    }

    #[test]
    fn test_origin_roundtrip_names() {
        for o in [CodeOrigin::Filename, CodeOrigin::Content, CodeOrigin::Metadata] {
            assert_eq!(CodeOrigin::parse(o.as_str()), Some(o));
        }
        assert_eq!(CodeOrigin::parse("body"), None);
    }
}
