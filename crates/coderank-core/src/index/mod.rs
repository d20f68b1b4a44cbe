//! Exact-match index abstraction.
//!
//! The [`CodeIndex`] trait is the read side of one index generation: a
//! batched membership query on normalized codes and a boundary-safe
//! substring query on padded filenames. Implementations are immutable once
//! built; a new generation is a new instance, never an in-place mutation.
//!
//! | Implementation | Module |
//! |----------------|--------|
//! | In-memory snapshot | [`memory`] |
//! | SQLite, generation-scoped | `coderank::sqlite_index` |

pub mod builder;
pub mod memory;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeSet;

use crate::models::{CodeIndexEntry, CodeOrigin};

/// A single index row matched by a query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CodeHit {
    pub doc_id: String,
    pub norm: String,
    pub origin: CodeOrigin,
    pub position: usize,
}

/// A document's filename in padded token form (see
/// [`pad_boundaries`](crate::normalize::pad_boundaries)).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilenameRecord {
    pub doc_id: String,
    pub padded_name: String,
}

/// Everything a backend needs to materialize one generation.
///
/// `covered` lists every document the builder visited, including those
/// that yielded no codes; validation compares it against the store.
#[derive(Debug, Clone, Default)]
pub struct StagedIndex {
    pub generation: u64,
    pub entries: Vec<CodeIndexEntry>,
    pub filenames: Vec<FilenameRecord>,
    pub covered: BTreeSet<String>,
}

impl StagedIndex {
    /// Distinct document ids referenced by index entries or filenames.
    pub fn referenced_documents(&self) -> BTreeSet<String> {
        self.entries
            .iter()
            .map(|e| e.doc_id.clone())
            .chain(self.filenames.iter().map(|f| f.doc_id.clone()))
            .collect()
    }
}

/// Read access to one immutable index generation.
#[async_trait]
pub trait CodeIndex: Send + Sync {
    /// Rows whose `norm` is any of `norms`, at most `limit` of them.
    async fn lookup_norms(&self, norms: &[String], limit: usize) -> Result<Vec<CodeHit>>;

    /// Documents whose padded filename contains any of `padded_norms`.
    async fn search_filenames(&self, padded_norms: &[String], limit: usize)
        -> Result<Vec<CodeHit>>;

    /// Every document the generation was built from.
    async fn covered_documents(&self) -> Result<BTreeSet<String>>;

    /// Distinct document ids that have at least one entry or filename row.
    async fn referenced_documents(&self) -> Result<BTreeSet<String>>;

    /// Number of code entries.
    async fn entry_count(&self) -> Result<usize>;
}
