//! In-memory [`CodeIndex`] snapshot.
//!
//! Built once from a [`StagedIndex`] and never mutated afterwards, so it can
//! be shared behind an `Arc` by any number of readers without locking.

use std::collections::{BTreeSet, HashMap};

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{CodeIndexEntry, CodeOrigin};

use super::{CodeHit, CodeIndex, FilenameRecord, StagedIndex};

/// Immutable in-memory index for one generation.
#[derive(Debug, Default)]
pub struct MemoryCodeIndex {
    entries: Vec<CodeIndexEntry>,
    by_norm: HashMap<String, Vec<usize>>,
    filenames: Vec<FilenameRecord>,
    covered: BTreeSet<String>,
}

impl MemoryCodeIndex {
    pub fn from_staged(staged: StagedIndex) -> Self {
        let mut by_norm: HashMap<String, Vec<usize>> = HashMap::new();
        for (i, e) in staged.entries.iter().enumerate() {
            by_norm.entry(e.norm.clone()).or_default().push(i);
        }
        Self {
            entries: staged.entries,
            by_norm,
            filenames: staged.filenames,
            covered: staged.covered,
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CodeIndex for MemoryCodeIndex {
    async fn lookup_norms(&self, norms: &[String], limit: usize) -> Result<Vec<CodeHit>> {
        let mut hits = Vec::new();
        for norm in norms {
            let Some(rows) = self.by_norm.get(norm) else {
                continue;
            };
            for &i in rows {
                let e = &self.entries[i];
                hits.push(CodeHit {
                    doc_id: e.doc_id.clone(),
                    norm: e.norm.clone(),
                    origin: e.origin,
                    position: e.position,
                });
                if hits.len() >= limit {
                    return Ok(hits);
                }
            }
        }
        Ok(hits)
    }

    async fn search_filenames(
        &self,
        padded_norms: &[String],
        limit: usize,
    ) -> Result<Vec<CodeHit>> {
        let mut hits = Vec::new();
        for f in &self.filenames {
            if let Some(needle) = padded_norms
                .iter()
                .find(|p| !p.is_empty() && f.padded_name.contains(p.as_str()))
            {
                hits.push(CodeHit {
                    doc_id: f.doc_id.clone(),
                    norm: needle.trim().to_string(),
                    origin: CodeOrigin::Filename,
                    position: f.padded_name.find(needle.as_str()).unwrap_or(0),
                });
                if hits.len() >= limit {
                    break;
                }
            }
        }
        Ok(hits)
    }

    async fn covered_documents(&self) -> Result<BTreeSet<String>> {
        Ok(self.covered.clone())
    }

    async fn referenced_documents(&self) -> Result<BTreeSet<String>> {
        Ok(self
            .entries
            .iter()
            .map(|e| e.doc_id.clone())
            .chain(self.filenames.iter().map(|f| f.doc_id.clone()))
            .collect())
    }

    async fn entry_count(&self) -> Result<usize> {
        Ok(self.entries.len())
    }
}
