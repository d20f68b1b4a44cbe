//! Derives index rows from documents.
//!
//! Codes are collected from the filename (origin `filename`), the body
//! (origin `content`) and every string value in the metadata JSON (origin
//! `metadata`). Rows are unique on `(doc_id, norm, origin)`; the first
//! occurrence keeps its position.

use std::collections::HashSet;

use crate::models::{CodeIndexEntry, CodeOrigin, DocumentContent};
use crate::normalize::{pad_boundaries, scan_codes};

use super::{FilenameRecord, StagedIndex};

fn metadata_strings(value: &serde_json::Value, out: &mut Vec<String>) {
    match value {
        serde_json::Value::String(s) => out.push(s.clone()),
        serde_json::Value::Array(items) => {
            for item in items {
                metadata_strings(item, out);
            }
        }
        serde_json::Value::Object(map) => {
            for v in map.values() {
                metadata_strings(v, out);
            }
        }
        _ => {}
    }
}

/// Index rows for a single document.
pub fn entries_for_document(doc: &DocumentContent) -> Vec<CodeIndexEntry> {
    let mut seen: HashSet<(String, CodeOrigin)> = HashSet::new();
    let mut entries = Vec::new();

    let mut push_from = |text: &str, origin: CodeOrigin, entries: &mut Vec<CodeIndexEntry>| {
        for m in scan_codes(text) {
            if seen.insert((m.code.norm.clone(), origin)) {
                entries.push(CodeIndexEntry {
                    doc_id: doc.id.clone(),
                    code: m.code.raw,
                    norm: m.code.norm,
                    padded_norm: m.code.padded_norm,
                    origin,
                    position: m.position,
                });
            }
        }
    };

    if let Some(name) = &doc.filename {
        push_from(name, CodeOrigin::Filename, &mut entries);
    }
    push_from(&doc.body, CodeOrigin::Content, &mut entries);

    // Malformed metadata is skipped, not fatal: ingestion owns its shape.
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(&doc.metadata_json) {
        let mut strings = Vec::new();
        metadata_strings(&value, &mut strings);
        for s in strings {
            push_from(&s, CodeOrigin::Metadata, &mut entries);
        }
    }

    entries
}

/// Accumulates documents into a [`StagedIndex`].
#[derive(Debug, Default)]
pub struct IndexBuilder {
    staged: StagedIndex,
}

impl IndexBuilder {
    pub fn new(generation: u64) -> Self {
        Self {
            staged: StagedIndex {
                generation,
                ..Default::default()
            },
        }
    }

    pub fn add_document(&mut self, doc: &DocumentContent) {
        self.staged.covered.insert(doc.id.clone());
        self.staged.entries.extend(entries_for_document(doc));
        if let Some(name) = &doc.filename {
            let padded_name = pad_boundaries(name);
            if !padded_name.is_empty() {
                self.staged.filenames.push(FilenameRecord {
                    doc_id: doc.id.clone(),
                    padded_name,
                });
            }
        }
    }

    pub fn finish(self) -> StagedIndex {
        self.staged
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(id: &str, filename: Option<&str>, body: &str, meta: &str) -> DocumentContent {
        DocumentContent {
            id: id.to_string(),
            filename: filename.map(str::to_string),
            body: body.to_string(),
            metadata_json: meta.to_string(),
        }
    }

    #[test]
    fn test_entries_from_all_origins() {
        let d = doc(
            "d1",
            Some("HRD-442_manual.pdf"),
            "Replace the HRD-442 fan. See also XRN-1620B2.",
            r#"{"model": "ex-3", "tags": ["SM-100"]}"#,
        );
        let entries = entries_for_document(&d);
        let keys: Vec<(&str, CodeOrigin)> =
            entries.iter().map(|e| (e.norm.as_str(), e.origin)).collect();
        assert!(keys.contains(&("HRD-442", CodeOrigin::Filename)));
        assert!(keys.contains(&("HRD-442", CodeOrigin::Content)));
        assert!(keys.contains(&("XRN-1620B2", CodeOrigin::Content)));
        assert!(keys.contains(&("EX-3", CodeOrigin::Metadata)));
        assert!(keys.contains(&("SM-100", CodeOrigin::Metadata)));
    }

    #[test]
    fn test_entries_unique_per_origin() {
        let d = doc("d1", None, "HRD-442 then hrd-442 again", "{}");
        let entries = entries_for_document(&d);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].position, 0);
    }

    #[test]
    fn test_bad_metadata_is_ignored() {
        let d = doc("d1", None, "HRD-442", "not json");
        assert_eq!(entries_for_document(&d).len(), 1);
    }

    #[test]
    fn test_builder_covers_code_free_documents() {
        let mut b = IndexBuilder::new(3);
        b.add_document(&doc("d1", Some("notes.txt"), "nothing here", "{}"));
        b.add_document(&doc("d2", None, "HRD-442", "{}"));
        let staged = b.finish();
        assert_eq!(staged.generation, 3);
        assert_eq!(staged.covered.len(), 2);
        assert_eq!(staged.entries.len(), 1);
        assert_eq!(staged.filenames.len(), 1);
        assert_eq!(staged.filenames[0].padded_name, " NOTES TXT ");
    }
}
