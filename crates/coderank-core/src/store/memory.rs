//! In-memory [`DocumentStore`] for tests and embedded use.
//!
//! Uses a `BTreeMap` behind `std::sync::RwLock`, so ids come back sorted.

use std::collections::BTreeMap;
use std::sync::RwLock;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{DocumentContent, DocumentMetadata};

use super::DocumentStore;

#[derive(Debug, Clone)]
struct StoredDoc {
    content: DocumentContent,
    title: Option<String>,
    source: String,
    updated_at: i64,
}

/// In-memory document store.
#[derive(Debug, Default)]
pub struct InMemoryDocumentStore {
    docs: RwLock<BTreeMap<String, StoredDoc>>,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a document.
    pub fn insert(&self, id: &str, filename: Option<&str>, body: &str) {
        self.insert_with_metadata(id, filename, body, "{}");
    }

    pub fn insert_with_metadata(
        &self,
        id: &str,
        filename: Option<&str>,
        body: &str,
        metadata_json: &str,
    ) {
        let doc = StoredDoc {
            content: DocumentContent {
                id: id.to_string(),
                filename: filename.map(str::to_string),
                body: body.to_string(),
                metadata_json: metadata_json.to_string(),
            },
            title: filename.map(str::to_string),
            source: "memory".to_string(),
            updated_at: chrono::Utc::now().timestamp(),
        };
        self.docs
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(id.to_string(), doc);
    }

    pub fn remove(&self, id: &str) -> bool {
        self.docs
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(id)
            .is_some()
    }

    pub fn len(&self) -> usize {
        self.docs
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn get_document_ids(&self) -> Result<Vec<String>> {
        let docs = self
            .docs
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        Ok(docs.keys().cloned().collect())
    }

    async fn get_document_metadata(&self, id: &str) -> Result<Option<DocumentMetadata>> {
        let docs = self
            .docs
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        Ok(docs.get(id).map(|d| DocumentMetadata {
            id: d.content.id.clone(),
            filename: d.content.filename.clone(),
            title: d.title.clone(),
            source: d.source.clone(),
            updated_at: d.updated_at,
        }))
    }

    async fn get_document_content(&self, id: &str) -> Result<Option<DocumentContent>> {
        let docs = self
            .docs
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        Ok(docs.get(id).map(|d| d.content.clone()))
    }
}
