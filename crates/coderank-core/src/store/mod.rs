//! Document store abstraction.
//!
//! The authoritative document collection is owned by ingestion; the core
//! only reads it. [`DocumentStore`] is what the reindex coordinator
//! validates against and what the fusion retriever enriches results from.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{DocumentContent, DocumentMetadata};

/// Read-only view of the authoritative document collection.
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`get_document_ids`](DocumentStore::get_document_ids) | Every document id, for validation |
/// | [`get_document_metadata`](DocumentStore::get_document_metadata) | Presentation metadata |
/// | [`get_document_content`](DocumentStore::get_document_content) | Filename, body and metadata for staging |
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get_document_ids(&self) -> Result<Vec<String>>;

    async fn get_document_metadata(&self, id: &str) -> Result<Option<DocumentMetadata>>;

    async fn get_document_content(&self, id: &str) -> Result<Option<DocumentContent>>;
}
