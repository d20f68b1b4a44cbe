//! SQLite-backed [`DocumentStore`].
//!
//! Reads the `documents` table owned by ingestion. The write methods here
//! exist for the minimal `crk ingest` command and for tests; the retrieval
//! core itself never writes documents.

use anyhow::Result;
use async_trait::async_trait;
use sqlx::{Row, SqlitePool};

use coderank_core::models::{DocumentContent, DocumentMetadata};
use coderank_core::store::DocumentStore;

/// A document as written by ingestion.
#[derive(Debug, Clone)]
pub struct NewDocument {
    pub id: String,
    pub filename: Option<String>,
    pub title: Option<String>,
    pub source: String,
    pub body: String,
    pub metadata_json: String,
    pub updated_at: i64,
}

/// SQLite implementation of the [`DocumentStore`] trait.
#[derive(Clone)]
pub struct SqliteDocumentStore {
    pool: SqlitePool,
}

impl SqliteDocumentStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Insert or replace a document and its FTS row in one transaction.
    pub async fn upsert_document(&self, doc: &NewDocument) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO documents (id, filename, title, source, body, metadata_json, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                filename = excluded.filename,
                title = excluded.title,
                source = excluded.source,
                body = excluded.body,
                metadata_json = excluded.metadata_json,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&doc.id)
        .bind(&doc.filename)
        .bind(&doc.title)
        .bind(&doc.source)
        .bind(&doc.body)
        .bind(&doc.metadata_json)
        .bind(doc.updated_at)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM documents_fts WHERE doc_id = ?")
            .bind(&doc.id)
            .execute(&mut *tx)
            .await?;

        sqlx::query("INSERT INTO documents_fts (doc_id, filename, title, body) VALUES (?, ?, ?, ?)")
            .bind(&doc.id)
            .bind(doc.filename.as_deref().unwrap_or(""))
            .bind(doc.title.as_deref().unwrap_or(""))
            .bind(&doc.body)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    pub async fn delete_document(&self, id: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM documents_fts WHERE doc_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        let deleted = sqlx::query("DELETE FROM documents WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;
        Ok(deleted > 0)
    }

    pub async fn count_documents(&self) -> Result<i64> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents")
            .fetch_one(&self.pool)
            .await?;
        Ok(n)
    }
}

#[async_trait]
impl DocumentStore for SqliteDocumentStore {
    async fn get_document_ids(&self) -> Result<Vec<String>> {
        let ids: Vec<String> = sqlx::query_scalar("SELECT id FROM documents ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        Ok(ids)
    }

    async fn get_document_metadata(&self, id: &str) -> Result<Option<DocumentMetadata>> {
        let row = sqlx::query(
            "SELECT id, filename, title, source, updated_at FROM documents WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| DocumentMetadata {
            id: r.get("id"),
            filename: r.get("filename"),
            title: r.get("title"),
            source: r.get("source"),
            updated_at: r.get("updated_at"),
        }))
    }

    async fn get_document_content(&self, id: &str) -> Result<Option<DocumentContent>> {
        let row = sqlx::query("SELECT id, filename, body, metadata_json FROM documents WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|r| DocumentContent {
            id: r.get("id"),
            filename: r.get("filename"),
            body: r.get("body"),
            metadata_json: r.get("metadata_json"),
        }))
    }
}
