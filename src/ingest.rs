//! Minimal filesystem ingestion.
//!
//! Walks a directory, keeps files matching `[ingest].include_globs` and not
//! matching `exclude_globs`, and upserts each one as a document keyed by its
//! path relative to the root. Documents previously ingested from the same
//! root that no longer exist on disk are deleted. This drives the retrieval
//! core end to end; it does not parse PDFs, OCR or extract tables.

use std::collections::BTreeSet;
use std::path::Path;

use anyhow::{bail, Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::Serialize;
use sqlx::SqlitePool;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::config::IngestConfig;
use crate::sqlite_store::{NewDocument, SqliteDocumentStore};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    pub scanned: usize,
    pub upserted: usize,
    pub skipped: usize,
    pub deleted: usize,
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern).with_context(|| format!("Invalid glob: {pattern}"))?);
    }
    Ok(builder.build()?)
}

fn source_label(root: &Path) -> String {
    format!("filesystem:{}", root.display())
}

/// Ingest every matching file under `root` into the document store.
pub async fn ingest_directory(
    pool: &SqlitePool,
    config: &IngestConfig,
    root: &Path,
) -> Result<IngestReport> {
    if !root.is_dir() {
        bail!("Ingest root is not a directory: {}", root.display());
    }

    let include = build_globset(&config.include_globs)?;
    let mut excludes = vec!["**/.git/**".to_string(), "**/target/**".to_string()];
    excludes.extend(config.exclude_globs.iter().cloned());
    let exclude = build_globset(&excludes)?;

    let store = SqliteDocumentStore::new(pool.clone());
    let source = source_label(root);
    let mut report = IngestReport::default();
    let mut seen = BTreeSet::new();

    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let rel = path
            .strip_prefix(root)
            .unwrap_or(path)
            .to_string_lossy()
            .replace('\\', "/");
        if exclude.is_match(&rel) || !include.is_match(&rel) {
            continue;
        }
        report.scanned += 1;

        let body = match std::fs::read_to_string(path) {
            Ok(body) => body,
            Err(err) => {
                debug!(path = %rel, error = %err, "skipping unreadable file");
                report.skipped += 1;
                continue;
            }
        };
        let updated_at = entry
            .metadata()
            .ok()
            .and_then(|m| m.modified().ok())
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or_else(|| chrono::Utc::now().timestamp());
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string());

        store
            .upsert_document(&NewDocument {
                id: rel.clone(),
                title: filename.clone(),
                filename,
                source: source.clone(),
                body,
                metadata_json: serde_json::json!({ "path": rel }).to_string(),
                updated_at,
            })
            .await?;
        report.upserted += 1;
        seen.insert(rel);
    }

    let existing: Vec<String> = sqlx::query_scalar("SELECT id FROM documents WHERE source = ?")
        .bind(&source)
        .fetch_all(pool)
        .await?;
    for id in existing {
        if !seen.contains(&id) && store.delete_document(&id).await? {
            report.deleted += 1;
        }
    }

    info!(
        root = %root.display(),
        upserted = report.upserted,
        deleted = report.deleted,
        "ingest complete"
    );
    Ok(report)
}
