//! CLI command implementations.
//!
//! Each `run_*` function opens the service from config, performs one
//! operation and prints a human-readable report to stdout.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};

use crate::config::Config;
use crate::ingest::ingest_directory;
use crate::retriever::SearchMode;
use crate::server;
use crate::service::RetrievalService;

pub async fn run_ingest(config: &Config, dir: &Path, reindex: bool) -> Result<()> {
    let service = RetrievalService::open(config).await?;
    let pool = service
        .pool()
        .context("ingest requires a SQLite-backed service")?;

    let report = ingest_directory(pool, &config.ingest, dir).await?;
    println!("Ingested {}:", dir.display());
    println!("  scanned: {}", report.scanned);
    println!("  upserted: {}", report.upserted);
    println!("  skipped: {}", report.skipped);
    println!("  deleted: {}", report.deleted);

    if reindex {
        let report = service.reindex().await?;
        println!(
            "Promoted generation {} ({} documents, {} code entries).",
            report.generation, report.documents, report.entries
        );
    }
    Ok(())
}

pub async fn run_reindex(config: &Config) -> Result<()> {
    let service = RetrievalService::open(config).await?;
    let report = service.reindex().await?;
    println!("Promoted generation {}.", report.generation);
    if let Some(prev) = report.previous_generation {
        println!("  previous (retained for rollback): {}", prev);
    }
    println!("  documents: {}", report.documents);
    println!("  code entries: {}", report.entries);
    println!("  inconsistencies: {}", report.inconsistencies);
    println!("  took: {}ms", report.duration_ms);
    Ok(())
}

pub async fn run_rollback(config: &Config) -> Result<()> {
    let service = RetrievalService::open(config).await?;
    let active = service.rollback().await?;
    println!("Rolled back. Active generation is now {}.", active);
    Ok(())
}

pub async fn run_search(
    config: &Config,
    query: &str,
    mode: &str,
    limit: Option<usize>,
    json: bool,
) -> Result<()> {
    let mode: SearchMode = mode.parse()?;
    let service = RetrievalService::open(config).await?;
    let results = service.search_enriched(query, mode, limit).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&results)?);
        return Ok(());
    }

    if results.is_empty() {
        println!("No results.");
        return Ok(());
    }

    for (i, item) in results.iter().enumerate() {
        let r = &item.result;
        let name = item
            .metadata
            .as_ref()
            .and_then(|m| m.title.as_deref().or(m.filename.as_deref()))
            .unwrap_or("(untitled)");
        println!(
            "{}. [{:.4}] {} ({})",
            i + 1,
            r.score(),
            name,
            r.match_type()
        );
        if let Some(m) = &item.metadata {
            let date = chrono::DateTime::from_timestamp(m.updated_at, 0)
                .map(|dt| dt.format("%Y-%m-%d").to_string())
                .unwrap_or_default();
            println!("    updated: {}", date);
            println!("    source: {}", m.source);
        }
        println!("    id: {}", r.doc_id());
        println!();
    }
    Ok(())
}

pub async fn run_check(config: &Config) -> Result<()> {
    let service = RetrievalService::open(config).await?;
    let report = service.check_consistency().await?;
    println!("Generation {}:", report.generation);
    println!("  store documents: {}", report.store_documents);
    println!("  missing from index: {}", report.missing.len());
    for id in report.missing.iter().take(20) {
        println!("    - {}", id);
    }
    println!("  orphaned in index: {}", report.orphaned.len());
    for id in report.orphaned.iter().take(20) {
        println!("    - {}", id);
    }
    Ok(())
}

pub async fn run_metrics(config: &Config) -> Result<()> {
    let service = RetrievalService::open(config).await?;
    service.check_consistency().await?;
    println!(
        "{}",
        serde_json::to_string_pretty(&service.metrics_snapshot())?
    );
    Ok(())
}

pub async fn run_serve(config: &Config) -> Result<()> {
    let service = Arc::new(RetrievalService::open(config).await?);
    server::run_server(service).await
}
