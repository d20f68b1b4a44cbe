//! Built-in Stage 1 retrievers.
//!
//! | Provider | Type | Technique |
//! |----------|------|-----------|
//! | `fts` | [`FtsStage1`] | SQLite FTS5 BM25 over `documents_fts` |
//! | `http` | [`HttpStage1`] | JSON POST to an external retriever |
//! | `disabled` | [`DisabledStage1`] | Always fails; Stage 0 answers alone |
//!
//! Only rank order is consumed downstream, so each adapter just has to
//! return hits best-first with 1-indexed ranks.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::Deserialize;
use sqlx::{Row, SqlitePool};

use coderank_core::stage1::{Stage1Hit, Stage1Retriever};

use crate::config::{Config, Stage1Provider};

/// Build an FTS5 `MATCH` expression from free text.
///
/// Every run of alphanumeric characters becomes a quoted term and terms are
/// OR-ed, so user punctuation can never produce an FTS syntax error.
pub fn fts_match_expression(query: &str) -> Option<String> {
    let terms: Vec<String> = query
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| format!("\"{t}\""))
        .collect();
    if terms.is_empty() {
        None
    } else {
        Some(terms.join(" OR "))
    }
}

/// Keyword retrieval over the `documents_fts` table.
#[derive(Clone)]
pub struct FtsStage1 {
    pool: SqlitePool,
}

impl FtsStage1 {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Stage1Retriever for FtsStage1 {
    fn name(&self) -> &str {
        "fts"
    }

    async fn search(&self, query: &str, top_k: usize) -> Result<Vec<Stage1Hit>> {
        let Some(expr) = fts_match_expression(query) else {
            return Ok(Vec::new());
        };

        let rows = sqlx::query(
            r#"
            SELECT doc_id, rank
            FROM documents_fts
            WHERE documents_fts MATCH ?
            ORDER BY rank
            LIMIT ?
            "#,
        )
        .bind(&expr)
        .bind(top_k as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .enumerate()
            .map(|(i, row)| {
                let rank: f64 = row.get("rank");
                Stage1Hit {
                    doc_id: row.get("doc_id"),
                    score: -rank, // bm25 is lower-is-better
                    rank: i + 1,
                }
            })
            .collect())
    }
}

#[derive(Debug, Deserialize)]
struct HttpHit {
    doc_id: String,
    #[serde(default)]
    score: f64,
    #[serde(default)]
    rank: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct HttpResponse {
    results: Vec<HttpHit>,
}

/// Delegates Stage 1 to an external service.
///
/// Request: `POST {url}` with `{"query": "...", "top_k": N}`.
/// Response: `{"results": [{"doc_id": "...", "score": 1.0, "rank": 1}, ...]}`
/// in descending relevance. `rank` defaults to list position.
pub struct HttpStage1 {
    client: reqwest::Client,
    url: String,
}

impl HttpStage1 {
    pub fn new(url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.to_string(),
        })
    }
}

#[async_trait]
impl Stage1Retriever for HttpStage1 {
    fn name(&self) -> &str {
        "http"
    }

    async fn search(&self, query: &str, top_k: usize) -> Result<Vec<Stage1Hit>> {
        let body = serde_json::json!({
            "query": query,
            "top_k": top_k,
        });
        let response = self.client.post(&self.url).json(&body).send().await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            bail!("stage1 service error {status}: {text}");
        }
        let parsed: HttpResponse = response.json().await?;

        let mut hits: Vec<Stage1Hit> = parsed
            .results
            .into_iter()
            .enumerate()
            .map(|(i, h)| Stage1Hit {
                doc_id: h.doc_id,
                score: h.score,
                rank: h.rank.filter(|r| *r > 0).unwrap_or(i + 1),
            })
            .collect();
        hits.sort_by_key(|h| h.rank);
        hits.truncate(top_k);
        Ok(hits)
    }
}

/// A Stage 1 that is never available.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledStage1;

#[async_trait]
impl Stage1Retriever for DisabledStage1 {
    fn name(&self) -> &str {
        "disabled"
    }

    async fn search(&self, _query: &str, _top_k: usize) -> Result<Vec<Stage1Hit>> {
        bail!("stage1 retriever is disabled")
    }
}

/// Create the configured Stage 1 retriever.
pub fn create_stage1(config: &Config, pool: &SqlitePool) -> Result<Arc<dyn Stage1Retriever>> {
    match config.stage1.provider {
        Stage1Provider::Fts => Ok(Arc::new(FtsStage1::new(pool.clone()))),
        Stage1Provider::Http => {
            let Some(url) = config.stage1.url.as_deref() else {
                bail!("stage1.url must be specified when provider is 'http'");
            };
            Ok(Arc::new(HttpStage1::new(
                url,
                config.retrieval.stage1_timeout(),
            )?))
        }
        Stage1Provider::Disabled => Ok(Arc::new(DisabledStage1)),
    }
}
