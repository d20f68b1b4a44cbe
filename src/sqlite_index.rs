//! SQLite-backed exact-match index.
//!
//! All generations share the `code_index_*` tables and are told apart by a
//! `generation` column. A [`SqliteCodeIndex`] is a reader pinned to one
//! generation, so rows staged for generation N+1 are invisible to queries
//! against N even though they live in the same table. Promotion only
//! rewrites the `index_state` pointer row.

use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};

use coderank_core::index::{CodeHit, CodeIndex, StagedIndex};
use coderank_core::models::CodeOrigin;

use crate::index_backend::{Generation, IndexBackend, PersistedGenerations};

/// Read access to one persisted generation.
#[derive(Clone)]
pub struct SqliteCodeIndex {
    pool: SqlitePool,
    generation: i64,
}

impl SqliteCodeIndex {
    pub fn new(pool: SqlitePool, generation: u64) -> Self {
        Self {
            pool,
            generation: generation as i64,
        }
    }
}

fn parse_origin(s: &str) -> Result<CodeOrigin> {
    CodeOrigin::parse(s).ok_or_else(|| anyhow!("unknown code origin in index: {s}"))
}

#[async_trait]
impl CodeIndex for SqliteCodeIndex {
    async fn lookup_norms(&self, norms: &[String], limit: usize) -> Result<Vec<CodeHit>> {
        if norms.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }

        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT doc_id, norm, origin, position FROM code_index_entries WHERE generation = ",
        );
        qb.push_bind(self.generation);
        qb.push(" AND norm IN (");
        let mut list = qb.separated(", ");
        for norm in norms {
            list.push_bind(norm.clone());
        }
        list.push_unseparated(")");
        qb.push(" ORDER BY doc_id, origin LIMIT ");
        qb.push_bind(limit as i64);

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter()
            .map(|r| {
                let origin: String = r.get("origin");
                let position: i64 = r.get("position");
                Ok(CodeHit {
                    doc_id: r.get("doc_id"),
                    norm: r.get("norm"),
                    origin: parse_origin(&origin)?,
                    position: position as usize,
                })
            })
            .collect()
    }

    async fn search_filenames(
        &self,
        padded_norms: &[String],
        limit: usize,
    ) -> Result<Vec<CodeHit>> {
        let needles: Vec<&String> = padded_norms.iter().filter(|p| !p.is_empty()).collect();
        if needles.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }

        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT doc_id, padded_name FROM code_index_filenames WHERE generation = ",
        );
        qb.push_bind(self.generation);
        qb.push(" AND (");
        let mut any = qb.separated(" OR ");
        for needle in &needles {
            any.push("instr(padded_name, ");
            any.push_bind_unseparated((*needle).clone());
            any.push_unseparated(") > 0");
        }
        qb.push(") ORDER BY doc_id LIMIT ");
        qb.push_bind(limit as i64);

        let rows = qb.build().fetch_all(&self.pool).await?;
        let mut hits = Vec::with_capacity(rows.len());
        for r in rows {
            let padded_name: String = r.get("padded_name");
            let Some(needle) = needles.iter().find(|n| padded_name.contains(n.as_str())) else {
                continue;
            };
            hits.push(CodeHit {
                doc_id: r.get("doc_id"),
                norm: needle.trim().to_string(),
                origin: CodeOrigin::Filename,
                position: padded_name.find(needle.as_str()).unwrap_or(0),
            });
        }
        Ok(hits)
    }

    async fn covered_documents(&self) -> Result<BTreeSet<String>> {
        let ids: Vec<String> =
            sqlx::query_scalar("SELECT doc_id FROM code_index_documents WHERE generation = ?")
                .bind(self.generation)
                .fetch_all(&self.pool)
                .await?;
        Ok(ids.into_iter().collect())
    }

    async fn referenced_documents(&self) -> Result<BTreeSet<String>> {
        let ids: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT doc_id FROM code_index_entries WHERE generation = ?
            UNION
            SELECT doc_id FROM code_index_filenames WHERE generation = ?
            "#,
        )
        .bind(self.generation)
        .bind(self.generation)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids.into_iter().collect())
    }

    async fn entry_count(&self) -> Result<usize> {
        let n: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM code_index_entries WHERE generation = ?")
                .bind(self.generation)
                .fetch_one(&self.pool)
                .await?;
        Ok(n as usize)
    }
}

/// Persists generations in SQLite and restores them on startup.
#[derive(Clone)]
pub struct SqliteIndexBackend {
    pool: SqlitePool,
}

impl SqliteIndexBackend {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn load(&self, generation: i64) -> Result<Option<Generation>> {
        let promoted_at: Option<Option<i64>> =
            sqlx::query_scalar("SELECT promoted_at FROM index_generations WHERE id = ?")
                .bind(generation)
                .fetch_optional(&self.pool)
                .await?;
        Ok(promoted_at.map(|ts| Generation {
            id: generation as u64,
            index: Arc::new(SqliteCodeIndex::new(self.pool.clone(), generation as u64)),
            activated_at: ts.unwrap_or(0),
        }))
    }
}

#[async_trait]
impl IndexBackend for SqliteIndexBackend {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn next_generation_id(&self) -> Result<u64> {
        let next: i64 = sqlx::query_scalar("SELECT COALESCE(MAX(id), 0) + 1 FROM index_generations")
            .fetch_one(&self.pool)
            .await?;
        Ok(next as u64)
    }

    async fn stage(&self, staged: StagedIndex) -> Result<Arc<dyn CodeIndex>> {
        let generation = staged.generation as i64;
        let now = chrono::Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;

        // Leftovers from a crashed stage of the same id.
        for table in [
            "code_index_entries",
            "code_index_filenames",
            "code_index_documents",
        ] {
            sqlx::query(&format!("DELETE FROM {table} WHERE generation = ?"))
                .bind(generation)
                .execute(&mut *tx)
                .await?;
        }

        sqlx::query(
            r#"
            INSERT INTO index_generations (id, state, created_at, entry_count, document_count)
            VALUES (?, 'staged', ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                state = 'staged',
                created_at = excluded.created_at,
                promoted_at = NULL,
                entry_count = excluded.entry_count,
                document_count = excluded.document_count
            "#,
        )
        .bind(generation)
        .bind(now)
        .bind(staged.entries.len() as i64)
        .bind(staged.covered.len() as i64)
        .execute(&mut *tx)
        .await?;

        for e in &staged.entries {
            sqlx::query(
                r#"
                INSERT OR IGNORE INTO code_index_entries
                    (generation, doc_id, code, norm, padded_norm, origin, position)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(generation)
            .bind(&e.doc_id)
            .bind(&e.code)
            .bind(&e.norm)
            .bind(&e.padded_norm)
            .bind(e.origin.as_str())
            .bind(e.position as i64)
            .execute(&mut *tx)
            .await?;
        }

        for f in &staged.filenames {
            sqlx::query(
                "INSERT OR REPLACE INTO code_index_filenames (generation, doc_id, padded_name) VALUES (?, ?, ?)",
            )
            .bind(generation)
            .bind(&f.doc_id)
            .bind(&f.padded_name)
            .execute(&mut *tx)
            .await?;
        }

        for doc_id in &staged.covered {
            sqlx::query("INSERT OR IGNORE INTO code_index_documents (generation, doc_id) VALUES (?, ?)")
                .bind(generation)
                .bind(doc_id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;

        Ok(Arc::new(SqliteCodeIndex::new(
            self.pool.clone(),
            staged.generation,
        )))
    }

    async fn promote(&self, active: u64, previous: Option<u64>) -> Result<()> {
        let active = active as i64;
        let previous = previous.map(|p| p as i64);
        let now = chrono::Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;

        // Staged generations other than `active` belong to interrupted runs.
        sqlx::query(
            "UPDATE index_generations SET state = 'discarded' \
             WHERE state IN ('active', 'retained', 'staged')",
        )
        .execute(&mut *tx)
        .await?;
        sqlx::query("UPDATE index_generations SET state = 'active', promoted_at = ? WHERE id = ?")
            .bind(now)
            .bind(active)
            .execute(&mut *tx)
            .await?;
        if let Some(prev) = previous {
            sqlx::query("UPDATE index_generations SET state = 'retained' WHERE id = ?")
                .bind(prev)
                .execute(&mut *tx)
                .await?;
        }

        for table in [
            "code_index_entries",
            "code_index_filenames",
            "code_index_documents",
        ] {
            sqlx::query(&format!(
                "DELETE FROM {table} WHERE generation IN \
                 (SELECT id FROM index_generations WHERE state = 'discarded')"
            ))
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            r#"
            INSERT INTO index_state (id, active_generation, previous_generation, updated_at)
            VALUES (1, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                active_generation = excluded.active_generation,
                previous_generation = excluded.previous_generation,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(active)
        .bind(previous)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn discard(&self, generation: u64) -> Result<()> {
        let generation = generation as i64;
        let mut tx = self.pool.begin().await?;
        for table in [
            "code_index_entries",
            "code_index_filenames",
            "code_index_documents",
        ] {
            sqlx::query(&format!("DELETE FROM {table} WHERE generation = ?"))
                .bind(generation)
                .execute(&mut *tx)
                .await?;
        }
        sqlx::query("UPDATE index_generations SET state = 'discarded' WHERE id = ?")
            .bind(generation)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn open(&self) -> Result<Option<PersistedGenerations>> {
        let row = sqlx::query(
            "SELECT active_generation, previous_generation FROM index_state WHERE id = 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };

        let active_id: i64 = row.get("active_generation");
        let previous_id: Option<i64> = row.get("previous_generation");

        let Some(active) = self.load(active_id).await? else {
            anyhow::bail!("index_state points at missing generation {active_id}");
        };
        let previous = match previous_id {
            Some(id) => self.load(id).await?,
            None => None,
        };
        Ok(Some(PersistedGenerations { active, previous }))
    }
}
