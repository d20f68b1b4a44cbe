//! Database schema migrations (idempotent).
//!
//! | Table | Owner | Purpose |
//! |-------|-------|---------|
//! | `documents` | ingestion | Authoritative document store |
//! | `documents_fts` | ingestion | FTS5 keyword index for the built-in Stage 1 |
//! | `code_index_entries` | reindex | Exact-match rows, scoped by generation |
//! | `code_index_filenames` | reindex | Padded filenames, scoped by generation |
//! | `code_index_documents` | reindex | Every document a generation was built from |
//! | `index_generations` | reindex | One row per staged/promoted generation |
//! | `index_state` | reindex | Singleton active/previous generation pointer |

use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate_pool(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Apply every migration to an open pool.
pub async fn migrate_pool(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS documents (
            id TEXT PRIMARY KEY,
            filename TEXT,
            title TEXT,
            source TEXT NOT NULL DEFAULT 'local',
            body TEXT NOT NULL,
            metadata_json TEXT NOT NULL DEFAULT '{}',
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // FTS5 CREATE is not idempotent natively, so we check first
    let fts_exists: bool = sqlx::query_scalar(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='documents_fts'",
    )
    .fetch_one(pool)
    .await?;

    if !fts_exists {
        sqlx::query(
            r#"
            CREATE VIRTUAL TABLE documents_fts USING fts5(
                doc_id UNINDEXED,
                filename,
                title,
                body
            )
            "#,
        )
        .execute(pool)
        .await?;
    }

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS code_index_entries (
            generation INTEGER NOT NULL,
            doc_id TEXT NOT NULL,
            code TEXT NOT NULL,
            norm TEXT NOT NULL,
            padded_norm TEXT NOT NULL,
            origin TEXT NOT NULL,
            position INTEGER NOT NULL,
            UNIQUE(generation, doc_id, norm, origin)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS code_index_filenames (
            generation INTEGER NOT NULL,
            doc_id TEXT NOT NULL,
            padded_name TEXT NOT NULL,
            PRIMARY KEY (generation, doc_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS code_index_documents (
            generation INTEGER NOT NULL,
            doc_id TEXT NOT NULL,
            PRIMARY KEY (generation, doc_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS index_generations (
            id INTEGER PRIMARY KEY,
            state TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            promoted_at INTEGER,
            entry_count INTEGER NOT NULL DEFAULT 0,
            document_count INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS index_state (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            active_generation INTEGER NOT NULL,
            previous_generation INTEGER,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_code_entries_norm ON code_index_entries(generation, norm)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_code_entries_doc ON code_index_entries(generation, doc_id)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_documents_updated_at ON documents(updated_at DESC)")
        .execute(pool)
        .await?;

    Ok(())
}
