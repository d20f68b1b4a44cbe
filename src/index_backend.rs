//! Generation storage for the exact-match index.
//!
//! An [`IndexBackend`] persists staged generations out of sight of readers
//! and records which generation is active. It never decides *when* to
//! promote; that is the reindex coordinator's job. Two backends exist:
//!
//! | Backend | Persistence | Module |
//! |---------|-------------|--------|
//! | [`MemoryIndexBackend`] | none (process lifetime) | here |
//! | `SqliteIndexBackend` | `code_index_*` tables | [`crate::sqlite_index`] |

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use coderank_core::index::memory::MemoryCodeIndex;
use coderank_core::index::{CodeIndex, StagedIndex};

/// One immutable, queryable index generation.
#[derive(Clone)]
pub struct Generation {
    pub id: u64,
    pub index: Arc<dyn CodeIndex>,
    /// Unix seconds when the generation became active.
    pub activated_at: i64,
}

impl Generation {
    /// Generation 0: the empty index served before the first reindex.
    pub fn empty() -> Self {
        Self {
            id: 0,
            index: Arc::new(MemoryCodeIndex::empty()),
            activated_at: 0,
        }
    }
}

impl std::fmt::Debug for Generation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Generation")
            .field("id", &self.id)
            .field("activated_at", &self.activated_at)
            .finish()
    }
}

/// Generations restored from durable storage at startup.
#[derive(Debug, Clone)]
pub struct PersistedGenerations {
    pub active: Generation,
    pub previous: Option<Generation>,
}

#[async_trait]
pub trait IndexBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Identifier for the next staged generation. Strictly increasing.
    async fn next_generation_id(&self) -> Result<u64>;

    /// Persist `staged` without making it active, returning a reader over it.
    async fn stage(&self, staged: StagedIndex) -> Result<Arc<dyn CodeIndex>>;

    /// Record `active` as the live generation and `previous` as the rollback
    /// target. Storage for any other generation may be released.
    async fn promote(&self, active: u64, previous: Option<u64>) -> Result<()>;

    /// Release a staged generation that failed validation.
    async fn discard(&self, generation: u64) -> Result<()>;

    /// The active and previous generations recorded by the last `promote`.
    async fn open(&self) -> Result<Option<PersistedGenerations>>;
}

/// Keeps staged generations only as in-memory snapshots.
#[derive(Debug)]
pub struct MemoryIndexBackend {
    next_id: AtomicU64,
}

impl MemoryIndexBackend {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
        }
    }
}

impl Default for MemoryIndexBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IndexBackend for MemoryIndexBackend {
    fn name(&self) -> &str {
        "memory"
    }

    async fn next_generation_id(&self) -> Result<u64> {
        Ok(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    async fn stage(&self, staged: StagedIndex) -> Result<Arc<dyn CodeIndex>> {
        Ok(Arc::new(MemoryCodeIndex::from_staged(staged)))
    }

    async fn promote(&self, _active: u64, _previous: Option<u64>) -> Result<()> {
        Ok(())
    }

    async fn discard(&self, _generation: u64) -> Result<()> {
        Ok(())
    }

    async fn open(&self) -> Result<Option<PersistedGenerations>> {
        Ok(None)
    }
}
