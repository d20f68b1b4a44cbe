//! Zero-downtime index rebuilds.
//!
//! ```text
//! Idle ──► Staging ──► Validating ──► Swapping ──► Idle
//!             │            │              │
//!             └────────────┴──────────────┴──► Failed ──► Idle
//! ```
//!
//! A reindex builds a complete new generation next to the active one,
//! cross-checks it against the document store, and only then swaps the
//! active-generation pointer. Readers load that pointer once per request,
//! so they see either the whole old generation or the whole new one.
//!
//! Only one reindex (or rollback) runs at a time. A second request is
//! rejected with [`RetrievalError::ReindexInProgress`] rather than queued.
//! The swap lock is held only for the pointer update itself, never while
//! staging or validating.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use anyhow::Result;
use arc_swap::ArcSwap;
use serde::Serialize;
use tracing::{info, warn};

use coderank_core::index::builder::IndexBuilder;
use coderank_core::index::CodeIndex;
use coderank_core::store::DocumentStore;

use crate::error::RetrievalError;
use crate::index_backend::{Generation, IndexBackend};
use crate::metrics::RetrievalMetrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReindexState {
    Idle,
    Staging,
    Validating,
    Swapping,
    Failed,
}

impl ReindexState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReindexState::Idle => "idle",
            ReindexState::Staging => "staging",
            ReindexState::Validating => "validating",
            ReindexState::Swapping => "swapping",
            ReindexState::Failed => "failed",
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            1 => ReindexState::Staging,
            2 => ReindexState::Validating,
            3 => ReindexState::Swapping,
            4 => ReindexState::Failed,
            _ => ReindexState::Idle,
        }
    }

    fn to_u8(self) -> u8 {
        match self {
            ReindexState::Idle => 0,
            ReindexState::Staging => 1,
            ReindexState::Validating => 2,
            ReindexState::Swapping => 3,
            ReindexState::Failed => 4,
        }
    }
}

/// Symmetric difference between the document store and one generation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    pub generation: u64,
    pub store_documents: usize,
    /// In the store but never visited by the index build.
    pub missing: Vec<String>,
    /// Indexed but no longer in the store.
    pub orphaned: Vec<String>,
}

impl ValidationReport {
    pub fn inconsistencies(&self) -> usize {
        self.missing.len() + self.orphaned.len()
    }
}

/// Cross-check `index` against `store`.
pub async fn validate(
    generation: u64,
    store: &dyn DocumentStore,
    index: &dyn CodeIndex,
) -> Result<ValidationReport> {
    let store_ids: BTreeSet<String> = store.get_document_ids().await?.into_iter().collect();
    let covered = index.covered_documents().await?;
    let referenced = index.referenced_documents().await?;

    let missing = store_ids.difference(&covered).cloned().collect();
    let orphaned = covered
        .union(&referenced)
        .filter(|id| !store_ids.contains(*id))
        .cloned()
        .collect();

    Ok(ValidationReport {
        generation,
        store_documents: store_ids.len(),
        missing,
        orphaned,
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct ReindexReport {
    pub generation: u64,
    pub previous_generation: Option<u64>,
    pub documents: usize,
    pub entries: usize,
    pub inconsistencies: usize,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReindexStatus {
    pub state: ReindexState,
    pub active_generation: u64,
    pub previous_generation: Option<u64>,
    pub last_reindex_timestamp: Option<i64>,
    pub last_error: Option<String>,
}

pub struct ReindexCoordinator {
    store: Arc<dyn DocumentStore>,
    backend: Arc<dyn IndexBackend>,
    active: Arc<ArcSwap<Generation>>,
    /// Rollback target. Also the swap lock: the active pointer is only
    /// replaced while this mutex is held.
    previous: Mutex<Option<Arc<Generation>>>,
    running: AtomicBool,
    state: AtomicU8,
    last_reindex: AtomicI64,
    last_error: Mutex<Option<String>>,
    max_inconsistencies: usize,
    metrics: Arc<RetrievalMetrics>,
}

/// Holds the singleton reindex lock; releasing it returns the state to idle.
struct RunGuard<'a> {
    coordinator: &'a ReindexCoordinator,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.coordinator.set_state(ReindexState::Idle);
        self.coordinator.running.store(false, Ordering::Release);
    }
}

impl ReindexCoordinator {
    /// Restore the generations recorded by `backend`, or start from the
    /// empty generation 0.
    pub async fn open(
        store: Arc<dyn DocumentStore>,
        backend: Arc<dyn IndexBackend>,
        max_inconsistencies: usize,
        metrics: Arc<RetrievalMetrics>,
    ) -> Result<Self> {
        let (active, previous) = match backend.open().await? {
            Some(persisted) => (persisted.active, persisted.previous.map(Arc::new)),
            None => (Generation::empty(), None),
        };
        info!(
            backend = backend.name(),
            generation = active.id,
            "index generation restored"
        );
        let last_reindex = active.activated_at;

        Ok(Self {
            store,
            backend,
            active: Arc::new(ArcSwap::from_pointee(active)),
            previous: Mutex::new(previous),
            running: AtomicBool::new(false),
            state: AtomicU8::new(ReindexState::Idle.to_u8()),
            last_reindex: AtomicI64::new(last_reindex),
            last_error: Mutex::new(None),
            max_inconsistencies,
            metrics,
        })
    }

    /// Shared handle to the active-generation pointer, for readers.
    pub fn active_handle(&self) -> Arc<ArcSwap<Generation>> {
        self.active.clone()
    }

    pub fn active(&self) -> Arc<Generation> {
        self.active.load_full()
    }

    pub fn state(&self) -> ReindexState {
        ReindexState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ReindexState) {
        self.state.store(state.to_u8(), Ordering::Release);
    }

    pub fn last_reindex_timestamp(&self) -> Option<i64> {
        match self.last_reindex.load(Ordering::Relaxed) {
            0 => None,
            ts => Some(ts),
        }
    }

    pub fn status(&self) -> ReindexStatus {
        let previous = self
            .previous
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|g| g.id);
        ReindexStatus {
            state: self.state(),
            active_generation: self.active.load().id,
            previous_generation: previous,
            last_reindex_timestamp: self.last_reindex_timestamp(),
            last_error: self
                .last_error
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
        }
    }

    fn try_begin(&self) -> Result<RunGuard<'_>, RetrievalError> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| RetrievalError::ReindexInProgress)?;
        Ok(RunGuard { coordinator: self })
    }

    fn record_failure(&self, err: &RetrievalError) {
        self.set_state(ReindexState::Failed);
        *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) = Some(err.to_string());
    }

    /// Replace the active pointer and retain `retained` for rollback.
    fn swap(&self, next: Generation, retained: Option<Arc<Generation>>) {
        let mut previous = self.previous.lock().unwrap_or_else(PoisonError::into_inner);
        self.last_reindex.store(next.activated_at, Ordering::Relaxed);
        self.active.store(Arc::new(next));
        *previous = retained;
    }

    /// Rebuild the index from the document store and promote it.
    ///
    /// Returns the new generation id in the report. On any failure the
    /// staged generation is discarded and the active one keeps serving.
    pub async fn reindex_request(&self) -> Result<ReindexReport, RetrievalError> {
        let _guard = self.try_begin()?;
        let started = Instant::now();
        info!("reindex started");

        match self.run_reindex(started).await {
            Ok(report) => {
                *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) = None;
                info!(
                    generation = report.generation,
                    documents = report.documents,
                    entries = report.entries,
                    duration_ms = report.duration_ms,
                    "reindex promoted"
                );
                Ok(report)
            }
            Err(err) => {
                self.record_failure(&err);
                warn!(error = %err, "reindex failed; previous generation remains active");
                Err(err)
            }
        }
    }

    async fn run_reindex(&self, started: Instant) -> Result<ReindexReport, RetrievalError> {
        self.set_state(ReindexState::Staging);
        let current = self.active.load_full();
        let generation = self
            .backend
            .next_generation_id()
            .await?
            .max(current.id + 1);

        let mut builder = IndexBuilder::new(generation);
        for id in self.store.get_document_ids().await? {
            // Deleted since listing; validation will not expect it either.
            if let Some(doc) = self.store.get_document_content(&id).await? {
                builder.add_document(&doc);
            }
        }
        let staged = builder.finish();
        let documents = staged.covered.len();
        let entries = staged.entries.len();
        let index = self.backend.stage(staged).await?;
        info!(generation, documents, entries, "generation staged");

        match self.validate_and_promote(generation, index, &current).await {
            Ok(inconsistencies) => Ok(ReindexReport {
                generation,
                previous_generation: (current.id != 0).then_some(current.id),
                documents,
                entries,
                inconsistencies,
                duration_ms: started.elapsed().as_millis() as u64,
            }),
            Err(err) => {
                if let Err(discard_err) = self.backend.discard(generation).await {
                    warn!(generation, error = %discard_err, "failed to discard staged generation");
                }
                Err(err)
            }
        }
    }

    async fn validate_and_promote(
        &self,
        generation: u64,
        index: Arc<dyn CodeIndex>,
        current: &Arc<Generation>,
    ) -> Result<usize, RetrievalError> {
        self.set_state(ReindexState::Validating);
        let report = validate(generation, self.store.as_ref(), index.as_ref()).await?;
        let found = report.inconsistencies();
        if found > self.max_inconsistencies {
            warn!(
                generation,
                missing = report.missing.len(),
                orphaned = report.orphaned.len(),
                "staged generation failed validation"
            );
            return Err(RetrievalError::IndexInconsistency {
                found,
                tolerance: self.max_inconsistencies,
            });
        }

        self.set_state(ReindexState::Swapping);
        let retained = (current.id != 0).then(|| current.clone());
        self.backend
            .promote(generation, retained.as_ref().map(|g| g.id))
            .await?;
        self.swap(
            Generation {
                id: generation,
                index,
                activated_at: chrono::Utc::now().timestamp(),
            },
            retained,
        );
        self.metrics.set_stale_index_entries(found as u64);
        Ok(found)
    }

    /// Re-activate the retained previous generation. The generation being
    /// replaced becomes the new rollback target.
    pub async fn rollback(&self) -> Result<u64, RetrievalError> {
        let _guard = self.try_begin()?;
        let target = self
            .previous
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(RetrievalError::NoPreviousGeneration)?;
        let current = self.active.load_full();

        self.set_state(ReindexState::Swapping);
        if let Err(err) = self.backend.promote(target.id, Some(current.id)).await {
            let err = RetrievalError::from(err);
            self.record_failure(&err);
            return Err(err);
        }
        self.swap(
            Generation {
                id: target.id,
                index: target.index.clone(),
                activated_at: chrono::Utc::now().timestamp(),
            },
            Some(current.clone()),
        );
        info!(from = current.id, to = target.id, "rolled back index generation");
        Ok(target.id)
    }

    /// Validate the active generation against the current store and
    /// publish the result as `stale_index_entries`.
    pub async fn check_consistency(&self) -> Result<ValidationReport, RetrievalError> {
        let generation = self.active.load_full();
        let report = validate(generation.id, self.store.as_ref(), generation.index.as_ref()).await?;
        self.metrics
            .set_stale_index_entries(report.inconsistencies() as u64);
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index_backend::MemoryIndexBackend;
    use async_trait::async_trait;
    use coderank_core::index::StagedIndex;
    use coderank_core::store::memory::InMemoryDocumentStore;

    async fn coordinator(
        store: Arc<InMemoryDocumentStore>,
        backend: Arc<dyn IndexBackend>,
        tolerance: usize,
    ) -> ReindexCoordinator {
        ReindexCoordinator::open(store, backend, tolerance, Arc::new(RetrievalMetrics::new()))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_reindex_promotes_new_generation() {
        let store = Arc::new(InMemoryDocumentStore::new());
        store.insert("a", Some("a.txt"), "HRD-442");
        store.insert("b", Some("notes.txt"), "no codes at all");
        let c = coordinator(store, Arc::new(MemoryIndexBackend::new()), 0).await;
        assert_eq!(c.active().id, 0);
        assert_eq!(c.last_reindex_timestamp(), None);

        let report = c.reindex_request().await.unwrap();
        assert_eq!(report.generation, 1);
        assert_eq!(report.documents, 2);
        assert_eq!(report.previous_generation, None);
        assert_eq!(c.active().id, 1);
        assert_eq!(c.state(), ReindexState::Idle);
        assert!(c.last_reindex_timestamp().is_some());

        let second = c.reindex_request().await.unwrap();
        assert_eq!(second.generation, 2);
        assert_eq!(second.previous_generation, Some(1));
        assert_eq!(c.status().previous_generation, Some(1));
    }

    #[tokio::test]
    async fn test_rollback_swaps_with_previous() {
        let store = Arc::new(InMemoryDocumentStore::new());
        store.insert("a", None, "HRD-442");
        let c = coordinator(store.clone(), Arc::new(MemoryIndexBackend::new()), 0).await;
        assert_eq!(c.rollback().await, Err(RetrievalError::NoPreviousGeneration));

        c.reindex_request().await.unwrap();
        store.insert("b", None, "EX-3");
        c.reindex_request().await.unwrap();
        assert_eq!(c.active().id, 2);

        assert_eq!(c.rollback().await, Ok(1));
        assert_eq!(c.active().id, 1);
        assert_eq!(c.status().previous_generation, Some(2));
        assert_eq!(c.active().index.entry_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_check_consistency_reports_drift() {
        let store = Arc::new(InMemoryDocumentStore::new());
        store.insert("a", None, "HRD-442");
        store.insert("b", None, "EX-3");
        let c = coordinator(store.clone(), Arc::new(MemoryIndexBackend::new()), 0).await;
        c.reindex_request().await.unwrap();
        assert_eq!(c.check_consistency().await.unwrap().inconsistencies(), 0);

        store.remove("a");
        store.insert("c", None, "plain");
        let report = c.check_consistency().await.unwrap();
        assert_eq!(report.missing, vec!["c".to_string()]);
        assert_eq!(report.orphaned, vec!["a".to_string()]);
        assert_eq!(c.metrics.stale_index_entries(), 2);
    }

    /// Stages an index that silently drops one document.
    struct LossyBackend(MemoryIndexBackend);

    #[async_trait]
    impl IndexBackend for LossyBackend {
        fn name(&self) -> &str {
            "lossy"
        }
        async fn next_generation_id(&self) -> Result<u64> {
            self.0.next_generation_id().await
        }
        async fn stage(&self, mut staged: StagedIndex) -> Result<Arc<dyn CodeIndex>> {
            if let Some(first) = staged.covered.iter().next().cloned() {
                staged.covered.remove(&first);
                staged.entries.retain(|e| e.doc_id != first);
            }
            self.0.stage(staged).await
        }
        async fn promote(&self, active: u64, previous: Option<u64>) -> Result<()> {
            self.0.promote(active, previous).await
        }
        async fn discard(&self, generation: u64) -> Result<()> {
            self.0.discard(generation).await
        }
        async fn open(&self) -> Result<Option<crate::index_backend::PersistedGenerations>> {
            Ok(None)
        }
    }

    #[tokio::test]
    async fn test_inconsistency_beyond_tolerance_keeps_active() {
        let store = Arc::new(InMemoryDocumentStore::new());
        store.insert("a", None, "HRD-442");
        store.insert("b", None, "EX-3");
        let backend: Arc<dyn IndexBackend> = Arc::new(LossyBackend(MemoryIndexBackend::new()));

        let strict = coordinator(store.clone(), backend.clone(), 0).await;
        let err = strict.reindex_request().await.unwrap_err();
        assert_eq!(
            err,
            RetrievalError::IndexInconsistency {
                found: 1,
                tolerance: 0
            }
        );
        assert_eq!(strict.active().id, 0);
        assert_eq!(strict.state(), ReindexState::Idle);
        assert!(strict.status().last_error.is_some());

        let lenient = coordinator(store, backend, 1).await;
        let report = lenient.reindex_request().await.unwrap();
        assert_eq!(report.inconsistencies, 1);
    }

    #[tokio::test]
    async fn test_concurrent_reindex_is_rejected() {
        let store = Arc::new(InMemoryDocumentStore::new());
        let c = coordinator(store, Arc::new(MemoryIndexBackend::new()), 0).await;
        let guard = c.try_begin().unwrap();
        assert_eq!(
            c.reindex_request().await.unwrap_err(),
            RetrievalError::ReindexInProgress
        );
        assert_eq!(c.rollback().await, Err(RetrievalError::ReindexInProgress));
        drop(guard);
        assert!(c.reindex_request().await.is_ok());
    }
}
