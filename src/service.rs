//! The retrieval service: cache in front of fusion, plus reindex control.
//!
//! Request path:
//!
//! ```text
//! search ─► capture active generation ─► namespace(generation, fingerprint)
//!        ─► QueryCache::get_or_compute ─► FusionRetriever::search_in
//! ```
//!
//! The generation is captured once, before the cache lookup, and the same
//! snapshot is both the cache namespace and the index the retriever reads.
//! A result computed against generation N can therefore only ever be
//! stored under N's namespace.

use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use sqlx::SqlitePool;

use coderank_core::models::RetrievalResult;
use coderank_core::normalize::normalize_text;
use coderank_core::stage1::Stage1Retriever;
use coderank_core::store::DocumentStore;

use crate::cache::{namespace, CacheKey, QueryCache};
use crate::config::{Config, IndexBackendKind};
use crate::error::RetrievalError;
use crate::index_backend::{IndexBackend, MemoryIndexBackend};
use crate::metrics::{MetricsSnapshot, RetrievalMetrics};
use crate::reindex::{ReindexCoordinator, ReindexReport, ValidationReport};
use crate::retriever::{EnrichedResult, FusionRetriever, SearchMode};
use crate::sqlite_index::SqliteIndexBackend;
use crate::sqlite_store::SqliteDocumentStore;
use crate::stage1::create_stage1;
use crate::{db, migrate};

pub struct RetrievalService {
    config: Config,
    fingerprint: String,
    retriever: FusionRetriever,
    cache: QueryCache,
    coordinator: ReindexCoordinator,
    metrics: Arc<RetrievalMetrics>,
    pool: Option<SqlitePool>,
}

impl RetrievalService {
    /// Assemble a service from explicit parts.
    pub async fn new(
        config: Config,
        store: Arc<dyn DocumentStore>,
        stage1: Arc<dyn Stage1Retriever>,
        backend: Arc<dyn IndexBackend>,
    ) -> Result<Self> {
        let metrics = Arc::new(RetrievalMetrics::new());
        let coordinator = ReindexCoordinator::open(
            store.clone(),
            backend,
            config.index.max_inconsistencies,
            metrics.clone(),
        )
        .await?;
        let retriever = FusionRetriever::new(
            config.retrieval.clone(),
            stage1,
            store,
            coordinator.active_handle(),
            metrics.clone(),
        );
        Ok(Self {
            fingerprint: config.retrieval.fingerprint(),
            cache: QueryCache::from_config(&config.cache),
            config,
            retriever,
            coordinator,
            metrics,
            pool: None,
        })
    }

    /// Open the SQLite database named by `config` and wire every component
    /// from it.
    pub async fn open(config: &Config) -> Result<Self> {
        let pool = db::connect(config).await?;
        migrate::migrate_pool(&pool).await?;

        let store: Arc<dyn DocumentStore> = Arc::new(SqliteDocumentStore::new(pool.clone()));
        let stage1 = create_stage1(config, &pool)?;
        let backend: Arc<dyn IndexBackend> = match config.index.backend {
            IndexBackendKind::Sqlite => Arc::new(SqliteIndexBackend::new(pool.clone())),
            IndexBackendKind::Memory => Arc::new(MemoryIndexBackend::new()),
        };

        let mut service = Self::new(config.clone(), store, stage1, backend).await?;
        service.pool = Some(pool);
        Ok(service)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn pool(&self) -> Option<&SqlitePool> {
        self.pool.as_ref()
    }

    pub fn cache(&self) -> &QueryCache {
        &self.cache
    }

    pub fn coordinator(&self) -> &ReindexCoordinator {
        &self.coordinator
    }

    pub fn retriever(&self) -> &FusionRetriever {
        &self.retriever
    }

    /// Cached search. `top_k` defaults to `retrieval.final_limit`.
    pub async fn search(
        &self,
        query: &str,
        mode: SearchMode,
        top_k: Option<usize>,
    ) -> Result<Vec<RetrievalResult>, RetrievalError> {
        let started = Instant::now();
        let top_k = top_k.unwrap_or(self.config.retrieval.final_limit).max(1);
        let generation = self.coordinator.active();
        let key = CacheKey::new(
            &normalize_text(query),
            mode,
            top_k,
            &namespace(generation.id, &self.fingerprint),
        );

        let results = self
            .cache
            .get_or_compute(&key, || {
                self.retriever.retrieve(&generation, query, mode, top_k)
            })
            .await;
        self.metrics.record_query(started.elapsed());
        results
    }

    pub async fn search_enriched(
        &self,
        query: &str,
        mode: SearchMode,
        top_k: Option<usize>,
    ) -> Result<Vec<EnrichedResult>, RetrievalError> {
        let results = self.search(query, mode, top_k).await?;
        Ok(self.retriever.enrich(results).await)
    }

    pub async fn reindex(&self) -> Result<ReindexReport, RetrievalError> {
        self.coordinator.reindex_request().await
    }

    pub async fn rollback(&self) -> Result<u64, RetrievalError> {
        self.coordinator.rollback().await
    }

    pub async fn check_consistency(&self) -> Result<ValidationReport, RetrievalError> {
        self.coordinator.check_consistency().await
    }

    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        let cache = self.cache.stats();
        MetricsSnapshot {
            stale_index_entries: self.metrics.stale_index_entries(),
            exact_match_hit_rate: self.metrics.exact_match_hit_rate(),
            avg_query_time_ms: self.metrics.avg_query_time_ms(),
            cache_hit_rate: cache.hit_rate,
            cache_size: cache.size,
            inflight_count: cache.inflight,
            reindex_mutex_state: self.coordinator.state().as_str().to_string(),
            last_reindex_timestamp: self.coordinator.last_reindex_timestamp(),
            active_generation: self.coordinator.active().id,
            counters: self.metrics.counters(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage1::DisabledStage1;
    use coderank_core::models::MatchType;
    use coderank_core::store::memory::InMemoryDocumentStore;

    async fn service(store: Arc<InMemoryDocumentStore>) -> RetrievalService {
        RetrievalService::new(
            Config::minimal("unused.sqlite"),
            store,
            Arc::new(DisabledStage1),
            Arc::new(MemoryIndexBackend::new()),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_reindex_changes_cache_namespace() {
        let store = Arc::new(InMemoryDocumentStore::new());
        store.insert("old", None, "HRD-442 v1");
        let svc = service(store.clone()).await;
        svc.reindex().await.unwrap();

        let first = svc.search("HRD-442", SearchMode::Fused, None).await.unwrap();
        assert_eq!(first[0].doc_id(), "old");
        assert_eq!(first[0].match_type(), MatchType::ExactCode);
        // Served from cache.
        svc.search("HRD-442", SearchMode::Fused, None).await.unwrap();
        assert_eq!(svc.cache().stats().hits, 1);

        store.remove("old");
        store.insert("new", None, "HRD-442 v2");
        svc.reindex().await.unwrap();

        let second = svc.search("HRD-442", SearchMode::Fused, None).await.unwrap();
        let ids: Vec<&str> = second.iter().map(|r| r.doc_id()).collect();
        assert_eq!(ids, vec!["new"]);
    }

    #[tokio::test]
    async fn test_unavailable_is_not_cached() {
        let store = Arc::new(InMemoryDocumentStore::new());
        let svc = service(store).await;
        let err = svc
            .search("camera", SearchMode::Stage1, None)
            .await
            .unwrap_err();
        assert!(matches!(err, RetrievalError::Unavailable { .. }));
        assert!(svc.cache().is_empty());
    }

    #[tokio::test]
    async fn test_metrics_snapshot() {
        let store = Arc::new(InMemoryDocumentStore::new());
        store.insert("a", None, "EX-3");
        let svc = service(store).await;
        svc.reindex().await.unwrap();
        svc.search("EX-3", SearchMode::Fused, None).await.unwrap();
        svc.search("EX-3", SearchMode::Fused, None).await.unwrap();

        let m = svc.metrics_snapshot();
        assert_eq!(m.active_generation, 1);
        assert_eq!(m.reindex_mutex_state, "idle");
        assert_eq!(m.cache_size, 1);
        assert_eq!(m.cache_hit_rate, 0.5);
        assert_eq!(m.exact_match_hit_rate, 1.0);
        assert_eq!(m.inflight_count, 0);
        assert!(m.last_reindex_timestamp.is_some());
        assert_eq!(m.counters.queries, 2);
    }
}
