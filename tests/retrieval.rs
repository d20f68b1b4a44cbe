//! End-to-end retrieval tests against a real SQLite database.
//!
//! Each test builds a config from a TOML string pointing at a temp
//! directory, ingests a small corpus from disk, reindexes and queries the
//! service the way the CLI and HTTP server do.

use anyhow::Result;
use async_trait::async_trait;
use coderank::config::{self, Config};
use coderank::error::RetrievalError;
use coderank::index_backend::MemoryIndexBackend;
use coderank::ingest::ingest_directory;
use coderank::retriever::SearchMode;
use coderank::service::RetrievalService;
use coderank_core::models::MatchType;
use coderank_core::stage1::{Stage1Hit, Stage1Retriever};
use coderank_core::store::memory::InMemoryDocumentStore;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn test_config(tmp: &TempDir, stage1_provider: &str) -> Config {
    let db_path = tmp.path().join("data").join("crk.sqlite");
    let config_content = format!(
        r#"
[db]
path = "{}"

[stage1]
provider = "{}"

[ingest]
include_globs = ["**/*.txt", "**/*.md"]
"#,
        db_path.display(),
        stage1_provider
    );
    let config: Config = toml::from_str(&config_content).unwrap();
    config::validate(&config).unwrap();
    config
}

fn write_corpus(dir: &Path, files: &[(&str, &str)]) {
    for (name, body) in files {
        let path = dir.join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, body).unwrap();
    }
}

async fn open_with_corpus(
    tmp: &TempDir,
    provider: &str,
    files: &[(&str, &str)],
) -> RetrievalService {
    let corpus = tmp.path().join("corpus");
    std::fs::create_dir_all(&corpus).unwrap();
    write_corpus(&corpus, files);

    let config = test_config(tmp, provider);
    let service = RetrievalService::open(&config).await.unwrap();
    ingest_directory(service.pool().unwrap(), &config.ingest, &corpus)
        .await
        .unwrap();
    service.reindex().await.unwrap();
    service
}

fn ids(results: &[coderank_core::models::RetrievalResult]) -> Vec<&str> {
    results.iter().map(|r| r.doc_id()).collect()
}

#[tokio::test]
async fn test_boundary_correctness_end_to_end() {
    let tmp = TempDir::new().unwrap();
    let service = open_with_corpus(
        &tmp,
        "fts",
        &[
            ("a.txt", "Cooling fan for HRD-442 units."),
            ("b.txt", "Cooling fan for HRD-4420 units."),
        ],
    )
    .await;

    let results = service
        .search("HRD-442", SearchMode::Exact, None)
        .await
        .unwrap();
    assert_eq!(ids(&results), vec!["a.txt"]);
    assert_eq!(results[0].match_type(), MatchType::ExactCode);
}

#[tokio::test]
async fn test_filename_fallback_when_no_exact_hit() {
    let tmp = TempDir::new().unwrap();
    let service = open_with_corpus(
        &tmp,
        "fts",
        &[("manuals/SM_100.md", "service guide without the code in it")],
    )
    .await;

    // `SM_100` is not read as a code, but its padded form ` SM 100 MD `
    // holds the ` SM 100 ` token sequence.
    let results = service
        .search("SM 100", SearchMode::Exact, None)
        .await
        .unwrap();
    assert_eq!(ids(&results), vec!["manuals/SM_100.md"]);
    assert_eq!(results[0].match_type(), MatchType::FilenameMatch);
    assert_eq!(results[0].score(), 0.7);
}

#[tokio::test]
async fn test_stage1_failure_keeps_exact_hits() {
    let tmp = TempDir::new().unwrap();
    let service = open_with_corpus(
        &tmp,
        "disabled",
        &[
            ("xrn.txt", "XRN-1620B2 compressor teardown"),
            ("other.txt", "compressor basics"),
        ],
    )
    .await;

    let results = service
        .search("XRN-1620B2 수리", SearchMode::Fused, None)
        .await
        .unwrap();
    assert_eq!(ids(&results), vec!["xrn.txt"]);
    assert_eq!(results[0].match_type(), MatchType::ExactCode);
    assert_eq!(results[0].rank(), 1);
    assert_eq!(results[0].score(), 1.0);
}

#[tokio::test]
async fn test_ex3_scenario_with_fts() {
    let tmp = TempDir::new().unwrap();
    let mut files: Vec<(String, String)> = (1..=9)
        .map(|i| {
            (
                format!("ex3/doc{i}.txt"),
                format!("EX-3 camera service bulletin {i}"),
            )
        })
        .collect();
    files.push(("misc/camera.txt".into(), "camera camera camera".into()));
    files.push(("misc/ex30.txt".into(), "EX-30 camera".into()));
    let refs: Vec<(&str, &str)> = files
        .iter()
        .map(|(a, b)| (a.as_str(), b.as_str()))
        .collect();
    let service = open_with_corpus(&tmp, "fts", &refs).await;

    let exact = service
        .search("EX-3 카메라 수리", SearchMode::Exact, Some(20))
        .await
        .unwrap();
    let exact_ids: BTreeSet<&str> = exact.iter().map(|r| r.doc_id()).collect();
    let expected: BTreeSet<String> = (1..=9).map(|i| format!("ex3/doc{i}.txt")).collect();
    assert_eq!(
        exact_ids,
        expected.iter().map(String::as_str).collect::<BTreeSet<_>>()
    );
    assert!(exact.iter().all(|r| r.match_type() == MatchType::ExactCode));

    let fused = service
        .search("EX-3 camera", SearchMode::Fused, Some(20))
        .await
        .unwrap();
    let last_exact = fused
        .iter()
        .rposition(|r| r.match_type() == MatchType::ExactCode)
        .unwrap();
    if let Some(first_other) = fused
        .iter()
        .position(|r| r.match_type() != MatchType::ExactCode)
    {
        assert!(last_exact < first_other);
    }
    assert!(!fused[..=last_exact]
        .iter()
        .any(|r| r.doc_id() == "misc/ex30.txt"));
}

#[tokio::test]
async fn test_empty_query_uses_stage1_only() {
    let tmp = TempDir::new().unwrap();
    let service = open_with_corpus(&tmp, "fts", &[("a.txt", "HRD-442")]).await;
    let results = service.search("", SearchMode::Fused, None).await.unwrap();
    assert!(results.is_empty());

    let tmp = TempDir::new().unwrap();
    let service = open_with_corpus(&tmp, "disabled", &[("a.txt", "HRD-442")]).await;
    let err = service
        .search("", SearchMode::Fused, None)
        .await
        .unwrap_err();
    assert!(matches!(err, RetrievalError::Unavailable { .. }));
}

#[tokio::test]
async fn test_generation_survives_restart() {
    let tmp = TempDir::new().unwrap();
    let service = open_with_corpus(&tmp, "fts", &[("a.txt", "HRD-442")]).await;
    service.reindex().await.unwrap();
    assert_eq!(service.coordinator().active().id, 2);
    drop(service);

    let reopened = RetrievalService::open(&test_config(&tmp, "fts"))
        .await
        .unwrap();
    let status = reopened.coordinator().status();
    assert_eq!(status.active_generation, 2);
    assert_eq!(status.previous_generation, Some(1));
    let results = reopened
        .search("hrd442", SearchMode::Exact, None)
        .await
        .unwrap();
    assert_eq!(ids(&results), vec!["a.txt"]);

    assert_eq!(reopened.rollback().await.unwrap(), 1);
    assert_eq!(reopened.reindex().await.unwrap().generation, 3);
}

#[tokio::test]
async fn test_check_consistency_after_store_drift() {
    let tmp = TempDir::new().unwrap();
    let service = open_with_corpus(&tmp, "fts", &[("a.txt", "HRD-442"), ("b.txt", "EX-3")]).await;
    assert_eq!(service.check_consistency().await.unwrap().missing.len(), 0);

    let corpus = tmp.path().join("corpus");
    std::fs::remove_file(corpus.join("b.txt")).unwrap();
    ingest_directory(
        service.pool().unwrap(),
        &service.config().ingest,
        &corpus,
    )
    .await
    .unwrap();

    let report = service.check_consistency().await.unwrap();
    assert_eq!(report.orphaned, vec!["b.txt".to_string()]);
    assert_eq!(service.metrics_snapshot().stale_index_entries, 1);

    service.reindex().await.unwrap();
    assert_eq!(service.metrics_snapshot().stale_index_entries, 0);
}

// ─── Concurrency ────────────────────────────────────────────────────

/// Stage 1 that counts calls and answers slowly.
struct CountingStage1 {
    calls: AtomicUsize,
}

#[async_trait]
impl Stage1Retriever for CountingStage1 {
    fn name(&self) -> &str {
        "counting"
    }

    async fn search(&self, _query: &str, _top_k: usize) -> Result<Vec<Stage1Hit>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(150)).await;
        Ok(vec![Stage1Hit {
            doc_id: "s1".to_string(),
            score: 3.0,
            rank: 1,
        }])
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_identical_queries_compute_once() {
    let store = Arc::new(InMemoryDocumentStore::new());
    store.insert("a", None, "HRD-442");
    let stage1 = Arc::new(CountingStage1 {
        calls: AtomicUsize::new(0),
    });
    let service = Arc::new(
        RetrievalService::new(
            Config::minimal("unused.sqlite"),
            store,
            stage1.clone(),
            Arc::new(MemoryIndexBackend::new()),
        )
        .await
        .unwrap(),
    );
    service.reindex().await.unwrap();

    let mut tasks = Vec::new();
    for _ in 0..12 {
        let service = service.clone();
        tasks.push(tokio::spawn(async move {
            service.search("HRD-442", SearchMode::Fused, None).await
        }));
    }
    for t in tasks {
        let results = t.await.unwrap().unwrap();
        assert_eq!(results.len(), 2);
    }
    assert_eq!(stage1.calls.load(Ordering::SeqCst), 1);
    assert_eq!(service.metrics_snapshot().inflight_count, 0);
}

/// Stage 1 that fails until switched on.
struct FlakyStage1 {
    up: AtomicBool,
}

#[async_trait]
impl Stage1Retriever for FlakyStage1 {
    fn name(&self) -> &str {
        "flaky"
    }

    async fn search(&self, _query: &str, _top_k: usize) -> Result<Vec<Stage1Hit>> {
        if !self.up.load(Ordering::SeqCst) {
            anyhow::bail!("connection refused");
        }
        Ok(vec![Stage1Hit {
            doc_id: "manual".to_string(),
            score: 7.5,
            rank: 1,
        }])
    }
}

#[tokio::test]
async fn test_stage1_recovery_is_not_masked_by_cache() {
    let store = Arc::new(InMemoryDocumentStore::new());
    store.insert("a", None, "HRD-442");
    let stage1 = Arc::new(FlakyStage1 {
        up: AtomicBool::new(false),
    });
    let mut config = Config::minimal("unused.sqlite");
    config.cache.degraded_ttl_ms = 0;
    let service = RetrievalService::new(
        config,
        store,
        stage1.clone(),
        Arc::new(MemoryIndexBackend::new()),
    )
    .await
    .unwrap();
    service.reindex().await.unwrap();

    let degraded = service
        .search("HRD-442", SearchMode::Fused, None)
        .await
        .unwrap();
    assert_eq!(ids(&degraded), vec!["a"]);

    stage1.up.store(true, Ordering::SeqCst);
    let recovered = service
        .search("HRD-442", SearchMode::Fused, None)
        .await
        .unwrap();
    let mut got = ids(&recovered);
    got.sort();
    assert_eq!(got, vec!["a", "manual"]);

    // The healthy answer is cached for the full TTL.
    service
        .search("HRD-442", SearchMode::Fused, None)
        .await
        .unwrap();
    assert_eq!(service.cache().stats().hits, 1);
}

#[tokio::test]
async fn test_codeless_query_fails_when_stage1_is_down() {
    let tmp = TempDir::new().unwrap();
    let service = open_with_corpus(&tmp, "disabled", &[("a.txt", "camera repair HRD-442")]).await;
    let err = service
        .search("camera repair", SearchMode::Fused, None)
        .await
        .unwrap_err();
    assert!(matches!(err, RetrievalError::Unavailable { .. }));
    assert!(service.cache().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_reads_see_whole_generations_during_reindex() {
    let store = Arc::new(InMemoryDocumentStore::new());
    for i in 0..50 {
        store.insert(&format!("old{i:02}"), None, "HRD-442 generation one");
    }
    let mut config = Config::minimal("unused.sqlite");
    config.retrieval.exact_max_results = 200;
    let service = Arc::new(
        RetrievalService::new(
            config,
            store.clone(),
            Arc::new(coderank::stage1::DisabledStage1),
            Arc::new(MemoryIndexBackend::new()),
        )
        .await
        .unwrap(),
    );
    service.reindex().await.unwrap();

    for i in 0..50 {
        store.remove(&format!("old{i:02}"));
        store.insert(&format!("new{i:02}"), None, "HRD-442 generation two");
    }

    let reader = {
        let service = service.clone();
        tokio::spawn(async move {
            for _ in 0..200 {
                let generation = service.coordinator().active();
                let results = service
                    .retriever()
                    .search_in(&generation, "HRD-442", SearchMode::Exact, 200)
                    .await
                    .unwrap();
                let old = results.iter().filter(|r| r.doc_id().starts_with("old")).count();
                let new = results.iter().filter(|r| r.doc_id().starts_with("new")).count();
                assert!(
                    (old == 50 && new == 0) || (old == 0 && new == 50),
                    "torn read: {old} old, {new} new"
                );
                tokio::task::yield_now().await;
            }
        })
    };

    service.reindex().await.unwrap();
    reader.await.unwrap();
    assert_eq!(service.coordinator().active().id, 2);
}
