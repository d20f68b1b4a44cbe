//! TOML configuration parsing and validation.
//!
//! Every section except `[db]` has defaults, so a minimal config is just:
//!
//! ```toml
//! [db]
//! path = "./data/crk.sqlite"
//! ```
//!
//! The `[retrieval]` section doubles as the retrieval policy fingerprint:
//! [`RetrievalConfig::fingerprint`] hashes it, and the query cache scopes
//! its entries by that hash so a policy change never serves stale results.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub stage1: Stage1Config,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct RetrievalConfig {
    #[serde(default = "default_rrf_k")]
    pub rrf_k: f64,
    /// Feature flag: `false` turns the retriever into a pure Stage 1 retriever.
    #[serde(default = "default_true")]
    pub exact_match_enabled: bool,
    #[serde(default = "default_exact_max_results")]
    pub exact_max_results: usize,
    #[serde(default = "default_final_limit")]
    pub final_limit: usize,
    #[serde(default = "default_stage1_candidate_k")]
    pub stage1_candidate_k: usize,
    #[serde(default = "default_stage0_timeout_ms")]
    pub stage0_timeout_ms: u64,
    #[serde(default = "default_stage1_timeout_ms")]
    pub stage1_timeout_ms: u64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            rrf_k: default_rrf_k(),
            exact_match_enabled: true,
            exact_max_results: default_exact_max_results(),
            final_limit: default_final_limit(),
            stage1_candidate_k: default_stage1_candidate_k(),
            stage0_timeout_ms: default_stage0_timeout_ms(),
            stage1_timeout_ms: default_stage1_timeout_ms(),
        }
    }
}

impl RetrievalConfig {
    /// Hex SHA-256 of the JSON form of this section.
    pub fn fingerprint(&self) -> String {
        let json = serde_json::to_vec(self).unwrap_or_default();
        hex::encode(Sha256::digest(&json))
    }

    pub fn stage0_timeout(&self) -> Duration {
        Duration::from_millis(self.stage0_timeout_ms)
    }

    pub fn stage1_timeout(&self) -> Duration {
        Duration::from_millis(self.stage1_timeout_ms)
    }
}

fn default_rrf_k() -> f64 {
    coderank_core::fusion::DEFAULT_RRF_K
}
fn default_true() -> bool {
    true
}
fn default_exact_max_results() -> usize {
    20
}
fn default_final_limit() -> usize {
    10
}
fn default_stage1_candidate_k() -> usize {
    50
}
fn default_stage0_timeout_ms() -> u64 {
    500
}
fn default_stage1_timeout_ms() -> u64 {
    3000
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_cache_capacity")]
    pub capacity: usize,
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default = "default_inflight_wait_ms")]
    pub inflight_wait_ms: u64,
    /// Lifetime of results computed while a stage was failing.
    #[serde(default = "default_degraded_ttl_ms")]
    pub degraded_ttl_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: default_cache_capacity(),
            ttl_secs: default_ttl_secs(),
            inflight_wait_ms: default_inflight_wait_ms(),
            degraded_ttl_ms: default_degraded_ttl_ms(),
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn inflight_wait(&self) -> Duration {
        Duration::from_millis(self.inflight_wait_ms)
    }

    pub fn degraded_ttl(&self) -> Duration {
        Duration::from_millis(self.degraded_ttl_ms)
    }
}

fn default_cache_capacity() -> usize {
    1024
}
fn default_ttl_secs() -> u64 {
    300
}
fn default_inflight_wait_ms() -> u64 {
    10_000
}
fn default_degraded_ttl_ms() -> u64 {
    5_000
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum IndexBackendKind {
    Sqlite,
    Memory,
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    #[serde(default = "default_backend")]
    pub backend: IndexBackendKind,
    /// Largest symmetric difference between store and staged index that
    /// still allows promotion.
    #[serde(default)]
    pub max_inconsistencies: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            max_inconsistencies: 0,
        }
    }
}

fn default_backend() -> IndexBackendKind {
    IndexBackendKind::Sqlite
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Stage1Provider {
    Fts,
    Http,
    Disabled,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Stage1Config {
    #[serde(default = "default_stage1_provider")]
    pub provider: Stage1Provider,
    #[serde(default)]
    pub url: Option<String>,
}

impl Default for Stage1Config {
    fn default() -> Self {
        Self {
            provider: default_stage1_provider(),
            url: None,
        }
    }
}

fn default_stage1_provider() -> Stage1Provider {
    Stage1Provider::Fts
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7340".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            include_globs: default_include_globs(),
            exclude_globs: Vec::new(),
        }
    }
}

fn default_include_globs() -> Vec<String> {
    vec!["**/*.md".to_string(), "**/*.txt".to_string()]
}

impl Config {
    /// Config for an in-memory deployment rooted at `db_path`.
    pub fn minimal(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db: DbConfig {
                path: db_path.into(),
            },
            retrieval: RetrievalConfig::default(),
            cache: CacheConfig::default(),
            index: IndexConfig::default(),
            stage1: Stage1Config::default(),
            server: ServerConfig::default(),
            ingest: IngestConfig::default(),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

/// Reject configurations that would make retrieval or caching meaningless.
pub fn validate(config: &Config) -> Result<()> {
    let r = &config.retrieval;
    if !(r.rrf_k.is_finite() && r.rrf_k > 0.0) {
        anyhow::bail!("retrieval.rrf_k must be a positive number");
    }
    if r.final_limit < 1 {
        anyhow::bail!("retrieval.final_limit must be >= 1");
    }
    if r.exact_max_results < 1 {
        anyhow::bail!("retrieval.exact_max_results must be >= 1");
    }
    if r.stage1_candidate_k < 1 {
        anyhow::bail!("retrieval.stage1_candidate_k must be >= 1");
    }
    if r.stage0_timeout_ms == 0 || r.stage1_timeout_ms == 0 {
        anyhow::bail!("retrieval stage timeouts must be > 0");
    }

    if config.cache.capacity < 1 {
        anyhow::bail!("cache.capacity must be >= 1");
    }
    if config.cache.inflight_wait_ms == 0 {
        anyhow::bail!("cache.inflight_wait_ms must be > 0");
    }

    if config.stage1.provider == Stage1Provider::Http && config.stage1.url.is_none() {
        anyhow::bail!("stage1.url must be specified when provider is 'http'");
    }

    Ok(())
}
